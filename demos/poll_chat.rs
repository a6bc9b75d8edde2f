//! Runs the broker against an in-process chat source and prints every event it emits.
//!
//! The source and token endpoint are local stand-ins, so the demo needs no credentials. The
//! poll delay comes from the application's quota settings exactly as it would in production.

// std
use std::{
	env,
	sync::{
		Arc,
		atomic::{AtomicU32, Ordering},
	},
	time::Duration as StdDuration,
};
// crates.io
use color_eyre::Result;
use futures::stream;
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use url::Url;
// self
use livechat_broker::{
	auth::{TargetId, TokenRecord, TokenSecret},
	broker::{BrokerOptions, ChatBroker},
	config::BrokerConfig,
	events::ChannelSink,
	lifecycle::{ApplicationCredentials, TokenEndpoint, TokenEndpointFuture},
	provider::ProviderDescriptor,
	registry::{NewApplication, QuotaSettings},
	store::FileStore,
	stream::{
		ChatAuthor, ChatMessage, MessageBatch, MessageSender, MessageSource, MessageStream,
		SendFuture, SourceFuture, StreamRequest,
	},
};

struct LocalEndpoint;
impl TokenEndpoint for LocalEndpoint {
	fn exchange_code<'a>(
		&'a self,
		credentials: &'a ApplicationCredentials,
		_code: &'a str,
	) -> TokenEndpointFuture<'a> {
		Box::pin(async move { issue(&credentials.client_id) })
	}

	fn refresh<'a>(
		&'a self,
		credentials: &'a ApplicationCredentials,
		_refresh_token: &'a TokenSecret,
	) -> TokenEndpointFuture<'a> {
		Box::pin(async move { issue(&credentials.client_id) })
	}
}

#[derive(Default)]
struct LocalChat(AtomicU32);
impl MessageSource for LocalChat {
	fn stream_messages(&self, request: StreamRequest) -> SourceFuture<'_> {
		let page = self.0.fetch_add(1, Ordering::SeqCst);

		Box::pin(async move {
			let author = ChatAuthor {
				channel_id: format!("viewer-{}", page % 2),
				display_name: format!("Viewer {}", page % 2),
				..Default::default()
			};
			let batch = MessageBatch {
				items: vec![ChatMessage::text(
					format!("m-{page}"),
					author,
					format!("message {page} in {}", request.target_id),
				)],
				next_continuation_token: Some(format!("page-{}", page + 1)),
				session_ended_at: None,
			};
			let batches: MessageStream = Box::pin(stream::iter([Ok(batch)]));

			Ok(batches)
		})
	}
}

struct LocalSender;
impl MessageSender for LocalSender {
	fn send_message<'a>(&'a self, target_id: &'a TargetId, text: &'a str) -> SendFuture<'a> {
		Box::pin(async move {
			println!("[{target_id}] bot: {text}");

			true
		})
	}
}

fn issue(client_id: &str) -> livechat_broker::error::Result<TokenRecord> {
	Ok(TokenRecord::builder()
		.access_token(format!("{client_id}-access"))
		.issued_at(OffsetDateTime::now_utc())
		.expires_in(Duration::hours(1))
		.build()
		.map_err(livechat_broker::error::ConfigError::from)?)
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let polls = env::args().nth(1).map(|raw| raw.parse::<u32>()).transpose()?.unwrap_or(3);
	let store = Arc::new(FileStore::open(env::temp_dir().join("livechat-broker-poll-demo"))?);
	let descriptor = ProviderDescriptor::youtube(Url::parse("http://localhost:8080/callback")?)?;
	let (events_tx, mut events_rx) = mpsc::unbounded_channel();
	let mut options = BrokerOptions::new(
		BrokerConfig::default(),
		store,
		descriptor,
		Arc::new(LocalEndpoint),
		Arc::new(LocalChat::default()),
		Arc::new(LocalSender),
	);

	options.events = Arc::new(ChannelSink::new(events_tx));

	let broker = ChatBroker::new(options)?;

	broker.initialize().await;

	let app = match broker.registry().list().into_iter().find(|app| app.name == "Poll demo") {
		Some(app) => app,
		None =>
			broker
				.add_application(NewApplication {
					name: "Poll demo".into(),
					client_id: "poll-demo".into(),
					client_secret: "poll-demo-secret".into(),
					// A generous budget keeps the delay short enough to watch.
					quota_settings: QuotaSettings {
						daily_quota: 1_000_000,
						max_active_hours: 24.,
						..Default::default()
					},
				})
				.await?,
	};

	broker.registry().set_refresh_token(&app.id, TokenSecret::new("local-refresh")).await?;
	broker.lifecycle().refresh_application_token(&app.id).await;
	broker.set_active_application(&app.id).await?;
	broker.connect(TargetId::new("demo-chat")?).await?;

	let delay = broker.stream().status().delay.unwrap_or(StdDuration::from_secs(1));

	println!("Polling every {delay:?} for {polls} cycles.");

	let mut seen = 0;

	while seen < polls {
		let Some((source, event)) = events_rx.recv().await else { break };

		println!("[{source}] {}: {event:?}", event.name());

		if event.name() == "chat-message" {
			seen += 1;
		}
	}

	broker.send_message("Thanks for chatting!").await?;

	if let Some(usage) = broker.ledger().quota_usage(&app.id) {
		println!("Quota used today: {} units.", usage.quota_units_used);
	}

	broker.shutdown().await;

	Ok(())
}
