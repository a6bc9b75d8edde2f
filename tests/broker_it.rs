#![cfg(feature = "test")]

// std
use std::sync::atomic::{AtomicUsize, Ordering};
// self
use livechat_broker::{
	_preludet::*,
	auth::{ApplicationId, ProviderId, TargetId, TokenSecret},
	broker::{BrokerOptions, ChatBroker},
	config::BrokerConfig,
	events::{BrokerEvent, StreamStopReason},
	provider::ProviderDescriptor,
	quota::STREAM_LIST_UNIT_COST,
	store::MemoryStore,
	stream::{
		ChatAuthor, ChatMessage, ChatSink, ChatSinkError, MessageBatch, MessageSender, SendFuture,
	},
};

#[derive(Default)]
struct CountingSender(AtomicUsize);
impl MessageSender for CountingSender {
	fn send_message<'a>(&'a self, _target_id: &'a TargetId, _text: &'a str) -> SendFuture<'a> {
		self.0.fetch_add(1, Ordering::SeqCst);

		Box::pin(async { true })
	}
}

#[derive(Default)]
struct CollectingSink(Mutex<Vec<(String, bool)>>);
impl ChatSink for CollectingSink {
	fn deliver(
		&self,
		_target_id: &TargetId,
		message: &ChatMessage,
		first_in_session: bool,
	) -> Result<(), ChatSinkError> {
		self.0.lock().push((message.text.clone(), first_in_session));

		Ok(())
	}
}

struct Deployment {
	broker: ChatBroker,
	endpoint: Arc<ScriptedTokenEndpoint>,
	source: Arc<ScriptedSource>,
	events: Arc<RecordingSink>,
}

fn descriptor() -> ProviderDescriptor {
	ProviderDescriptor::builder(ProviderId::new("mock").expect("Provider id should be valid."))
		.authorization_endpoint(
			Url::parse("https://auth.example.com/authorize").expect("Authorize URL should parse."),
		)
		.token_endpoint(Url::parse("https://auth.example.com/token").expect("Token URL should parse."))
		.redirect_uri(Url::parse("http://localhost:8080/callback").expect("Redirect should parse."))
		.scopes(["chat"])
		.build()
		.expect("Descriptor fixture should build.")
}

fn deploy(store: Arc<MemoryStore>) -> Deployment {
	let endpoint = Arc::new(ScriptedTokenEndpoint::default());
	let source = Arc::new(ScriptedSource::default());
	let events = Arc::new(RecordingSink::default());
	let config = BrokerConfig { quota_flush_debounce_secs: 0, ..Default::default() };
	let mut options = BrokerOptions::new(
		config,
		store,
		descriptor(),
		endpoint.clone(),
		source.clone(),
		Arc::new(CountingSender::default()),
	);

	options.clock = manual_clock();
	options.events = events.clone();

	let broker = ChatBroker::new(options).expect("Broker should build.");

	Deployment { broker, endpoint, source, events }
}

async fn settle() {
	for _ in 0..8 {
		tokio::task::yield_now().await;
	}
}

async fn authorize(deployment: &Deployment, name: &str, client_id: &str) -> ApplicationId {
	let registry = deployment.broker.registry();
	let app = registry.add(new_application(name, client_id)).await.expect("Add should succeed.");

	registry
		.set_refresh_token(&app.id, TokenSecret::new(format!("{client_id}-refresh")))
		.await
		.expect("Refresh token should persist.");

	app.id.clone()
}

#[tokio::test(start_paused = true)]
async fn restart_recomputes_readiness_and_keeps_usage() {
	let store = Arc::new(MemoryStore::default());
	let first = deploy(store.clone());
	let target = TargetId::new("live-1").expect("Target id should be valid.");
	let sink = Arc::new(CollectingSink::default());

	first.broker.initialize().await;

	let app = authorize(&first, "Main", "client-1").await;

	first.endpoint.push_refresh(Ok(token_record("access-1", None)));

	assert!(first.broker.lifecycle().refresh_application_token(&app).await);

	first.broker.add_sink(sink.clone());
	first.broker.set_active_application(&app).await.expect("Ready application can be active.");
	first.source.push_cycle(vec![Ok(MessageBatch {
		items: vec![ChatMessage::text(
			"m-1",
			ChatAuthor {
				channel_id: "viewer-1".into(),
				display_name: "Viewer".into(),
				..Default::default()
			},
			"hello",
		)],
		next_continuation_token: Some("page-2".into()),
		session_ended_at: None,
	})]);
	first.broker.connect(target.clone()).await.expect("Connect should succeed.");
	settle().await;

	assert_eq!(sink.0.lock().clone(), vec![("hello".to_owned(), true)]);
	assert!(first.events.names().contains(&"first-chat-message"));

	first.broker.shutdown().await;

	assert!(store.snapshot("quota-tracking.json").is_some(), "Shutdown should flush quota usage.");

	let second = deploy(store.clone());

	second.endpoint.push_refresh(Ok(token_record("access-2", None)));
	second.broker.initialize().await;

	let reloaded = second.broker.registry().get(&app).expect("Application should survive a restart.");

	assert!(reloaded.ready, "Startup refresh should mark the application ready again.");
	assert_eq!(second.broker.registry().active_id(), Some(app.clone()));
	assert_eq!(
		second.broker.ledger().quota_usage(&app).map(|usage| usage.quota_units_used),
		Some(STREAM_LIST_UNIT_COST)
	);
	assert_eq!(second.endpoint.seen_refresh_tokens.lock().clone(), vec!["client-1-refresh".to_owned()]);

	second.broker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_startup_refresh_leaves_the_application_unusable() {
	let store = Arc::new(MemoryStore::default());
	let first = deploy(store.clone());

	first.broker.initialize().await;

	let app = authorize(&first, "Main", "client-1").await;

	first.broker.shutdown().await;

	let second = deploy(store.clone());

	second.endpoint.push_refresh(Err(Error::InvalidGrant { reason: "revoked".into() }));
	second.broker.initialize().await;

	let reloaded = second.broker.registry().get(&app).expect("Application should survive a restart.");

	assert!(!reloaded.ready);
	assert!(!second.broker.registry().can_connect(&app), "A rejected token must be cleared.");
	assert!(second.broker.connect(TargetId::new("live-1").expect("Target id.")).await.is_err());
	assert!(second.events.events().iter().any(|event| matches!(
		event,
		BrokerEvent::ApiError(error) if error.needs_reauthorization
	)));

	let stored = store.snapshot("applications.json").expect("Applications document should exist.");

	assert!(!stored.contains("client-1-refresh"));
}

#[tokio::test(start_paused = true)]
async fn session_end_is_reported_once() {
	let store = Arc::new(MemoryStore::default());
	let deployment = deploy(store);
	let target = TargetId::new("live-1").expect("Target id should be valid.");

	deployment.broker.initialize().await;

	let app = authorize(&deployment, "Main", "client-1").await;

	deployment.endpoint.push_refresh(Ok(token_record("access-1", None)));

	assert!(deployment.broker.lifecycle().refresh_application_token(&app).await);

	deployment.broker.set_active_application(&app).await.expect("Ready application can be active.");
	deployment.source.push_cycle(vec![Ok(MessageBatch {
		session_ended_at: Some(TEST_NOW_MILLIS),
		..Default::default()
	})]);
	deployment.broker.connect(target.clone()).await.expect("Connect should succeed.");
	settle().await;
	tokio::time::sleep(StdDuration::from_secs(120)).await;
	settle().await;

	let stops: Vec<_> = deployment
		.events
		.events()
		.into_iter()
		.filter(|event| matches!(event, BrokerEvent::StreamStopped { .. }))
		.collect();

	assert_eq!(
		stops,
		vec![BrokerEvent::StreamStopped { target_id: target, reason: StreamStopReason::SessionEnded }]
	);
	assert_eq!(deployment.source.calls(), 1);
	assert_eq!(deployment.broker.connected_target(), None);
}
