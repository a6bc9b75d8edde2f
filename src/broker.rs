//! Broker facade wiring the registry, ledger, token lifecycle, and poll loop together.
//!
//! [`ChatBroker`] owns connection orchestration: connecting needs a ready active application,
//! switching applications while live runs stop, token, start in that order and disconnects if
//! any step fails, and readiness reported by the token lifecycle can end a live session. A
//! session the poll loop ends on its own (upstream end, exhausted quota) disconnects the broker.

// self
use crate::{
	_prelude::*,
	auth::{ApplicationId, TargetId, TokenSecret},
	clock::{Clock, SystemClock},
	config::BrokerConfig,
	error::ConfigError,
	events::{
		ApiErrorEvent, BrokerEvent, EventSink, StatusObserver, StreamObserver, StreamStopReason, TracingSink,
	},
	lifecycle::{AccountLookup, TokenEndpoint, TokenLifecycle, TokenLifecycleOptions, TokenProvider},
	provider::{DefaultProviderStrategy, ProviderDescriptor, ProviderStrategy},
	quota::{MESSAGE_INSERT_UNIT_COST, QuotaLedger, QuotaLedgerOptions},
	registry::{ApplicationRegistry, ApplicationUpdate, ApplicationUpdated, NewApplication, RuntimeApplication},
	store::KeyValueStore,
	stream::{ChatSink, MessageSender, MessageSource, StreamManager, StreamOptions},
};

/// Quota label recorded for every sent message.
pub const MESSAGE_INSERT_CALL: &str = "liveChatMessages.insert";

/// Collaborators of a [`ChatBroker`].
pub struct BrokerOptions {
	/// Operational settings.
	pub config: BrokerConfig,
	/// Backing store of both documents.
	pub store: Arc<dyn KeyValueStore>,
	/// Wall clock.
	pub clock: Arc<dyn Clock>,
	/// Provider descriptor shared by every application.
	pub descriptor: ProviderDescriptor,
	/// Provider quirks and error classification.
	pub strategy: Arc<dyn ProviderStrategy>,
	/// Provider token endpoint.
	pub endpoint: Arc<dyn TokenEndpoint>,
	/// Optional account lookup after authorization.
	pub account_lookup: Option<Arc<dyn AccountLookup>>,
	/// Upstream chat reader.
	pub source: Arc<dyn MessageSource>,
	/// Upstream chat writer.
	pub sender: Arc<dyn MessageSender>,
	/// Receives every broker event.
	pub events: Arc<dyn EventSink>,
}
impl BrokerOptions {
	/// Options with the system clock, the default strategy, no account lookup, and events
	/// logged through `tracing`.
	pub fn new(
		config: BrokerConfig,
		store: Arc<dyn KeyValueStore>,
		descriptor: ProviderDescriptor,
		endpoint: Arc<dyn TokenEndpoint>,
		source: Arc<dyn MessageSource>,
		sender: Arc<dyn MessageSender>,
	) -> Self {
		Self {
			config,
			store,
			clock: Arc::new(SystemClock),
			descriptor,
			strategy: Arc::new(DefaultProviderStrategy),
			endpoint,
			account_lookup: None,
			source,
			sender,
			events: Arc::new(TracingSink),
		}
	}
}

/// Live chat broker; clones share state.
#[derive(Clone)]
pub struct ChatBroker(Arc<BrokerInner>);
impl ChatBroker {
	/// Wires every component; call [`ChatBroker::initialize`] before connecting.
	pub fn new(options: BrokerOptions) -> Result<Self> {
		options.config.validate()?;

		let timezone = options.config.timezone()?;
		let BrokerOptions {
			config,
			store,
			clock,
			descriptor,
			strategy,
			endpoint,
			account_lookup,
			source,
			sender,
			events,
		} = options;
		let source_id = config.event_source_id.clone();
		let registry = Arc::new(ApplicationRegistry::new(store.clone(), config.applications_file.clone()));
		let ledger = QuotaLedger::new(QuotaLedgerOptions {
			store,
			path: config.quota_file.clone(),
			clock: clock.clone(),
			timezone,
			profiles: registry.clone(),
			events: events.clone(),
			source_id: source_id.clone(),
			debounce: config.quota_flush_debounce(),
		});
		let inner = Arc::new_cyclic(|weak: &Weak<BrokerInner>| {
			let watch = Arc::new(SessionWatch(weak.clone()));
			let stream = StreamManager::new(StreamOptions {
				source,
				ledger: ledger.clone(),
				registry: registry.clone(),
				clock: clock.clone(),
				events: events.clone(),
				source_id: source_id.clone(),
				mirror_errors_to_chat_feed: config.mirror_errors_to_chat_feed,
				observer: Some(watch.clone()),
			});
			let lifecycle = TokenLifecycle::new(TokenLifecycleOptions {
				registry: registry.clone(),
				endpoint,
				descriptor,
				strategy,
				account_lookup,
				events: events.clone(),
				observer: Some(watch),
				clock,
				source_id: source_id.clone(),
				refresh_interval: config.refresh_interval(),
				preemptive_window: config.token_preemptive_window(),
			});

			BrokerInner {
				config,
				registry,
				ledger,
				lifecycle,
				stream,
				sender,
				events,
				connection: Mutex::new(None),
			}
		});

		Ok(Self(inner))
	}

	/// Loads both documents, starts token managers, and refreshes every authorized
	/// application once so readiness reflects this process.
	pub async fn initialize(&self) {
		let inner = &self.0;

		inner.registry.load().await;
		inner.ledger.initialize().await;

		let applications = inner.registry.list();

		inner.lifecycle.initialize(&applications).await;

		for app in applications.iter().filter(|app| app.is_connectable()) {
			inner.lifecycle.refresh_application_token(&app.id).await;
		}

		tracing::info!(
			applications = applications.len(),
			active = ?inner.registry.active_id(),
			"Broker initialized."
		);
	}

	/// Application registry.
	pub fn registry(&self) -> &Arc<ApplicationRegistry> {
		&self.0.registry
	}

	/// Quota ledger.
	pub fn ledger(&self) -> &QuotaLedger {
		&self.0.ledger
	}

	/// Token lifecycle.
	pub fn lifecycle(&self) -> &TokenLifecycle {
		&self.0.lifecycle
	}

	/// Poll loop.
	pub fn stream(&self) -> &StreamManager {
		&self.0.stream
	}

	/// Configuration in effect.
	pub fn config(&self) -> &BrokerConfig {
		&self.0.config
	}

	/// Registers a downstream consumer of accepted messages.
	pub fn add_sink(&self, sink: Arc<dyn ChatSink>) {
		self.0.stream.add_sink(sink);
	}

	/// Chat currently connected, if any.
	pub fn connected_target(&self) -> Option<TargetId> {
		self.0.connection.lock().clone()
	}

	/// Registers an application.
	pub async fn add_application(&self, new: NewApplication) -> Result<RuntimeApplication> {
		self.0.registry.add(new).await
	}

	/// Updates an application; changed credentials drop its token manager and, when it was
	/// live, the connection.
	pub async fn update_application(
		&self,
		application_id: &ApplicationId,
		update: ApplicationUpdate,
	) -> Result<ApplicationUpdated> {
		let was_streaming = self.is_streaming_with(application_id);
		let updated = self.0.registry.update(application_id, update).await?;

		if updated.credentials_changed {
			self.0.lifecycle.clear_application_auth(application_id);

			if was_streaming {
				self.end_session(StreamStopReason::ApplicationNotReady);
			}
		}

		Ok(updated)
	}

	/// Deletes an application along with its token manager and quota record.
	pub async fn delete_application(&self, application_id: &ApplicationId) -> Result<()> {
		if self.is_streaming_with(application_id) {
			self.disconnect();
		}

		self.0.registry.delete(application_id).await?;
		self.0.lifecycle.clear_application_auth(application_id);
		self.0.ledger.remove(application_id);

		Ok(())
	}

	/// Selects a ready application as active without touching a live session.
	pub async fn set_active_application(&self, application_id: &ApplicationId) -> Result<()> {
		let app = self
			.0
			.registry
			.get(application_id)
			.ok_or_else(|| ConfigError::UnknownApplication { application: application_id.clone() })?;

		if !app.ready {
			return Err(ConfigError::ApplicationNotReady { application: application_id.clone() }.into());
		}

		self.0.registry.set_active(application_id).await?;
		self.emit(BrokerEvent::ApplicationActivated {
			application_id: application_id.clone(),
			application_name: app.name.clone(),
		});

		Ok(())
	}

	/// Connects the active application to `target_id`.
	pub async fn connect(&self, target_id: TargetId) -> Result<()> {
		let app = self.0.registry.active().ok_or(ConfigError::NoActiveApplication)?;

		if !app.ready {
			return Err(ConfigError::ApplicationNotReady { application: app.id.clone() }.into());
		}

		self.start_session(&app.id, target_id).await
	}

	/// Stops the live session; returns whether one was running.
	pub fn disconnect(&self) -> bool {
		let connected = self.0.connection.lock().take().is_some();
		let stopped = self.0.stream.stop_streaming();

		if connected || stopped {
			tracing::info!("Disconnected from live chat.");
		}

		connected || stopped
	}

	/// Makes `application_id` active; while connected the session restarts under it.
	///
	/// The restart is stop, token, start. A failure after the stop leaves the broker
	/// disconnected rather than half-switched.
	pub async fn switch_application(&self, application_id: &ApplicationId) -> Result<()> {
		let target = self.connected_target();

		self.set_active_application(application_id).await?;

		let Some(target) = target else { return Ok(()) };

		self.0.stream.stop_streaming();

		if let Err(e) = self.start_session(application_id, target.clone()).await {
			tracing::error!(application = %application_id, "Application switch failed: {e}");

			self.disconnect();
			self.emit(BrokerEvent::ApiError(ApiErrorEvent {
				application_id: Some(application_id.clone()),
				operation: "switch-application".into(),
				message: e.to_string(),
				needs_reauthorization: false,
				critical: true,
			}));
			self.emit(BrokerEvent::StreamStopped { target_id: target, reason: StreamStopReason::SwitchFailed });

			return Err(e);
		}

		Ok(())
	}

	/// Sends `text` to the connected chat with the active application.
	///
	/// Quota is charged only when the upstream accepts the message.
	pub async fn send_message(&self, text: &str) -> Result<bool> {
		let target = self.connected_target().ok_or(ConfigError::NotConnected)?;
		let app = self.0.registry.active().ok_or(ConfigError::NoActiveApplication)?;

		if text.trim().is_empty() {
			return Ok(false);
		}

		let sent = self.0.sender.send_message(&target, text).await;

		if sent {
			self.0.ledger.record_api_call(&app.id, MESSAGE_INSERT_CALL, MESSAGE_INSERT_UNIT_COST);
		} else {
			tracing::warn!(application = %app.id, target = %target, "Upstream rejected the chat message.");
		}

		Ok(sent)
	}

	/// Stops streaming, tears down token managers, and flushes the ledger.
	pub async fn shutdown(&self) {
		self.disconnect();
		self.0.lifecycle.destroy();

		if let Err(e) = self.0.ledger.flush().await {
			tracing::error!("Failed to flush quota usage on shutdown: {e}");
		}

		tracing::info!("Broker shut down.");
	}

	async fn start_session(&self, application_id: &ApplicationId, target_id: TargetId) -> Result<()> {
		let token = TokenProvider::access_token(&self.0.lifecycle, application_id).await;

		if token.is_empty() {
			self.0.connection.lock().take();

			return Err(ConfigError::ApplicationNotReady { application: application_id.clone() }.into());
		}

		*self.0.connection.lock() = Some(target_id.clone());

		if let Err(e) = self.0.stream.start_streaming(target_id.clone(), TokenSecret::new(token)) {
			self.0.connection.lock().take();

			return Err(e);
		}

		tracing::info!(application = %application_id, target = %target_id, "Connected to live chat.");

		Ok(())
	}

	fn is_streaming_with(&self, application_id: &ApplicationId) -> bool {
		self.0.stream.status().application_id.as_ref() == Some(application_id)
	}

	fn end_session(&self, reason: StreamStopReason) {
		let target = self.0.connection.lock().clone();

		if !self.disconnect() {
			return;
		}
		if let Some(target_id) = target {
			self.emit(BrokerEvent::StreamStopped { target_id, reason });
		}
	}

	fn emit(&self, event: BrokerEvent) {
		self.0.events.emit(&self.0.config.event_source_id, &event);
	}
}
impl Debug for ChatBroker {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ChatBroker")
			.field("registry", &self.0.registry)
			.field("stream", &self.0.stream)
			.field("connected", &self.connected_target())
			.finish()
	}
}

struct BrokerInner {
	config: BrokerConfig,
	registry: Arc<ApplicationRegistry>,
	ledger: QuotaLedger,
	lifecycle: TokenLifecycle,
	stream: StreamManager,
	sender: Arc<dyn MessageSender>,
	events: Arc<dyn EventSink>,
	connection: Mutex<Option<TargetId>>,
}

/// Ends the live session when the application paying for it loses readiness, and forgets the
/// connection when the poll loop ends the session itself.
struct SessionWatch(Weak<BrokerInner>);
impl StatusObserver for SessionWatch {
	fn application_status_changed(&self, application_id: &ApplicationId, ready: bool) {
		let Some(inner) = self.0.upgrade() else { return };
		let broker = ChatBroker(inner);

		if !ready && broker.is_streaming_with(application_id) {
			tracing::warn!(application = %application_id, "Live application lost readiness; disconnecting.");

			broker.end_session(StreamStopReason::ApplicationNotReady);
		}
	}
}
impl StreamObserver for SessionWatch {
	fn stream_stopped(&self, target_id: &TargetId, reason: StreamStopReason) {
		let Some(inner) = self.0.upgrade() else { return };
		let mut connection = inner.connection.lock();

		if connection.as_ref() == Some(target_id) {
			connection.take();

			tracing::info!(target = %target_id, ?reason, "Live session ended; disconnected from live chat.");
		}
	}
}
