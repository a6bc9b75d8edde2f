//! Poll loop state machine.
//!
//! A session moves `Idle → Streaming`, then either back to `Idle` (explicit stop or the
//! upstream ended the live session), through `Retrying` after an ordinary failure, or to
//! `Exhausted` when the upstream denies the call for quota. Every start bumps a generation
//! counter; a poll that wakes up under an older generation does nothing, and an in-flight
//! poll notices a stop at its next batch boundary.

// crates.io
use futures::StreamExt;
use tokio::time::Instant;
// self
use crate::{
	_prelude::*,
	auth::{ApplicationId, TargetId, TokenSecret},
	clock::Clock,
	error::ConfigError,
	events::{ApiErrorEvent, BrokerEvent, EventSink, StreamObserver, StreamStopReason},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	quota::{self, QuotaLedger, STREAM_LIST_UNIT_COST},
	registry::ApplicationRegistry,
	stream::{ChatMessage, ChatSink, MessageSource, StreamRequest},
	timer::ScheduledTask,
};

/// Quota label recorded for every source call.
pub const STREAM_LIST_CALL: &str = "liveChatMessages.streamList";

/// Lifecycle state of the streaming session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamState {
	/// No session.
	#[default]
	Idle,
	/// Polling normally.
	Streaming,
	/// The last poll failed; the next one runs after the usual delay.
	Retrying,
	/// The upstream denied a poll for quota; the session is over.
	Exhausted,
}

/// Point-in-time view of the streaming session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamStatus {
	/// Session state.
	pub state: StreamState,
	/// Chat being read.
	pub target_id: Option<TargetId>,
	/// Application paying for the polls.
	pub application_id: Option<ApplicationId>,
	/// Delay between polls.
	pub delay: Option<StdDuration>,
	/// Cursor for the next poll.
	pub continuation_token: Option<String>,
	/// Epoch millis the session connected at.
	pub connected_at: Option<i64>,
	/// Instant the pending poll fires at.
	pub next_poll_at: Option<Instant>,
}

/// Collaborators and settings of a [`StreamManager`].
pub struct StreamOptions {
	/// Upstream chat reader.
	pub source: Arc<dyn MessageSource>,
	/// Ledger charged for each source call.
	pub ledger: QuotaLedger,
	/// Resolves the active application and its quota settings.
	pub registry: Arc<ApplicationRegistry>,
	/// Wall clock for connection timestamps.
	pub clock: Arc<dyn Clock>,
	/// Receives chat and error events.
	pub events: Arc<dyn EventSink>,
	/// Source identifier attached to emitted events.
	pub source_id: String,
	/// Mirror non-critical failures into the chat feed as `ChatFeedAlert` events.
	pub mirror_errors_to_chat_feed: bool,
	/// Told when a session ends upstream or runs out of quota.
	pub observer: Option<Arc<dyn StreamObserver>>,
}

/// Drives a [`MessageSource`] for at most one session at a time; clones share state.
#[derive(Clone)]
pub struct StreamManager(Arc<StreamInner>);
impl StreamManager {
	/// Creates an idle manager.
	pub fn new(options: StreamOptions) -> Self {
		Self(Arc::new(StreamInner {
			options,
			sinks: RwLock::new(Vec::new()),
			slot: Mutex::new(SessionSlot::default()),
		}))
	}

	/// Registers a downstream consumer of accepted messages.
	pub fn add_sink(&self, sink: Arc<dyn ChatSink>) {
		self.0.sinks.write().push(sink);
	}

	/// Starts reading `target_id` with the active application, replacing any running session.
	///
	/// Fails with [`ConfigError`] when no application is active or its quota settings cannot
	/// produce a delay. The first poll is scheduled immediately.
	pub fn start_streaming(&self, target_id: TargetId, access_token: TokenSecret) -> Result<()> {
		self.stop_streaming();

		let options = &self.0.options;
		let app = options.registry.active().ok_or(ConfigError::NoActiveApplication)?;
		let delay = quota::calculate_delay(&app.quota_settings).ok_or_else(|| {
			ConfigError::InvalidQuotaSettings {
				reason: format!("application {} cannot derive a poll delay", app.id),
			}
		})?;
		let delay = StdDuration::from_secs(delay);
		let connected_at = options.clock.now_millis();
		let generation = {
			let mut slot = self.0.slot.lock();

			slot.generation += 1;
			slot.state = StreamState::Streaming;
			slot.session = Some(Session {
				application_id: app.id.clone(),
				target_id: target_id.clone(),
				access_token,
				daily_quota: app.quota_settings.daily_quota,
				delay,
				continuation_token: None,
				connected_at: Some(connected_at),
				seen_authors: HashSet::new(),
			});

			slot.generation
		};

		tracing::info!(
			application = %app.id,
			target = %target_id,
			delay = %quota::format_delay(delay.as_secs()),
			"Streaming started."
		);
		self.schedule_poll(generation, StdDuration::ZERO);

		Ok(())
	}

	/// Ends the session; safe to call when idle. Returns whether a session was running.
	pub fn stop_streaming(&self) -> bool {
		let (session, poll) = {
			let mut slot = self.0.slot.lock();

			slot.generation += 1;
			slot.state = StreamState::Idle;

			(slot.session.take(), slot.poll.take())
		};

		if let Some(poll) = poll {
			poll.cancel();
		}

		match session {
			Some(session) => {
				tracing::info!(target = %session.target_id, "Streaming stopped.");

				true
			},
			None => false,
		}
	}

	/// Current session state.
	pub fn state(&self) -> StreamState {
		self.0.slot.lock().state
	}

	/// `true` while a session is polling or retrying.
	pub fn is_streaming(&self) -> bool {
		matches!(self.state(), StreamState::Streaming | StreamState::Retrying)
	}

	/// Snapshot of the session.
	pub fn status(&self) -> StreamStatus {
		let slot = self.0.slot.lock();
		let session = slot.session.as_ref();

		StreamStatus {
			state: slot.state,
			target_id: session.map(|s| s.target_id.clone()),
			application_id: session.map(|s| s.application_id.clone()),
			delay: session.map(|s| s.delay),
			continuation_token: session.and_then(|s| s.continuation_token.clone()),
			connected_at: session.and_then(|s| s.connected_at),
			next_poll_at: slot.poll.as_ref().filter(|poll| !poll.is_finished()).map(|poll| poll.fires_at()),
		}
	}

	fn schedule_poll(&self, generation: u64, delay: StdDuration) {
		let weak = Arc::downgrade(&self.0);
		let task = ScheduledTask::once("poll", delay, async move {
			if let Some(inner) = weak.upgrade() {
				StreamManager(inner).poll_cycle(generation).await;
			}
		});
		let mut slot = self.0.slot.lock();

		if slot.generation == generation {
			// The running poll replaces its own handle here; dropping a handle detaches it.
			slot.poll = Some(task);
		} else {
			task.cancel();
		}
	}

	async fn poll_cycle(&self, generation: u64) {
		const KIND: FlowKind = FlowKind::Poll;

		let Some((request, delay)) = self.request_for(generation) else { return };
		let application_id = request.application_id.clone();
		let target_id = request.target_id.clone();

		self.0.options.ledger.record_api_call(&application_id, STREAM_LIST_CALL, STREAM_LIST_UNIT_COST);
		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let span = FlowSpan::new(KIND, "poll_cycle");
		let outcome = span.instrument(self.drain(generation, request)).await;

		obs::record_result(KIND, &outcome);

		match outcome {
			Ok(CycleEnd::Drained) =>
				if self.transition(generation, StreamState::Streaming) {
					self.schedule_poll(generation, delay);
				},
			Ok(CycleEnd::Superseded) => {},
			Ok(CycleEnd::SessionEnded) =>
				if self.finish(generation, StreamState::Idle) {
					tracing::info!(target = %target_id, "Live session ended upstream.");

					self.stopped(target_id, StreamStopReason::SessionEnded);
				},
			Err(e) if quota::is_quota_exceeded_error(&e) =>
				if self.finish(generation, StreamState::Exhausted) {
					tracing::error!(application = %application_id, "Quota exhausted; streaming stopped: {e}");

					self.emit(BrokerEvent::ApiError(ApiErrorEvent {
						application_id: Some(application_id),
						operation: "stream-messages".into(),
						message: e.to_string(),
						needs_reauthorization: false,
						critical: true,
					}));
					self.stopped(target_id, StreamStopReason::QuotaExhausted);
				},
			Err(e) =>
				if self.transition(generation, StreamState::Retrying) {
					tracing::warn!(
						application = %application_id,
						retry_in = %quota::format_delay(delay.as_secs()),
						"Poll failed; retrying: {e}"
					);

					self.mirror(format!("Chat polling failed, retrying: {e}"));
					self.schedule_poll(generation, delay);
				},
		}
	}

	fn request_for(&self, generation: u64) -> Option<(StreamRequest, StdDuration)> {
		let slot = self.0.slot.lock();

		if slot.generation != generation {
			return None;
		}

		let session = slot.session.as_ref()?;

		Some((
			StreamRequest {
				application_id: session.application_id.clone(),
				target_id: session.target_id.clone(),
				access_token: session.access_token.clone(),
				daily_quota: session.daily_quota,
				continuation_token: session.continuation_token.clone(),
			},
			session.delay,
		))
	}

	async fn drain(&self, generation: u64, request: StreamRequest) -> Result<CycleEnd> {
		let target_id = request.target_id.clone();
		let mut batches = self.0.options.source.stream_messages(request).await?;

		while let Some(batch) = batches.next().await {
			if !self.is_current(generation) {
				return Ok(CycleEnd::Superseded);
			}

			let batch = batch?;

			for message in batch.items {
				self.dispatch(generation, &target_id, message);
			}

			if let Some(token) = batch.next_continuation_token {
				self.advance_cursor(generation, token);
			}
			if batch.session_ended_at.is_some() {
				return Ok(CycleEnd::SessionEnded);
			}
		}

		Ok(CycleEnd::Drained)
	}

	fn dispatch(&self, generation: u64, target_id: &TargetId, message: ChatMessage) {
		let first_in_session = {
			let mut slot = self.0.slot.lock();

			if slot.generation != generation {
				return;
			}

			let Some(session) = slot.session.as_mut() else { return };

			if !message.is_dispatchable(session.connected_at) {
				tracing::trace!(id = %message.id, "Chat item skipped.");

				return;
			}

			session.seen_authors.insert(message.author_fingerprint())
		};

		if first_in_session {
			self.emit(BrokerEvent::FirstChatMessage {
				target_id: target_id.clone(),
				message: message.clone(),
			});
		}

		self.emit(BrokerEvent::ChatMessage { target_id: target_id.clone(), message: message.clone() });

		let sinks = self.0.sinks.read().clone();

		for sink in sinks {
			if let Err(e) = sink.deliver(target_id, &message, first_in_session) {
				tracing::error!(id = %message.id, "Chat sink failed: {e}");

				self.mirror(format!("Failed to process a chat message: {e}"));
			}
		}
	}

	fn advance_cursor(&self, generation: u64, token: String) {
		let mut slot = self.0.slot.lock();

		if slot.generation != generation {
			return;
		}
		if let Some(session) = slot.session.as_mut() {
			session.continuation_token = Some(token);
		}
	}

	fn is_current(&self, generation: u64) -> bool {
		let slot = self.0.slot.lock();

		slot.generation == generation && slot.session.is_some()
	}

	fn transition(&self, generation: u64, state: StreamState) -> bool {
		let mut slot = self.0.slot.lock();

		if slot.generation != generation || slot.session.is_none() {
			return false;
		}

		slot.state = state;

		true
	}

	fn finish(&self, generation: u64, state: StreamState) -> bool {
		let mut slot = self.0.slot.lock();

		if slot.generation != generation || slot.session.is_none() {
			return false;
		}

		slot.state = state;
		slot.session = None;
		slot.poll = None;

		true
	}

	fn stopped(&self, target_id: TargetId, reason: StreamStopReason) {
		if let Some(observer) = &self.0.options.observer {
			observer.stream_stopped(&target_id, reason);
		}

		self.emit(BrokerEvent::StreamStopped { target_id, reason });
	}

	fn mirror(&self, message: String) {
		if self.0.options.mirror_errors_to_chat_feed {
			self.emit(BrokerEvent::ChatFeedAlert { message });
		}
	}

	fn emit(&self, event: BrokerEvent) {
		self.0.options.events.emit(&self.0.options.source_id, &event);
	}
}
impl Debug for StreamManager {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("StreamManager").field("status", &self.status()).finish()
	}
}

enum CycleEnd {
	Drained,
	Superseded,
	SessionEnded,
}

struct Session {
	application_id: ApplicationId,
	target_id: TargetId,
	access_token: TokenSecret,
	daily_quota: u64,
	delay: StdDuration,
	continuation_token: Option<String>,
	connected_at: Option<i64>,
	seen_authors: HashSet<String>,
}

#[derive(Default)]
struct SessionSlot {
	generation: u64,
	state: StreamState,
	session: Option<Session>,
	poll: Option<ScheduledTask>,
}

struct StreamInner {
	options: StreamOptions,
	sinks: RwLock<Vec<Arc<dyn ChatSink>>>,
	slot: Mutex<SessionSlot>,
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicBool, Ordering};
	// crates.io
	use chrono_tz::Tz;
	use tokio::sync::Notify;
	// self
	use super::*;
	use crate::{
		_preludet::*,
		error::UpstreamError,
		quota::QuotaLedgerOptions,
		store::MemoryStore,
		stream::{ChatAuthor, ChatSinkError, MessageBatch, MessageStream, SourceFuture},
	};

	struct Harness {
		manager: StreamManager,
		source: Arc<ScriptedSource>,
		registry: Arc<ApplicationRegistry>,
		ledger: QuotaLedger,
		events: Arc<RecordingSink>,
		stops: Arc<RecordingStops>,
		clock: Arc<crate::clock::ManualClock>,
		app: ApplicationId,
	}

	#[derive(Default)]
	struct RecordingStops(Mutex<Vec<(TargetId, StreamStopReason)>>);
	impl StreamObserver for RecordingStops {
		fn stream_stopped(&self, target_id: &TargetId, reason: StreamStopReason) {
			self.0.lock().push((target_id.clone(), reason));
		}
	}

	/// Source whose call only resolves once the test opens the gate.
	#[derive(Default)]
	struct GatedSource {
		gate: Notify,
		completed: AtomicBool,
	}
	impl MessageSource for GatedSource {
		fn stream_messages(&self, _request: StreamRequest) -> SourceFuture<'_> {
			Box::pin(async move {
				self.gate.notified().await;
				self.completed.store(true, Ordering::SeqCst);

				let stream: MessageStream = Box::pin(futures::stream::iter(vec![batch(
					vec![ChatMessage::text("late", viewer("a"), "hi")],
					Some("late-page"),
				)]));

				Ok(stream)
			})
		}
	}

	#[derive(Default)]
	struct FailingSink(Mutex<usize>);
	impl ChatSink for FailingSink {
		fn deliver(&self, _: &TargetId, _: &ChatMessage, _: bool) -> Result<(), ChatSinkError> {
			*self.0.lock() += 1;

			Err("renderer offline".into())
		}
	}

	async fn harness(mirror: bool) -> Harness {
		harness_with(mirror, None).await
	}

	async fn harness_with(mirror: bool, custom: Option<Arc<dyn MessageSource>>) -> Harness {
		let (registry, _store) = memory_registry();
		let app = registry.add(new_application("Main", "client-1")).await.expect("Add should succeed.");

		registry.set_refresh_token(&app.id, TokenSecret::new("refresh")).await.expect("Token stored.");
		registry.set_ready(&app.id, true).await.expect("Readiness should update.");
		registry.set_active(&app.id).await.expect("Application can be active.");

		let source = Arc::new(ScriptedSource::default());
		let events = Arc::new(RecordingSink::default());
		let stops = Arc::new(RecordingStops::default());
		let clock = manual_clock();
		let ledger = QuotaLedger::new(QuotaLedgerOptions {
			store: Arc::new(MemoryStore::default()),
			path: "quota-tracking.json".into(),
			clock: clock.clone(),
			timezone: Tz::America__Los_Angeles,
			profiles: registry.clone(),
			events: events.clone(),
			source_id: "test".into(),
			debounce: StdDuration::from_secs(5),
		});
		let reader: Arc<dyn MessageSource> = match custom {
			Some(custom) => custom,
			None => source.clone(),
		};
		let manager = StreamManager::new(StreamOptions {
			source: reader,
			ledger: ledger.clone(),
			registry: registry.clone(),
			clock: clock.clone(),
			events: events.clone(),
			source_id: "test".into(),
			mirror_errors_to_chat_feed: mirror,
			observer: Some(stops.clone()),
		});

		Harness { manager, source, registry, ledger, events, stops, clock, app: app.id.clone() }
	}

	fn target() -> TargetId {
		TargetId::new("chat-1").expect("Target id should be valid.")
	}

	fn viewer(channel_id: &str) -> ChatAuthor {
		ChatAuthor { channel_id: channel_id.into(), display_name: channel_id.into(), ..Default::default() }
	}

	fn batch(items: Vec<ChatMessage>, next: Option<&str>) -> Result<MessageBatch, UpstreamError> {
		Ok(MessageBatch { items, next_continuation_token: next.map(Into::into), session_ended_at: None })
	}

	async fn settle() {
		for _ in 0..8 {
			tokio::task::yield_now().await;
		}
	}

	#[tokio::test(start_paused = true)]
	async fn ordinary_cycles_reschedule_after_exactly_the_delay() {
		let h = harness(true).await;

		h.source.push_cycle(vec![batch(vec![ChatMessage::text("1", viewer("a"), "hi")], Some("page-2"))]);
		h.source.push_cycle(vec![batch(Vec::new(), Some("page-3"))]);
		h.manager.start_streaming(target(), TokenSecret::new("access")).expect("Start should succeed.");
		settle().await;

		assert_eq!(h.source.calls(), 1);

		let status = h.manager.status();

		assert_eq!(status.state, StreamState::Streaming);
		assert_eq!(status.delay, Some(StdDuration::from_secs(18)));
		assert_eq!(status.continuation_token.as_deref(), Some("page-2"));
		assert_eq!(status.connected_at, Some(TEST_NOW_MILLIS));

		tokio::time::sleep(StdDuration::from_millis(17_999)).await;
		settle().await;

		assert_eq!(h.source.calls(), 1);

		tokio::time::sleep(StdDuration::from_millis(2)).await;
		settle().await;

		assert_eq!(h.source.calls(), 2);

		let requests = h.source.requests.lock().clone();

		assert_eq!(requests[0].continuation_token, None);
		assert_eq!(requests[1].continuation_token.as_deref(), Some("page-2"));
		assert_eq!(requests[1].access_token.expose(), "access");
		assert_eq!(requests[1].daily_quota, 10_000);
		assert_eq!(
			h.ledger.quota_usage(&h.app).map(|usage| usage.quota_units_used),
			Some(2 * STREAM_LIST_UNIT_COST)
		);
	}

	#[tokio::test(start_paused = true)]
	async fn session_end_stops_scheduling() {
		let h = harness(true).await;

		h.source.push_cycle(vec![Ok(MessageBatch {
			items: vec![ChatMessage::text("1", viewer("a"), "bye")],
			next_continuation_token: None,
			session_ended_at: Some(TEST_NOW_MILLIS),
		})]);
		h.manager.start_streaming(target(), TokenSecret::new("access")).expect("Start should succeed.");
		settle().await;
		tokio::time::sleep(StdDuration::from_secs(120)).await;
		settle().await;

		assert_eq!(h.source.calls(), 1);
		assert_eq!(h.manager.state(), StreamState::Idle);
		assert_eq!(h.manager.status().next_poll_at, None);
		assert!(
			h.events.events().contains(&BrokerEvent::StreamStopped {
				target_id: target(),
				reason: StreamStopReason::SessionEnded,
			})
		);
	}

	#[tokio::test(start_paused = true)]
	async fn quota_denials_exhaust_the_session_and_other_errors_retry() {
		let h = harness(false).await;

		h.source.push_cycle(vec![Err(UpstreamError::new("backend unavailable").with_status(503))]);
		h.source.push_cycle(vec![Err(UpstreamError::new("denied").with_status(403).with_reason("quotaExceeded"))]);
		h.manager.start_streaming(target(), TokenSecret::new("access")).expect("Start should succeed.");
		settle().await;

		assert_eq!(h.manager.state(), StreamState::Retrying);
		assert!(h.manager.is_streaming());
		assert!(!h.events.names().contains(&"chat-feed-alert"));

		tokio::time::sleep(StdDuration::from_secs(19)).await;
		settle().await;

		assert_eq!(h.source.calls(), 2);
		assert_eq!(h.manager.state(), StreamState::Exhausted);
		assert_eq!(h.manager.status().target_id, None);
		assert_eq!(h.events.names(), vec!["api-error", "stream-stopped"]);

		tokio::time::sleep(StdDuration::from_secs(120)).await;
		settle().await;

		assert_eq!(h.source.calls(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn messages_are_filtered_and_first_authors_announced() {
		let h = harness(true).await;
		let sink = Arc::new(FailingSink::default());
		let before = TEST_NOW_MILLIS - 1_000;

		h.manager.add_sink(sink.clone());
		h.source.push_cycle(vec![batch(
			vec![
				ChatMessage::text("old", viewer("a"), "history").published_at(before),
				ChatMessage::text("1", viewer("a"), "first").published_at(TEST_NOW_MILLIS),
				ChatMessage::text("2", viewer("a"), "second"),
				ChatMessage::text("3", viewer("b"), "   "),
				ChatMessage { kind: crate::stream::MessageKind::SuperSticker, ..ChatMessage::text("4", viewer("b"), "x") },
			],
			None,
		)]);
		h.manager.start_streaming(target(), TokenSecret::new("access")).expect("Start should succeed.");
		settle().await;

		assert_eq!(
			h.events.names(),
			vec![
				"first-chat-message",
				"chat-message",
				"chat-feed-alert",
				"chat-message",
				"chat-feed-alert",
			]
		);
		assert_eq!(*sink.0.lock(), 2);
		assert_eq!(h.manager.state(), StreamState::Streaming);
	}

	#[tokio::test(start_paused = true)]
	async fn stop_is_idempotent_and_cancels_the_pending_poll() {
		let h = harness(true).await;

		h.source.push_cycle(vec![batch(Vec::new(), Some("page-2"))]);
		h.manager.start_streaming(target(), TokenSecret::new("access")).expect("Start should succeed.");
		settle().await;

		assert!(h.manager.status().next_poll_at.is_some());
		assert!(h.manager.stop_streaming());
		assert!(!h.manager.stop_streaming());

		let status = h.manager.status();

		assert_eq!(status.state, StreamState::Idle);
		assert_eq!(status.continuation_token, None);
		assert_eq!(status.connected_at, None);

		tokio::time::sleep(StdDuration::from_secs(60)).await;
		settle().await;

		assert_eq!(h.source.calls(), 1);
		assert!(h.events.names().iter().all(|name| *name != "stream-stopped"));
	}

	#[tokio::test(start_paused = true)]
	async fn start_requires_an_active_application_with_valid_settings() {
		let h = harness(true).await;

		h.registry.clear_active().await.expect("Clear should succeed.");

		assert!(matches!(
			h.manager.start_streaming(target(), TokenSecret::new("access")),
			Err(Error::Config(ConfigError::NoActiveApplication))
		));
		assert_eq!(h.source.calls(), 0);

		h.clock.advance(StdDuration::from_secs(1));
		h.registry.set_active(&h.app).await.expect("Application can be active.");
		h.manager.start_streaming(target(), TokenSecret::new("access")).expect("Start should succeed.");

		assert_eq!(h.manager.status().connected_at, Some(TEST_NOW_MILLIS + 1_000));
	}

	#[tokio::test(start_paused = true)]
	async fn stopping_during_a_call_lets_it_complete_without_dispatch() {
		let gated = Arc::new(GatedSource::default());
		let h = harness_with(false, Some(gated.clone())).await;

		h.manager.start_streaming(target(), TokenSecret::new("access")).expect("Start should succeed.");
		settle().await;

		assert!(h.manager.stop_streaming());

		gated.gate.notify_one();
		settle().await;

		assert!(gated.completed.load(Ordering::SeqCst));
		assert_eq!(h.manager.state(), StreamState::Idle);
		assert_eq!(h.manager.status().continuation_token, None);
		assert!(h.events.names().iter().all(|name| *name != "chat-message"));
		assert!(h.stops.0.lock().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn a_superseded_cycle_cannot_move_the_new_cursor() {
		let h = harness(false).await;

		h.source.push_cycle(vec![batch(Vec::new(), Some("first-page"))]);
		h.manager.start_streaming(target(), TokenSecret::new("access")).expect("Start should succeed.");
		settle().await;

		let stale = h.manager.0.slot.lock().generation;

		h.manager.start_streaming(target(), TokenSecret::new("access")).expect("Restart should succeed.");
		settle().await;
		h.manager.advance_cursor(stale, "stale-page".into());

		assert_eq!(h.manager.status().continuation_token, None);

		let current = h.manager.0.slot.lock().generation;

		h.manager.advance_cursor(current, "next-page".into());

		assert_eq!(h.manager.status().continuation_token.as_deref(), Some("next-page"));
	}

	#[tokio::test(start_paused = true)]
	async fn self_ended_sessions_notify_the_observer_once() {
		let h = harness(false).await;

		h.source.push_cycle(vec![Err(UpstreamError::new("denied").with_reason("quotaExceeded"))]);
		h.manager.start_streaming(target(), TokenSecret::new("access")).expect("Start should succeed.");
		settle().await;

		assert_eq!(h.manager.state(), StreamState::Exhausted);
		assert_eq!(*h.stops.0.lock(), vec![(target(), StreamStopReason::QuotaExhausted)]);

		h.stops.0.lock().clear();
		h.source.push_cycle(vec![Ok(MessageBatch {
			items: Vec::new(),
			next_continuation_token: None,
			session_ended_at: Some(TEST_NOW_MILLIS),
		})]);
		h.manager.start_streaming(target(), TokenSecret::new("access")).expect("Start should succeed.");
		settle().await;

		assert_eq!(h.manager.state(), StreamState::Idle);
		assert_eq!(*h.stops.0.lock(), vec![(target(), StreamStopReason::SessionEnded)]);

		h.manager.start_streaming(target(), TokenSecret::new("access")).expect("Start should succeed.");
		settle().await;
		h.manager.stop_streaming();

		assert_eq!(h.stops.0.lock().len(), 1);
	}
}
