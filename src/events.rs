//! Events surfaced to external observers and the sinks that receive them.
//!
//! Emission is fire-and-forget: sinks never report failures back to the broker, so a slow or
//! broken observer cannot stall the poll loop or the ledger.

// crates.io
use tokio::sync::mpsc::UnboundedSender;
// self
use crate::{
	_prelude::*,
	auth::{ApplicationId, TargetId},
	stream::ChatMessage,
};

/// Receives broker events; implementations must not block.
pub trait EventSink
where
	Self: Send + Sync,
{
	/// Publishes `event` on behalf of `source_id`.
	fn emit(&self, source_id: &str, event: &BrokerEvent);
}

/// Receives readiness transitions from the token lifecycle.
pub trait StatusObserver
where
	Self: Send + Sync,
{
	/// Called after an application's readiness was recomputed.
	fn application_status_changed(&self, application_id: &ApplicationId, ready: bool);
}

/// Receives sessions the poll loop ended on its own.
///
/// Explicit stops are not reported; the caller already knows about those.
pub trait StreamObserver
where
	Self: Send + Sync,
{
	/// Called once after the session reading `target_id` ended for `reason`.
	fn stream_stopped(&self, target_id: &TargetId, reason: StreamStopReason);
}

/// Events emitted by the broker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum BrokerEvent {
	/// Cumulative usage crossed an integer percentage of the daily quota.
	QuotaThreshold(QuotaThresholdEvent),
	/// An upstream or token call failed.
	ApiError(ApiErrorEvent),
	/// An application became the active one.
	ApplicationActivated {
		/// Activated application.
		application_id: ApplicationId,
		/// Display name of the application.
		application_name: String,
	},
	/// Readiness of an application changed.
	ApplicationStatusChanged {
		/// Affected application.
		application_id: ApplicationId,
		/// New readiness.
		ready: bool,
	},
	/// A chat message passed the stream filters.
	ChatMessage {
		/// Chat the message came from.
		target_id: TargetId,
		/// The accepted message.
		message: ChatMessage,
	},
	/// First accepted message from an author within the current session.
	FirstChatMessage {
		/// Chat the message came from.
		target_id: TargetId,
		/// The accepted message.
		message: ChatMessage,
	},
	/// Non-critical failure mirrored into the chat feed.
	ChatFeedAlert {
		/// Alert text.
		message: String,
	},
	/// A streaming session ended without being asked to.
	StreamStopped {
		/// Chat the session was reading.
		target_id: TargetId,
		/// Why the session ended.
		reason: StreamStopReason,
	},
}
impl BrokerEvent {
	/// Stable event name matching the serialized tag.
	pub const fn name(&self) -> &'static str {
		match self {
			BrokerEvent::QuotaThreshold(_) => "quota-threshold",
			BrokerEvent::ApiError(_) => "api-error",
			BrokerEvent::ApplicationActivated { .. } => "application-activated",
			BrokerEvent::ApplicationStatusChanged { .. } => "application-status-changed",
			BrokerEvent::ChatMessage { .. } => "chat-message",
			BrokerEvent::FirstChatMessage { .. } => "first-chat-message",
			BrokerEvent::ChatFeedAlert { .. } => "chat-feed-alert",
			BrokerEvent::StreamStopped { .. } => "stream-stopped",
		}
	}
}

/// Payload of [`BrokerEvent::QuotaThreshold`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaThresholdEvent {
	/// Application whose usage crossed the threshold.
	pub application_id: ApplicationId,
	/// Display name of the application.
	pub application_name: String,
	/// Units consumed when the threshold was crossed.
	pub quota_consumed: i64,
	/// Daily quota of the application.
	pub quota_limit: u64,
	/// Crossed percentage (1–100).
	pub threshold: u8,
}

/// Payload of [`BrokerEvent::ApiError`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorEvent {
	/// Application involved, when known.
	pub application_id: Option<ApplicationId>,
	/// Operation that failed (e.g. `token-refresh`, `stream-messages`).
	pub operation: String,
	/// Error message.
	pub message: String,
	/// Whether the operator must re-authorize the application.
	pub needs_reauthorization: bool,
	/// Whether the failure ended the streaming connection.
	pub critical: bool,
}

/// Reason attached to [`BrokerEvent::StreamStopped`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamStopReason {
	/// The upstream reported the live session ended.
	SessionEnded,
	/// The daily quota is exhausted.
	QuotaExhausted,
	/// Switching applications failed half-way and the broker disconnected.
	SwitchFailed,
	/// The active application lost readiness.
	ApplicationNotReady,
}

/// Sink that logs every event through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;
impl EventSink for TracingSink {
	fn emit(&self, source_id: &str, event: &BrokerEvent) {
		match event {
			BrokerEvent::ApiError(payload) => tracing::warn!(
				source = source_id,
				event = event.name(),
				operation = %payload.operation,
				"{}",
				payload.message
			),
			_ => tracing::info!(source = source_id, event = event.name(), "{event:?}"),
		}
	}
}

/// Sink that forwards events to an unbounded Tokio channel.
#[derive(Clone, Debug)]
pub struct ChannelSink(UnboundedSender<(String, BrokerEvent)>);
impl ChannelSink {
	/// Wraps the sending half of a channel.
	pub fn new(sender: UnboundedSender<(String, BrokerEvent)>) -> Self {
		Self(sender)
	}
}
impl EventSink for ChannelSink {
	fn emit(&self, source_id: &str, event: &BrokerEvent) {
		if self.0.send((source_id.to_owned(), event.clone())).is_err() {
			tracing::debug!(event = event.name(), "Event receiver dropped; discarding event.");
		}
	}
}
