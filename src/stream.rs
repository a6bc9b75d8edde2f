//! Quota-paced live chat polling.
//!
//! The upstream streaming RPC is opaque: a [`MessageSource`] turns a [`StreamRequest`] into
//! an async sequence of [`MessageBatch`]es, and [`StreamManager`] drives it on the delay the
//! quota scheduler computed. Accepted messages fan out as events and to every registered
//! [`ChatSink`].

pub mod manager;
pub mod message;

pub use manager::*;
pub use message::*;

// crates.io
use futures::Stream;
// self
use crate::{
	_prelude::*,
	auth::{ApplicationId, TargetId, TokenSecret},
	error::UpstreamError,
};

/// Async sequence of batches produced by one source call.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<MessageBatch, UpstreamError>> + Send>>;

/// Boxed future returned by [`MessageSource::stream_messages`].
pub type SourceFuture<'a> = Pin<Box<dyn Future<Output = Result<MessageStream>> + 'a + Send>>;

/// Boxed future returned by [`MessageSender::send_message`].
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = bool> + 'a + Send>>;

/// Error returned by a [`ChatSink`].
pub type ChatSinkError = Box<dyn StdError + Send + Sync>;

/// One page of the live chat.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageBatch {
	/// Messages in publication order.
	pub items: Vec<ChatMessage>,
	/// Cursor for the next request.
	pub next_continuation_token: Option<String>,
	/// Set when the live session has ended; epoch millis.
	pub session_ended_at: Option<i64>,
}

/// Parameters of one source call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRequest {
	/// Application whose quota the call spends.
	pub application_id: ApplicationId,
	/// Chat to read.
	pub target_id: TargetId,
	/// Bearer token obtained at session start.
	pub access_token: TokenSecret,
	/// Daily quota of the application.
	pub daily_quota: u64,
	/// Cursor returned by the previous batch.
	pub continuation_token: Option<String>,
}

/// Upstream live chat reader. One call costs a fixed number of quota units no matter how many
/// batches it yields.
pub trait MessageSource
where
	Self: Send + Sync,
{
	/// Opens a streaming read of `request.target_id`.
	fn stream_messages(&self, request: StreamRequest) -> SourceFuture<'_>;
}

/// Upstream chat writer.
pub trait MessageSender
where
	Self: Send + Sync,
{
	/// Posts `text` to `target_id`; returns whether the upstream accepted it.
	fn send_message<'a>(&'a self, target_id: &'a TargetId, text: &'a str) -> SendFuture<'a>;
}

/// Downstream consumer of accepted chat messages; must not block.
pub trait ChatSink
where
	Self: Send + Sync,
{
	/// Receives one accepted message. `first_in_session` is set for an author's first message
	/// of the session.
	fn deliver(
		&self,
		target_id: &TargetId,
		message: &ChatMessage,
		first_in_session: bool,
	) -> Result<(), ChatSinkError>;
}
