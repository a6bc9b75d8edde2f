//! Chat message model and the acceptance rules applied before dispatch.

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
// self
use crate::_prelude::*;

/// Kind of a chat item; only [`MessageKind::Text`] is dispatched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
	/// Plain text message.
	#[default]
	Text,
	/// Paid highlighted message.
	SuperChat,
	/// Paid sticker.
	SuperSticker,
	/// New or renewed membership.
	Membership,
	/// Gifted memberships.
	MembershipGift,
	/// Moderator removed a message.
	MessageDeleted,
	/// Moderator banned a user.
	UserBanned,
	/// Anything the source could not map.
	#[serde(other)]
	Other,
}

/// Author metadata attached to a message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatAuthor {
	/// Stable upstream channel identifier.
	pub channel_id: String,
	/// Name shown in chat.
	pub display_name: String,
	/// Chat owner.
	pub is_owner: bool,
	/// Chat moderator.
	pub is_moderator: bool,
	/// Channel member.
	pub is_member: bool,
	/// Verified channel.
	pub is_verified: bool,
}

/// One chat item as delivered by a [`crate::stream::MessageSource`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatMessage {
	/// Upstream message identifier.
	pub id: String,
	/// Item kind.
	pub kind: MessageKind,
	/// Display text.
	pub text: String,
	/// Author.
	pub author: ChatAuthor,
	/// Publication time in epoch millis, when the source reports it.
	pub published_at: Option<i64>,
}
impl ChatMessage {
	/// Convenience constructor for a text message.
	pub fn text(id: impl Into<String>, author: ChatAuthor, text: impl Into<String>) -> Self {
		Self { id: id.into(), kind: MessageKind::Text, text: text.into(), author, published_at: None }
	}

	/// Sets the publication time.
	pub fn published_at(mut self, millis: i64) -> Self {
		self.published_at = Some(millis);

		self
	}

	/// Returns `true` when the message should be dispatched for a session connected at
	/// `connected_at`.
	///
	/// Non-text kinds and blank text are dropped. Messages published before the connection
	/// are dropped; undated messages, or sessions without a connection time, pass.
	pub fn is_dispatchable(&self, connected_at: Option<i64>) -> bool {
		if self.kind != MessageKind::Text || self.text.trim().is_empty() {
			return false;
		}

		match (self.published_at, connected_at) {
			(Some(published), Some(connected)) => published >= connected,
			_ => true,
		}
	}

	/// Hashed author key used to detect an author's first message in a session.
	pub fn author_fingerprint(&self) -> String {
		let key = if self.author.channel_id.is_empty() {
			&self.author.display_name
		} else {
			&self.author.channel_id
		};

		URL_SAFE_NO_PAD.encode(Sha256::digest(key.as_bytes()))
	}
}
impl Display for ChatMessage {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "{}: {}", self.author.display_name, self.text)
	}
}
