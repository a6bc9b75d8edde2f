//! Durable key-value storage used by the application registry and the quota ledger.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

// self
use crate::_prelude::*;

/// Boxed future returned by [`KeyValueStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a + Send>>;

/// Text-oriented durable storage addressed by relative paths.
pub trait KeyValueStore
where
	Self: Send + Sync,
{
	/// Returns `true` when a value exists at `path`.
	fn exists<'a>(&'a self, path: &'a str) -> StoreFuture<'a, bool>;

	/// Reads the value stored at `path`.
	fn read_text<'a>(&'a self, path: &'a str) -> StoreFuture<'a, String>;

	/// Replaces the value stored at `path`.
	fn write_text<'a>(&'a self, path: &'a str, content: String) -> StoreFuture<'a, ()>;
}

/// Error type produced by [`KeyValueStore`] implementations and their callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum StoreError {
	/// Serialization failures surfaced while encoding or decoding a document.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
	/// No value exists at the requested path.
	#[error("Nothing stored at {path}.")]
	NotFound {
		/// Requested path.
		path: String,
	},
}

/// Reads and decodes a JSON document, treating absence and corruption as `None`.
///
/// Corrupt or unreadable content is logged and never propagated, so callers fall back to
/// their empty initial state.
pub async fn load_json<T>(store: &dyn KeyValueStore, path: &str) -> Option<T>
where
	T: for<'de> Deserialize<'de>,
{
	match store.exists(path).await {
		Ok(true) => {},
		Ok(false) => return None,
		Err(e) => {
			tracing::error!(path, "Failed to check stored document: {e}");

			return None;
		},
	}

	let raw = match store.read_text(path).await {
		Ok(raw) => raw,
		Err(e) => {
			tracing::error!(path, "Failed to read stored document: {e}");

			return None;
		},
	};

	if raw.trim().is_empty() {
		return None;
	}

	let mut de = serde_json::Deserializer::from_str(&raw);

	match serde_path_to_error::deserialize(&mut de) {
		Ok(value) => Some(value),
		Err(e) => {
			tracing::error!(path, field = %e.path(), "Stored document is corrupt; starting empty: {}", e.inner());

			None
		},
	}
}

/// Encodes `value` as pretty JSON and writes it to `path`.
pub async fn save_json<T>(store: &dyn KeyValueStore, path: &str, value: &T) -> Result<(), StoreError>
where
	T: ?Sized + Serialize,
{
	let serialized = serde_json::to_string_pretty(value).map_err(|e| StoreError::Serialization {
		message: format!("Failed to serialize {path}: {e}"),
	})?;

	store.write_text(path, serialized).await
}
