//! Thread-safe in-memory [`KeyValueStore`] for local development and tests.

// std
use std::sync::atomic::{AtomicUsize, Ordering};
// self
use crate::{
	_prelude::*,
	store::{KeyValueStore, StoreError, StoreFuture},
};

type StoreMap = Arc<RwLock<HashMap<String, String>>>;

/// Keeps documents in-process; clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
	map: StoreMap,
	fail_writes: Arc<Mutex<bool>>,
	writes: Arc<AtomicUsize>,
}
impl MemoryStore {
	/// Number of documents currently stored.
	pub fn len(&self) -> usize {
		self.map.read().len()
	}

	/// Returns `true` when nothing is stored.
	pub fn is_empty(&self) -> bool {
		self.map.read().is_empty()
	}

	/// Returns the raw stored content for `path`, if any.
	pub fn snapshot(&self, path: &str) -> Option<String> {
		self.map.read().get(path).cloned()
	}

	/// Number of successful writes since creation.
	pub fn writes(&self) -> usize {
		self.writes.load(Ordering::SeqCst)
	}

	/// Makes every subsequent write fail until reset; used to exercise error paths.
	pub fn fail_writes(&self, fail: bool) {
		*self.fail_writes.lock() = fail;
	}

	fn write_now(&self, path: &str, content: String) -> Result<(), StoreError> {
		if *self.fail_writes.lock() {
			return Err(StoreError::Backend { message: format!("Write to {path} rejected.") });
		}

		self.map.write().insert(path.to_owned(), content);
		self.writes.fetch_add(1, Ordering::SeqCst);

		Ok(())
	}
}
impl KeyValueStore for MemoryStore {
	fn exists<'a>(&'a self, path: &'a str) -> StoreFuture<'a, bool> {
		let found = self.map.read().contains_key(path);

		Box::pin(async move { Ok(found) })
	}

	fn read_text<'a>(&'a self, path: &'a str) -> StoreFuture<'a, String> {
		let value = self.map.read().get(path).cloned();

		Box::pin(async move { value.ok_or_else(|| StoreError::NotFound { path: path.to_owned() }) })
	}

	fn write_text<'a>(&'a self, path: &'a str, content: String) -> StoreFuture<'a, ()> {
		Box::pin(async move { self.write_now(path, content) })
	}
}
