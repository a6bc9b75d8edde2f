//! Directory-backed [`KeyValueStore`] for bots and single-host deployments.

// std
use std::{
	fs::{self, File},
	io::{ErrorKind, Write},
	path::{Component, Path, PathBuf},
};
// self
use crate::{
	_prelude::*,
	store::{KeyValueStore, StoreError, StoreFuture},
};

/// Stores each key as a file below a root directory; writes replace files atomically.
#[derive(Clone, Debug)]
pub struct FileStore {
	root: PathBuf,
	write_lock: Arc<Mutex<()>>,
}
impl FileStore {
	/// Opens (or creates) a store rooted at `root`.
	pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let root = root.into();

		fs::create_dir_all(&root).map_err(|e| StoreError::Backend {
			message: format!("Failed to create store directory {}: {e}", root.display()),
		})?;

		Ok(Self { root, write_lock: Default::default() })
	}

	/// Directory that holds the stored files.
	pub fn root(&self) -> &Path {
		&self.root
	}

	fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
		let relative = Path::new(key);
		let escapes = relative.components().any(|component| {
			!matches!(component, Component::Normal(_) | Component::CurDir)
		});

		if key.is_empty() || escapes {
			return Err(StoreError::Backend {
				message: format!("Key `{key}` must be a relative path inside the store."),
			});
		}

		Ok(self.root.join(relative))
	}

	fn read_now(&self, key: &str) -> Result<String, StoreError> {
		let path = self.resolve(key)?;

		fs::read_to_string(&path).map_err(|e| match e.kind() {
			ErrorKind::NotFound => StoreError::NotFound { path: key.to_owned() },
			_ => StoreError::Backend {
				message: format!("Failed to read {}: {e}", path.display()),
			},
		})
	}

	fn write_now(&self, key: &str, content: &str) -> Result<(), StoreError> {
		let path = self.resolve(key)?;
		let _guard = self.write_lock.lock();

		if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			fs::create_dir_all(parent).map_err(|e| StoreError::Backend {
				message: format!("Failed to create directory {}: {e}", parent.display()),
			})?;
		}

		let mut tmp_path = path.clone();

		tmp_path.set_extension("tmp");

		{
			let mut file = File::create(&tmp_path).map_err(|e| StoreError::Backend {
				message: format!("Failed to create {}: {e}", tmp_path.display()),
			})?;

			file.write_all(content.as_bytes()).map_err(|e| StoreError::Backend {
				message: format!("Failed to write {}: {e}", tmp_path.display()),
			})?;
			file.sync_all().map_err(|e| StoreError::Backend {
				message: format!("Failed to sync {}: {e}", tmp_path.display()),
			})?;
		}

		fs::rename(&tmp_path, &path).map_err(|e| StoreError::Backend {
			message: format!("Failed to replace {}: {e}", path.display()),
		})
	}
}
impl KeyValueStore for FileStore {
	fn exists<'a>(&'a self, path: &'a str) -> StoreFuture<'a, bool> {
		Box::pin(async move { Ok(self.resolve(path)?.is_file()) })
	}

	fn read_text<'a>(&'a self, path: &'a str) -> StoreFuture<'a, String> {
		Box::pin(async move { self.read_now(path) })
	}

	fn write_text<'a>(&'a self, path: &'a str, content: String) -> StoreFuture<'a, ()> {
		Box::pin(async move { self.write_now(path, &content) })
	}
}
