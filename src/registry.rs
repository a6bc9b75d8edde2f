//! Application registry: CRUD and active selection over upstream OAuth applications.
//!
//! The registry is the single source of truth for refresh tokens and readiness. Readiness
//! is never read from disk; it starts false at load and only the token lifecycle flips it.
//! While an application is selected as active it must hold a refresh token, and losing
//! readiness clears the selection.

pub mod model;

pub use model::*;

// self
use crate::{
	_prelude::*,
	auth::{ApplicationId, TokenSecret},
	quota::{QuotaProfile, QuotaProfileSource},
	store::{self, KeyValueStore, StoreError},
};

/// Validation failures raised by registry operations.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum RegistryError {
	/// No application exists with the identifier.
	#[error("Application {id} does not exist.")]
	NotFound {
		/// Requested identifier.
		id: ApplicationId,
	},
	/// A required text field is blank.
	#[error("The {field} field cannot be empty.")]
	EmptyField {
		/// Offending field.
		field: &'static str,
	},
	/// Another application already uses the name (case-insensitive).
	#[error("An application named `{name}` already exists.")]
	DuplicateName {
		/// Rejected name.
		name: String,
	},
	/// Another application already uses the client identifier.
	#[error("Client id `{client_id}` is already registered.")]
	DuplicateClientId {
		/// Rejected client identifier.
		client_id: String,
	},
	/// Quota settings cannot produce a poll delay.
	#[error("Quota settings are invalid: {reason}.")]
	InvalidQuotaSettings {
		/// Why the settings were rejected.
		reason: String,
	},
	/// The application has no refresh token and cannot be selected.
	#[error("Application {id} has not been authorized.")]
	NotAuthorized {
		/// Requested identifier.
		id: ApplicationId,
	},
}

#[derive(Debug, Default)]
struct RegistryState {
	applications: BTreeMap<ApplicationId, RuntimeApplication>,
	active: Option<ApplicationId>,
}
impl RegistryState {
	fn get(&self, id: &ApplicationId) -> Result<&RuntimeApplication, RegistryError> {
		self.applications.get(id).ok_or_else(|| RegistryError::NotFound { id: id.clone() })
	}

	fn get_mut(&mut self, id: &ApplicationId) -> Result<&mut RuntimeApplication, RegistryError> {
		self.applications.get_mut(id).ok_or_else(|| RegistryError::NotFound { id: id.clone() })
	}

	fn ensure_unique(
		&self,
		skip: Option<&ApplicationId>,
		name: &str,
		client_id: &str,
	) -> Result<(), RegistryError> {
		let folded = name.to_lowercase();

		for app in self.applications.values().filter(|app| Some(&app.id) != skip) {
			if app.name.to_lowercase() == folded {
				return Err(RegistryError::DuplicateName { name: name.to_owned() });
			}
			if app.client_id == client_id {
				return Err(RegistryError::DuplicateClientId { client_id: client_id.to_owned() });
			}
		}

		Ok(())
	}

	fn clear_active_if(&mut self, id: &ApplicationId) -> bool {
		if self.active.as_ref() == Some(id) {
			self.active = None;

			return true;
		}

		false
	}

	fn storage(&self) -> ApplicationStorage {
		ApplicationStorage {
			applications: self
				.applications
				.iter()
				.map(|(id, app)| (id.clone(), app.application.clone()))
				.collect(),
			active_application_id: self.active.clone(),
		}
	}
}

/// In-memory registry backed by a JSON document in a [`KeyValueStore`].
pub struct ApplicationRegistry {
	store: Arc<dyn KeyValueStore>,
	path: String,
	state: RwLock<RegistryState>,
	write_guard: AsyncMutex<()>,
}
impl ApplicationRegistry {
	/// Creates an empty registry persisted at `path`.
	pub fn new(store: Arc<dyn KeyValueStore>, path: impl Into<String>) -> Self {
		Self {
			store,
			path: path.into(),
			state: RwLock::new(RegistryState::default()),
			write_guard: AsyncMutex::new(()),
		}
	}

	/// Loads the applications document, replacing in-memory state.
	///
	/// Readiness and token expiry are reset. An active selection that points at a missing
	/// or unauthorized application is dropped.
	pub async fn load(&self) {
		let storage =
			store::load_json::<ApplicationStorage>(self.store.as_ref(), &self.path).await.unwrap_or_default();
		let mut state = self.state.write();

		state.applications = storage
			.applications
			.into_values()
			.map(|app| (app.id.clone(), RuntimeApplication::loaded(app)))
			.collect();
		let active = storage.active_application_id.filter(|id| {
			let usable = state.applications.get(id).is_some_and(|app| app.is_connectable());

			if !usable {
				tracing::warn!(application = %id, "Dropping active selection of an unauthorized application.");
			}

			usable
		});

		state.active = active;

		tracing::info!(
			path = %self.path,
			applications = state.applications.len(),
			active = ?state.active,
			"Application registry loaded."
		);
	}

	/// Writes the current state to the store.
	pub async fn save(&self) -> Result<(), StoreError> {
		let _guard = self.write_guard.lock().await;
		let storage = self.state.read().storage();

		store::save_json(self.store.as_ref(), &self.path, &storage).await
	}

	/// Registers a new application and persists it.
	pub async fn add(&self, new: NewApplication) -> Result<RuntimeApplication> {
		let name = required("name", &new.name)?;
		let client_id = required("clientId", &new.client_id)?;
		let client_secret = required("clientSecret", &new.client_secret)?;

		new.quota_settings.validate()?;

		let created = {
			let mut state = self.state.write();

			state.ensure_unique(None, &name, &client_id)?;

			let mut id = ApplicationId::generate();

			while state.applications.contains_key(&id) {
				id = ApplicationId::generate();
			}

			let app = RuntimeApplication {
				application: PersistedApplication {
					id: id.clone(),
					name,
					client_id,
					client_secret: TokenSecret::new(client_secret),
					refresh_token: TokenSecret::default(),
					token_expires_at: None,
					quota_settings: new.quota_settings,
				},
				ready: false,
			};

			state.applications.insert(id, app.clone());

			app
		};

		tracing::info!(application = %created.id, name = %created.name, "Application registered.");
		self.save().await?;

		Ok(created)
	}

	/// Applies a partial update. Changing either client credential drops the refresh token.
	pub async fn update(&self, id: &ApplicationId, update: ApplicationUpdate) -> Result<ApplicationUpdated> {
		let name = update.name.as_deref().map(|value| required("name", value)).transpose()?;
		let client_id = update.client_id.as_deref().map(|value| required("clientId", value)).transpose()?;
		let client_secret =
			update.client_secret.as_deref().map(|value| required("clientSecret", value)).transpose()?;

		if let Some(settings) = update.quota_settings.as_ref() {
			settings.validate()?;
		}

		let outcome = {
			let mut state = self.state.write();
			let current = state.get(id)?;
			let next_name = name.unwrap_or_else(|| current.name.clone());
			let next_client_id = client_id.unwrap_or_else(|| current.client_id.clone());

			state.ensure_unique(Some(id), &next_name, &next_client_id)?;

			let app = state.get_mut(id)?;
			let credentials_changed = next_client_id != app.application.client_id
				|| client_secret
					.as_deref()
					.is_some_and(|secret| secret != app.application.client_secret.expose());

			app.application.name = next_name;
			app.application.client_id = next_client_id;

			if let Some(secret) = client_secret {
				app.application.client_secret = TokenSecret::new(secret);
			}
			if let Some(settings) = update.quota_settings {
				app.application.quota_settings = settings;
			}
			if credentials_changed {
				app.application.refresh_token = TokenSecret::default();
				app.application.token_expires_at = None;
				app.ready = false;
			}

			let application = app.clone();

			if credentials_changed {
				state.clear_active_if(id);
			}

			ApplicationUpdated { application, credentials_changed }
		};

		if outcome.credentials_changed {
			tracing::info!(application = %id, "Client credentials changed; authorization cleared.");
		}

		self.save().await?;

		Ok(outcome)
	}

	/// Removes an application, clearing the active selection when it pointed at it.
	pub async fn delete(&self, id: &ApplicationId) -> Result<RuntimeApplication> {
		let removed = {
			let mut state = self.state.write();
			let removed =
				state.applications.remove(id).ok_or_else(|| RegistryError::NotFound { id: id.clone() })?;

			state.clear_active_if(id);

			removed
		};

		tracing::info!(application = %id, "Application deleted.");
		self.save().await?;

		Ok(removed)
	}

	/// Returns one application.
	pub fn get(&self, id: &ApplicationId) -> Option<RuntimeApplication> {
		self.state.read().applications.get(id).cloned()
	}

	/// Returns every application ordered by name.
	pub fn list(&self) -> Vec<RuntimeApplication> {
		let mut apps: Vec<_> = self.state.read().applications.values().cloned().collect();

		apps.sort_by_key(|app| app.name.to_lowercase());

		apps
	}

	/// Returns the active application.
	pub fn active(&self) -> Option<RuntimeApplication> {
		let state = self.state.read();

		state.active.as_ref().and_then(|id| state.applications.get(id)).cloned()
	}

	/// Identifier of the active application.
	pub fn active_id(&self) -> Option<ApplicationId> {
		self.state.read().active.clone()
	}

	/// Selects `id` as active; it must hold a refresh token.
	pub async fn set_active(&self, id: &ApplicationId) -> Result<()> {
		{
			let mut state = self.state.write();

			if !state.get(id)?.is_connectable() {
				return Err(RegistryError::NotAuthorized { id: id.clone() }.into());
			}

			state.active = Some(id.clone());
		}

		self.save().await?;

		Ok(())
	}

	/// Clears the active selection.
	pub async fn clear_active(&self) -> Result<()> {
		self.state.write().active = None;
		self.save().await?;

		Ok(())
	}

	/// Records the readiness computed by the token lifecycle.
	///
	/// Losing readiness while active clears the selection and persists it.
	pub async fn set_ready(&self, id: &ApplicationId, ready: bool) -> Result<ReadinessChange> {
		let change = {
			let mut state = self.state.write();
			let app = state.get_mut(id)?;
			let changed = app.ready != ready;

			app.ready = ready;

			let cleared_active = !ready && state.clear_active_if(id);

			ReadinessChange { changed, cleared_active }
		};

		if change.cleared_active {
			tracing::warn!(application = %id, "Active application lost readiness; selection cleared.");
			self.save().await?;
		}

		Ok(change)
	}

	/// Stores a new refresh token. An empty token also drops readiness and the active selection.
	pub async fn set_refresh_token(&self, id: &ApplicationId, token: TokenSecret) -> Result<()> {
		{
			let mut state = self.state.write();
			let app = state.get_mut(id)?;
			let cleared = token.is_empty();

			app.application.refresh_token = token;

			if cleared {
				app.ready = false;
				app.application.token_expires_at = None;
				state.clear_active_if(id);
			}
		}

		self.save().await?;

		Ok(())
	}

	/// Stores the expiry of the latest access token.
	pub async fn set_token_expiry(&self, id: &ApplicationId, expires_at: Option<i64>) -> Result<()> {
		self.state.write().get_mut(id)?.application.token_expires_at = expires_at;
		self.save().await?;

		Ok(())
	}

	/// Current refresh token of `id`, read fresh on every call.
	pub fn refresh_token(&self, id: &ApplicationId) -> Option<TokenSecret> {
		self.state
			.read()
			.applications
			.get(id)
			.map(|app| app.refresh_token.clone())
			.filter(|token| !token.is_empty())
	}

	/// Client credentials of `id`.
	pub fn credentials(&self, id: &ApplicationId) -> Option<ApplicationCredentials> {
		self.state.read().applications.get(id).map(|app| app.credentials())
	}

	/// `true` when `id` holds a refresh token.
	pub fn can_connect(&self, id: &ApplicationId) -> bool {
		self.refresh_token(id).is_some()
	}

	/// `true` when `id` completed a token refresh in this process.
	pub fn is_ready(&self, id: &ApplicationId) -> bool {
		self.state.read().applications.get(id).is_some_and(|app| app.ready)
	}
}
impl QuotaProfileSource for ApplicationRegistry {
	fn quota_profile(&self, application_id: &ApplicationId) -> Option<QuotaProfile> {
		self.state.read().applications.get(application_id).map(|app| QuotaProfile {
			name: app.name.clone(),
			daily_quota: app.quota_settings.daily_quota,
		})
	}
}
impl Debug for ApplicationRegistry {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		let state = self.state.read();

		f.debug_struct("ApplicationRegistry")
			.field("path", &self.path)
			.field("applications", &state.applications.len())
			.field("active", &state.active)
			.finish()
	}
}

fn required(field: &'static str, value: &str) -> Result<String, RegistryError> {
	let trimmed = value.trim();

	if trimmed.is_empty() {
		return Err(RegistryError::EmptyField { field });
	}

	Ok(trimmed.to_owned())
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::_preludet::*;

	async fn authorized(registry: &ApplicationRegistry, name: &str, client_id: &str) -> ApplicationId {
		let app = registry
			.add(new_application(name, client_id))
			.await
			.expect("Application fixture should register.");

		registry
			.set_refresh_token(&app.id, TokenSecret::new(format!("{client_id}-refresh")))
			.await
			.expect("Refresh token should be stored.");

		app.id.clone()
	}

	#[tokio::test]
	async fn name_uniqueness_folds_non_ascii_case() {
		let (registry, _store) = memory_registry();

		registry.add(new_application("Émile", "client-1")).await.expect("First add should succeed.");

		let err = registry
			.add(new_application("émile", "client-2"))
			.await
			.expect_err("Accented names are unique regardless of case.");

		assert!(matches!(err, Error::Registry(RegistryError::DuplicateName { .. })));

		let other = registry.add(new_application("Emile", "client-3")).await.expect("Distinct name.");

		assert!(matches!(
			registry
				.update(&other.id, ApplicationUpdate { name: Some("ÉMILE".into()), ..Default::default() })
				.await,
			Err(Error::Registry(RegistryError::DuplicateName { .. }))
		));
	}

	#[tokio::test]
	async fn add_validates_and_enforces_uniqueness() {
		let (registry, store) = memory_registry();
		let app = registry.add(new_application("Main", "client-1")).await.expect("First add should succeed.");

		assert!(app.id.starts_with("app-"));
		assert!(!app.ready);
		assert!(!app.is_connectable());
		assert!(store.snapshot("applications.json").is_some());

		let err = registry
			.add(new_application("MAIN", "client-2"))
			.await
			.expect_err("Names are unique regardless of case.");

		assert!(matches!(err, Error::Registry(RegistryError::DuplicateName { .. })));

		let err = registry
			.add(new_application("Backup", "client-1"))
			.await
			.expect_err("Client ids are unique.");

		assert!(matches!(err, Error::Registry(RegistryError::DuplicateClientId { .. })));

		let err = registry
			.add(NewApplication { client_secret: "  ".into(), ..new_application("Other", "client-3") })
			.await
			.expect_err("Blank secrets are rejected.");

		assert!(matches!(err, Error::Registry(RegistryError::EmptyField { field: "clientSecret" })));

		let bad_quota = QuotaSettings { daily_quota: 0, ..QuotaSettings::default() };
		let err = registry
			.add(NewApplication { quota_settings: bad_quota, ..new_application("Other", "client-3") })
			.await
			.expect_err("Unusable quota settings are rejected.");

		assert!(matches!(err, Error::Registry(RegistryError::InvalidQuotaSettings { .. })));
		assert_eq!(registry.list().len(), 1);
	}

	#[tokio::test]
	async fn load_never_trusts_stored_readiness() {
		let (registry, store) = memory_registry();
		let id = authorized(&registry, "Main", "client-1").await;

		registry.set_ready(&id, true).await.expect("Readiness should update.");
		registry.set_token_expiry(&id, Some(TEST_NOW_MILLIS)).await.expect("Expiry should persist.");
		registry.set_active(&id).await.expect("Authorized application can be active.");

		let reloaded = ApplicationRegistry::new(store.clone(), "applications.json");

		reloaded.load().await;

		let app = reloaded.get(&id).expect("Application should survive reload.");

		assert!(!app.ready);
		assert_eq!(app.token_expires_at, None);
		assert_eq!(reloaded.active_id(), Some(id.clone()));
		assert_eq!(reloaded.refresh_token(&id).map(|t| t.expose().to_owned()), Some("client-1-refresh".into()));
	}

	#[tokio::test]
	async fn load_drops_unusable_active_selection_and_survives_corruption() {
		let (registry, store) = memory_registry();

		store
			.write_text(
				"applications.json",
				r#"{"applications":{"app-1":{"id":"app-1","name":"Main","clientId":"c","clientSecret":"s"}},"activeApplicationId":"app-1"}"#.into(),
			)
			.await
			.expect("Seed write should succeed.");
		registry.load().await;

		assert_eq!(registry.list().len(), 1);
		assert_eq!(registry.active_id(), None);

		store.write_text("applications.json", "not json".into()).await.expect("Seed write should succeed.");
		registry.load().await;

		assert!(registry.list().is_empty());
	}

	#[tokio::test]
	async fn credential_changes_clear_authorization() {
		let (registry, _store) = memory_registry();
		let id = authorized(&registry, "Main", "client-1").await;

		registry.set_ready(&id, true).await.expect("Readiness should update.");
		registry.set_active(&id).await.expect("Authorized application can be active.");

		let renamed = registry
			.update(&id, ApplicationUpdate { name: Some("Primary".into()), ..Default::default() })
			.await
			.expect("Rename should succeed.");

		assert!(!renamed.credentials_changed);
		assert!(renamed.application.ready);

		let rotated = registry
			.update(&id, ApplicationUpdate { client_secret: Some("new-secret".into()), ..Default::default() })
			.await
			.expect("Secret change should succeed.");

		assert!(rotated.credentials_changed);
		assert!(!rotated.application.ready);
		assert!(!registry.can_connect(&id));
		assert_eq!(registry.active_id(), None);
	}

	#[tokio::test]
	async fn active_selection_follows_authorization_and_readiness() {
		let (registry, _store) = memory_registry();
		let pending = registry.add(new_application("Pending", "client-0")).await.expect("Add should succeed.");
		let err = registry.set_active(&pending.id).await.expect_err("Unauthorized apps cannot be active.");

		assert!(matches!(err, Error::Registry(RegistryError::NotAuthorized { .. })));

		let id = authorized(&registry, "Main", "client-1").await;

		registry.set_ready(&id, true).await.expect("Readiness should update.");
		registry.set_active(&id).await.expect("Authorized application can be active.");

		let change = registry.set_ready(&id, false).await.expect("Readiness should update.");

		assert_eq!(change, ReadinessChange { changed: true, cleared_active: true });
		assert_eq!(registry.active(), None);

		registry.set_active(&id).await.expect("Application is still authorized.");
		registry.set_refresh_token(&id, TokenSecret::default()).await.expect("Token should clear.");

		assert_eq!(registry.active_id(), None);
		assert!(!registry.can_connect(&id));
	}

	#[tokio::test]
	async fn delete_clears_active_and_profiles_follow_the_registry() {
		let (registry, _store) = memory_registry();
		let id = authorized(&registry, "Main", "client-1").await;

		registry.set_active(&id).await.expect("Authorized application can be active.");

		assert_eq!(
			registry.quota_profile(&id),
			Some(QuotaProfile { name: "Main".into(), daily_quota: 10_000 })
		);

		registry.delete(&id).await.expect("Delete should succeed.");

		assert_eq!(registry.active_id(), None);
		assert_eq!(registry.quota_profile(&id), None);
		assert!(matches!(
			registry.delete(&id).await,
			Err(Error::Registry(RegistryError::NotFound { .. }))
		));
	}

	#[tokio::test]
	async fn write_failures_reach_the_caller_only() {
		let (registry, store) = memory_registry();

		store.fail_writes(true);

		assert!(matches!(
			registry.add(new_application("Main", "client-1")).await,
			Err(Error::Storage(_))
		));

		store.fail_writes(false);

		registry.add(new_application("Backup", "client-2")).await.expect("Later writes succeed.");

		let saved = store.snapshot("applications.json").expect("Registry should be persisted.");

		assert!(saved.contains("Backup"));
		assert!(saved.contains("Main"), "The earlier in-memory change is persisted by the next write.");
	}
}
