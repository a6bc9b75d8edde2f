//! Per-application OAuth token lifecycles.
//!
//! [`TokenLifecycle`] owns one [`ApplicationTokenManager`] per authorized application plus a
//! background refresh timer for each. Failures never escape it: a failed refresh demotes the
//! one affected application to not-ready, reports an [`crate::events::ApiErrorEvent`], and
//! leaves every other application untouched.

pub mod callback;
pub mod manager;

mod metrics;

pub use callback::*;
pub use manager::*;
pub use metrics::RefreshMetrics;

pub use crate::registry::ApplicationCredentials;

// self
use crate::{
	_prelude::*,
	auth::{ApplicationId, TokenRecord, TokenSecret},
	clock::{Clock, SystemClock},
	error::ConfigError,
	events::{ApiErrorEvent, BrokerEvent, EventSink, StatusObserver},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	provider::{DefaultProviderStrategy, ProviderDescriptor, ProviderStrategy},
	registry::{ApplicationRegistry, RuntimeApplication},
	timer::ScheduledTask,
};

/// Boxed future returned by [`TokenEndpoint`] calls.
pub type TokenEndpointFuture<'a> = Pin<Box<dyn Future<Output = Result<TokenRecord>> + 'a + Send>>;

/// Boxed future returned by [`AccountLookup::account_email`].
pub type AccountFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<String>>> + 'a + Send>>;

/// Boxed future returned by [`TokenProvider::access_token`].
pub type AccessTokenFuture<'a> = Pin<Box<dyn Future<Output = String> + 'a + Send>>;

/// Token endpoint of the upstream provider.
pub trait TokenEndpoint
where
	Self: Send + Sync,
{
	/// Exchanges an authorization code for tokens.
	fn exchange_code<'a>(
		&'a self,
		credentials: &'a ApplicationCredentials,
		code: &'a str,
	) -> TokenEndpointFuture<'a>;

	/// Redeems `refresh_token` for a new access token.
	fn refresh<'a>(
		&'a self,
		credentials: &'a ApplicationCredentials,
		refresh_token: &'a TokenSecret,
	) -> TokenEndpointFuture<'a>;
}

/// Resolves the account behind an access token; used for logging only.
pub trait AccountLookup
where
	Self: Send + Sync,
{
	/// Returns the account email, when the provider exposes one.
	fn account_email<'a>(&'a self, access_token: &'a TokenSecret) -> AccountFuture<'a>;
}

/// Hands out access tokens by application; empty strings signal failure.
pub trait TokenProvider
where
	Self: Send + Sync,
{
	/// Returns a usable access token for `application_id`, or an empty string.
	fn access_token<'a>(&'a self, application_id: &'a ApplicationId) -> AccessTokenFuture<'a>;
}

/// Collaborators and settings of a [`TokenLifecycle`].
pub struct TokenLifecycleOptions {
	/// Source of credentials, refresh tokens, and readiness.
	pub registry: Arc<ApplicationRegistry>,
	/// Provider token endpoint.
	pub endpoint: Arc<dyn TokenEndpoint>,
	/// Provider descriptor used for consent URLs.
	pub descriptor: ProviderDescriptor,
	/// Provider quirks applied to consent URLs.
	pub strategy: Arc<dyn ProviderStrategy>,
	/// Optional account lookup run after a successful callback.
	pub account_lookup: Option<Arc<dyn AccountLookup>>,
	/// Receives `ApiError` and `ApplicationStatusChanged` events.
	pub events: Arc<dyn EventSink>,
	/// Told about every recomputed readiness.
	pub observer: Option<Arc<dyn StatusObserver>>,
	/// Wall clock deciding whether a cached token is still fresh.
	pub clock: Arc<dyn Clock>,
	/// Source identifier attached to emitted events.
	pub source_id: String,
	/// Period of background refreshes.
	pub refresh_interval: StdDuration,
	/// Cached tokens this close to expiry are refreshed before use.
	pub preemptive_window: Duration,
}
impl TokenLifecycleOptions {
	/// Options with the default strategy, the system clock, no account lookup or observer, a
	/// 50 minute refresh period, and a 60 second preemptive window.
	pub fn new(
		registry: Arc<ApplicationRegistry>,
		endpoint: Arc<dyn TokenEndpoint>,
		descriptor: ProviderDescriptor,
		events: Arc<dyn EventSink>,
	) -> Self {
		Self {
			registry,
			endpoint,
			descriptor,
			strategy: Arc::new(DefaultProviderStrategy),
			account_lookup: None,
			events,
			observer: None,
			clock: Arc::new(SystemClock),
			source_id: "livechat-broker".into(),
			refresh_interval: StdDuration::from_secs(3_000),
			preemptive_window: Duration::seconds(60),
		}
	}
}

/// Top-level token manager; clones share state.
#[derive(Clone)]
pub struct TokenLifecycle(Arc<LifecycleInner>);
impl TokenLifecycle {
	/// Creates an empty lifecycle; call [`TokenLifecycle::initialize`] to start managers.
	pub fn new(options: TokenLifecycleOptions) -> Self {
		Self(Arc::new(LifecycleInner {
			options,
			managers: RwLock::new(HashMap::new()),
			timers: Mutex::new(HashMap::new()),
		}))
	}

	/// Replaces every manager and timer with fresh ones for `applications`.
	///
	/// Applications without a refresh token are marked not-ready and get no timer.
	pub async fn initialize(&self, applications: &[RuntimeApplication]) {
		self.destroy();

		for app in applications {
			if app.is_connectable() {
				self.install_manager(&app.id, None);
			} else {
				tracing::info!(application = %app.id, "Application is not authorized; skipping refresh.");

				self.mark_ready(&app.id, false).await;
			}
		}

		tracing::info!(managed = self.0.managers.read().len(), "Token lifecycle initialized.");
	}

	/// Returns an access token for `application_id`, or an empty string on any failure.
	///
	/// Failures are logged and mark the application not-ready.
	pub async fn access_token(&self, application_id: &ApplicationId) -> String {
		let result = match self.manager(application_id) {
			Some(manager) => manager.access_token().await,
			None => Err(ConfigError::MissingRefreshToken.into()),
		};

		match result {
			Ok(token) => token.expose().to_owned(),
			Err(e) => {
				tracing::error!(application = %application_id, "Failed to obtain an access token: {e}");

				self.mark_ready(application_id, false).await;

				String::new()
			},
		}
	}

	/// Builds the consent URL of `application_id` carrying the caller's opaque `state`.
	pub fn authorization_url(&self, application_id: &ApplicationId, state: &str) -> Result<Url> {
		let options = &self.0.options;
		let credentials = options
			.registry
			.credentials(application_id)
			.ok_or_else(|| ConfigError::UnknownApplication { application: application_id.clone() })?;

		if credentials.client_id.trim().is_empty() {
			return Err(ConfigError::MissingClientId { application: application_id.clone() }.into());
		}

		let params = options.strategy.authorization_params(&options.descriptor);

		obs::record_flow_outcome(FlowKind::Authorization, FlowOutcome::Attempt);

		Ok(options.descriptor.authorization_url(&credentials.client_id, state, &params))
	}

	/// Starts an authorization with a generated state that the callback can route back.
	pub fn start_authorization(&self, application_id: &ApplicationId) -> Result<AuthorizationRequest> {
		let state = AuthorizationState::new(application_id.clone());
		let encoded = state.encode();
		let url = self.authorization_url(application_id, &encoded)?;

		Ok(AuthorizationRequest { url, state })
	}

	/// Completes a consent redirect and returns the authorized application.
	pub async fn handle_auth_callback(
		&self,
		params: CallbackParams,
	) -> Result<ApplicationId, CallbackError> {
		let span = FlowSpan::new(FlowKind::Authorization, "handle_auth_callback");
		let result = span.instrument(self.complete_authorization(params)).await;

		obs::record_result(FlowKind::Authorization, &result);

		if let Err(e) = &result {
			tracing::warn!(status = e.status, "Authorization callback rejected: {}", e.message);
		}

		result
	}

	/// Refreshes `application_id` now; never fails.
	///
	/// Success marks the application ready. Failure marks it not-ready and emits an
	/// `ApiError` event. The observer hears about both. Returns whether the refresh
	/// succeeded.
	pub async fn refresh_application_token(&self, application_id: &ApplicationId) -> bool {
		let manager = match self.manager(application_id) {
			Some(manager) => Some(manager),
			None if self.can_connect(application_id) => Some(self.install_manager(application_id, None)),
			None => None,
		};
		let result = match manager {
			Some(manager) => manager.refresh_access_token().await.map(|_| ()),
			None => Err(ConfigError::MissingRefreshToken.into()),
		};

		match result {
			Ok(()) => {
				tracing::info!(application = %application_id, "Access token refreshed.");

				self.mark_ready(application_id, true).await;

				true
			},
			Err(e) => {
				let needs_reauthorization = matches!(e, Error::NeedsReauthorization { .. });

				tracing::error!(application = %application_id, "Token refresh failed: {e}");

				self.mark_ready(application_id, false).await;
				self.emit(BrokerEvent::ApiError(ApiErrorEvent {
					application_id: Some(application_id.clone()),
					operation: "token-refresh".into(),
					message: e.to_string(),
					needs_reauthorization,
					critical: false,
				}));

				if needs_reauthorization {
					self.clear_application_auth(application_id);
				}

				false
			},
		}
	}

	/// `true` when the registry holds a refresh token for `application_id`.
	pub fn can_connect(&self, application_id: &ApplicationId) -> bool {
		self.0.options.registry.can_connect(application_id)
	}

	/// Drops the manager of `application_id` and cancels its refresh timer.
	pub fn clear_application_auth(&self, application_id: &ApplicationId) {
		self.0.managers.write().remove(application_id);

		if let Some(timer) = self.0.timers.lock().remove(application_id) {
			timer.cancel();
		}
	}

	/// Cancels every timer and drops every manager; safe to call repeatedly.
	pub fn destroy(&self) {
		let timers = std::mem::take(&mut *self.0.timers.lock());

		for timer in timers.into_values() {
			timer.cancel();
		}

		self.0.managers.write().clear();
	}

	/// Manager of `application_id`, if one is running.
	pub fn manager(&self, application_id: &ApplicationId) -> Option<Arc<ApplicationTokenManager>> {
		self.0.managers.read().get(application_id).cloned()
	}

	/// Applications with a live refresh timer, sorted.
	pub fn scheduled_applications(&self) -> Vec<ApplicationId> {
		let mut ids: Vec<_> = self
			.0
			.timers
			.lock()
			.iter()
			.filter(|(_, timer)| !timer.is_finished())
			.map(|(id, _)| id.clone())
			.collect();

		ids.sort();

		ids
	}

	async fn complete_authorization(&self, params: CallbackParams) -> Result<ApplicationId, CallbackError> {
		let options = &self.0.options;
		let (code, state) = params.validate()?;
		let application_id = state.application_id;
		let credentials = options.registry.credentials(&application_id).ok_or_else(|| {
			CallbackError::bad_request(format!("Application {application_id} does not exist."))
		})?;
		let record = options.endpoint.exchange_code(&credentials, &code).await.map_err(|e| {
			tracing::error!(application = %application_id, "Code exchange failed: {e}");

			CallbackError::exchange_failed(&e)
		})?;
		let refresh_token = record
			.refresh_token
			.clone()
			.filter(|token| !token.is_empty())
			.ok_or_else(CallbackError::missing_refresh_token)?;

		options
			.registry
			.set_refresh_token(&application_id, refresh_token)
			.await
			.map_err(|e| CallbackError::internal(format!("Failed to store the refresh token: {e}")))?;
		options
			.registry
			.set_token_expiry(&application_id, Some(record.expires_at_millis()))
			.await
			.map_err(|e| CallbackError::internal(format!("Failed to store the token expiry: {e}")))?;

		if let Some(lookup) = options.account_lookup.as_ref() {
			match lookup.account_email(&record.access_token).await {
				Ok(Some(email)) => tracing::info!(
					application = %application_id,
					account = %redact_email(&email),
					"Application authorized."
				),
				Ok(None) => tracing::info!(application = %application_id, "Application authorized."),
				Err(e) => tracing::warn!(application = %application_id, "Account lookup failed: {e}"),
			}
		} else {
			tracing::info!(application = %application_id, "Application authorized.");
		}

		self.install_manager(&application_id, Some(&record));
		self.mark_ready(&application_id, true).await;

		Ok(application_id)
	}

	fn install_manager(
		&self,
		application_id: &ApplicationId,
		seed: Option<&TokenRecord>,
	) -> Arc<ApplicationTokenManager> {
		let options = &self.0.options;
		let manager = Arc::new(ApplicationTokenManager::new(
			application_id.clone(),
			options.registry.clone(),
			options.endpoint.clone(),
			options.clock.clone(),
			options.preemptive_window,
		));

		if let Some(record) = seed {
			manager.seed(record);
		}

		self.0.managers.write().insert(application_id.clone(), manager.clone());
		self.schedule_refresh(application_id);

		manager
	}

	fn schedule_refresh(&self, application_id: &ApplicationId) {
		let weak = Arc::downgrade(&self.0);
		let id = application_id.clone();
		let task = ScheduledTask::every("token-refresh", self.0.options.refresh_interval, move || {
			let lifecycle = TokenLifecycle(weak.upgrade()?);
			let id = id.clone();

			Some(async move {
				lifecycle.refresh_application_token(&id).await;
			})
		});

		if let Some(previous) = self.0.timers.lock().insert(application_id.clone(), task) {
			previous.cancel();
		}
	}

	async fn mark_ready(&self, application_id: &ApplicationId, ready: bool) {
		let options = &self.0.options;

		match options.registry.set_ready(application_id, ready).await {
			Ok(change) if change.changed => {
				self.emit(BrokerEvent::ApplicationStatusChanged {
					application_id: application_id.clone(),
					ready,
				});
			},
			Ok(_) => {},
			Err(e) => tracing::warn!(application = %application_id, "Failed to record readiness: {e}"),
		}

		if let Some(observer) = options.observer.as_ref() {
			observer.application_status_changed(application_id, ready);
		}
	}

	fn emit(&self, event: BrokerEvent) {
		self.0.options.events.emit(&self.0.options.source_id, &event);
	}
}
impl TokenProvider for TokenLifecycle {
	fn access_token<'a>(&'a self, application_id: &'a ApplicationId) -> AccessTokenFuture<'a> {
		Box::pin(TokenLifecycle::access_token(self, application_id))
	}
}
impl Debug for TokenLifecycle {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenLifecycle")
			.field("managers", &self.0.managers.read().len())
			.field("timers", &self.0.timers.lock().len())
			.finish()
	}
}

struct LifecycleInner {
	options: TokenLifecycleOptions,
	managers: RwLock<HashMap<ApplicationId, Arc<ApplicationTokenManager>>>,
	timers: Mutex<HashMap<ApplicationId, ScheduledTask>>,
}
