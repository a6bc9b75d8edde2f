//! Token manager of a single application.
//!
//! The manager keeps the latest access token in memory only. It never remembers the refresh
//! token: each refresh reads the registry's current value, so a callback or a manual
//! re-authorization takes effect without rebuilding the manager.

// self
use crate::{
	_prelude::*,
	auth::{ApplicationId, TokenRecord, TokenSecret},
	clock::Clock,
	error::ConfigError,
	lifecycle::{RefreshMetrics, TokenEndpoint},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	registry::ApplicationRegistry,
};

/// Caches and refreshes the access token of one application.
pub struct ApplicationTokenManager {
	application_id: ApplicationId,
	registry: Arc<ApplicationRegistry>,
	endpoint: Arc<dyn TokenEndpoint>,
	clock: Arc<dyn Clock>,
	preemptive_window: Duration,
	cache: Mutex<Option<TokenRecord>>,
	refresh_guard: AsyncMutex<()>,
	metrics: RefreshMetrics,
}
impl ApplicationTokenManager {
	/// Creates a manager with an empty cache.
	pub fn new(
		application_id: ApplicationId,
		registry: Arc<ApplicationRegistry>,
		endpoint: Arc<dyn TokenEndpoint>,
		clock: Arc<dyn Clock>,
		preemptive_window: Duration,
	) -> Self {
		let preemptive_window =
			if preemptive_window.is_negative() { Duration::ZERO } else { preemptive_window };

		Self {
			application_id,
			registry,
			endpoint,
			clock,
			preemptive_window,
			cache: Mutex::new(None),
			refresh_guard: AsyncMutex::new(()),
			metrics: RefreshMetrics::default(),
		}
	}

	/// Application this manager serves.
	pub fn application_id(&self) -> &ApplicationId {
		&self.application_id
	}

	/// Refresh counters.
	pub fn metrics(&self) -> &RefreshMetrics {
		&self.metrics
	}

	/// Expiry of the cached access token.
	pub fn cached_expiry(&self) -> Option<OffsetDateTime> {
		self.cache.lock().as_ref().map(|record| record.expires_at)
	}

	/// Primes the cache with tokens obtained elsewhere (a code exchange).
	pub fn seed(&self, record: &TokenRecord) {
		*self.cache.lock() = Some(record.clone());
	}

	/// Returns the cached token unless it is inside the preemptive window, refreshing
	/// otherwise. Concurrent callers share one refresh.
	pub async fn access_token(&self) -> Result<TokenSecret> {
		if let Some(token) = self.fresh_cached() {
			return Ok(token);
		}

		let _singleflight = self.refresh_guard.lock().await;

		if let Some(token) = self.fresh_cached() {
			return Ok(token);
		}

		self.refresh_locked().await
	}

	/// Forces a refresh with the registry's current refresh token.
	///
	/// A rejected grant clears the stored refresh token and fails with
	/// [`Error::NeedsReauthorization`]; other failures propagate unchanged.
	pub async fn refresh_access_token(&self) -> Result<TokenSecret> {
		let _singleflight = self.refresh_guard.lock().await;

		self.refresh_locked().await
	}

	fn fresh_cached(&self) -> Option<TokenSecret> {
		let now = self.clock.now_utc();

		self.cache
			.lock()
			.as_ref()
			.filter(|record| !record.expires_within(self.preemptive_window, now))
			.map(|record| record.access_token.clone())
	}

	async fn refresh_locked(&self) -> Result<TokenSecret> {
		const KIND: FlowKind = FlowKind::Refresh;

		let span = FlowSpan::new(KIND, "refresh_access_token");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span.instrument(self.redeem()).await;

		obs::record_result(KIND, &result);

		match &result {
			Ok(_) => self.metrics.record_success(),
			Err(_) => self.metrics.record_failure(),
		}

		result
	}

	async fn redeem(&self) -> Result<TokenSecret> {
		let id = &self.application_id;
		let credentials = self
			.registry
			.credentials(id)
			.ok_or_else(|| ConfigError::UnknownApplication { application: id.clone() })?;
		let refresh_token = self.registry.refresh_token(id).ok_or(ConfigError::MissingRefreshToken)?;

		self.metrics.record_attempt();

		let record = match self.endpoint.refresh(&credentials, &refresh_token).await {
			Ok(record) => record,
			Err(e) if e.is_authorization_rejected() => {
				tracing::warn!(application = %id, "Refresh token rejected; clearing it: {e}");

				self.cache.lock().take();

				if let Err(clear) = self.registry.set_refresh_token(id, TokenSecret::default()).await {
					tracing::error!(application = %id, "Failed to clear the rejected refresh token: {clear}");
				}

				return Err(Error::NeedsReauthorization { application: id.clone() });
			},
			Err(e) => return Err(e),
		};
		let rotated = record
			.refresh_token
			.clone()
			.filter(|token| !token.is_empty() && token.expose() != refresh_token.expose());

		*self.cache.lock() = Some(record.clone());

		if let Some(rotated) = rotated {
			tracing::info!(application = %id, "Provider rotated the refresh token.");

			self.metrics.record_rotation();
			self.registry.set_refresh_token(id, rotated).await?;
		}

		self.registry.set_token_expiry(id, Some(record.expires_at_millis())).await?;

		Ok(record.access_token)
	}
}
impl Debug for ApplicationTokenManager {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ApplicationTokenManager")
			.field("application_id", &self.application_id)
			.field("cached_expiry", &self.cached_expiry())
			.field("metrics", &self.metrics)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicUsize, Ordering};
	// self
	use super::*;
	use crate::{
		_preludet::*,
		clock::SystemClock,
		lifecycle::TokenEndpointFuture,
		registry::ApplicationCredentials,
	};

	async fn authorized(registry: &ApplicationRegistry, client_id: &str) -> ApplicationId {
		let app = registry.add(new_application(client_id, client_id)).await.expect("Add should succeed.");

		registry
			.set_refresh_token(&app.id, TokenSecret::new(format!("{client_id}-refresh")))
			.await
			.expect("Refresh token should be stored.");

		app.id.clone()
	}

	fn manager(
		registry: &Arc<ApplicationRegistry>,
		endpoint: Arc<dyn TokenEndpoint>,
		id: &ApplicationId,
	) -> ApplicationTokenManager {
		ApplicationTokenManager::new(
			id.clone(),
			registry.clone(),
			endpoint,
			Arc::new(SystemClock),
			Duration::seconds(60),
		)
	}

	#[tokio::test]
	async fn refresh_always_reads_the_registry_token() {
		let (registry, _store) = memory_registry();
		let endpoint = Arc::new(ScriptedTokenEndpoint::default());
		let id = authorized(&registry, "client-1").await;
		let manager = manager(&registry, endpoint.clone(), &id);

		endpoint.push_refresh(Ok(token_record("access-1", None)));
		endpoint.push_refresh(Ok(token_record("access-2", None)));
		manager.refresh_access_token().await.expect("First refresh should succeed.");
		registry
			.set_refresh_token(&id, TokenSecret::new("reauthorized-refresh"))
			.await
			.expect("Registry update should succeed.");

		let token = manager.refresh_access_token().await.expect("Second refresh should succeed.");

		assert_eq!(token.expose(), "access-2");
		assert_eq!(
			*endpoint.seen_refresh_tokens.lock(),
			vec!["client-1-refresh".to_owned(), "reauthorized-refresh".to_owned()]
		);
	}

	#[tokio::test]
	async fn rotation_is_persisted_only_when_the_token_changes() {
		let (registry, store) = memory_registry();
		let endpoint = Arc::new(ScriptedTokenEndpoint::default());
		let id = authorized(&registry, "client-1").await;
		let manager = manager(&registry, endpoint.clone(), &id);

		endpoint.push_refresh(Ok(token_record("access-1", Some("client-1-refresh"))));
		manager.refresh_access_token().await.expect("Refresh should succeed.");

		assert_eq!(manager.metrics().rotations(), 0);
		assert!(registry.get(&id).and_then(|app| app.token_expires_at).is_some());

		endpoint.push_refresh(Ok(token_record("access-2", Some("rotated-refresh"))));
		manager.refresh_access_token().await.expect("Refresh should succeed.");

		assert_eq!(manager.metrics().rotations(), 1);
		assert_eq!(registry.refresh_token(&id), Some(TokenSecret::new("rotated-refresh")));
		assert!(
			store.snapshot("applications.json").expect("Registry should be persisted.").contains("rotated-refresh")
		);
	}

	#[tokio::test]
	async fn cached_tokens_are_reused_until_the_preemptive_window() {
		let (registry, _store) = memory_registry();
		let endpoint = Arc::new(ScriptedTokenEndpoint::default());
		let id = authorized(&registry, "client-1").await;
		let manager = manager(&registry, endpoint.clone(), &id);
		let nearly_expired = TokenRecord::builder()
			.access_token("stale")
			.issued_at(OffsetDateTime::now_utc() - Duration::minutes(59))
			.expires_in(Duration::minutes(59) + Duration::seconds(30))
			.build()
			.expect("Record should build.");

		manager.seed(&nearly_expired);
		endpoint.push_refresh(Ok(token_record("fresh", None)));

		assert_eq!(manager.access_token().await.expect("Token should refresh.").expose(), "fresh");
		assert_eq!(manager.access_token().await.expect("Token should be cached.").expose(), "fresh");
		assert_eq!(endpoint.seen_refresh_tokens.lock().len(), 1);
	}

	#[tokio::test]
	async fn freshness_follows_the_injected_clock() {
		let (registry, _store) = memory_registry();
		let endpoint = Arc::new(ScriptedTokenEndpoint::default());
		let id = authorized(&registry, "client-1").await;
		let clock = manual_clock();
		let manager = ApplicationTokenManager::new(
			id.clone(),
			registry.clone(),
			endpoint.clone(),
			clock.clone(),
			Duration::seconds(60),
		);
		let cached = TokenRecord::builder()
			.access_token("cached")
			.issued_at(clock.now_utc())
			.expires_in(Duration::hours(1))
			.build()
			.expect("Record should build.");

		manager.seed(&cached);
		endpoint.push_refresh(Ok(token_record("fresh", None)));
		clock.advance(StdDuration::from_secs(58 * 60));

		assert_eq!(manager.access_token().await.expect("Token should be cached.").expose(), "cached");
		assert!(endpoint.seen_refresh_tokens.lock().is_empty());

		clock.advance(StdDuration::from_secs(90));

		assert_eq!(manager.access_token().await.expect("Token should refresh.").expose(), "fresh");
		assert_eq!(endpoint.seen_refresh_tokens.lock().len(), 1);
	}

	#[tokio::test]
	async fn rejected_grants_clear_the_stored_token() {
		let (registry, _store) = memory_registry();
		let endpoint = Arc::new(ScriptedTokenEndpoint::default());
		let id = authorized(&registry, "client-1").await;
		let other = authorized(&registry, "client-2").await;
		let manager = manager(&registry, endpoint.clone(), &id);

		registry.set_ready(&id, true).await.expect("Readiness should update.");
		registry.set_ready(&other, true).await.expect("Readiness should update.");
		endpoint.push_refresh(Err(Error::InvalidGrant { reason: "expired".into() }));

		let err = manager.refresh_access_token().await.expect_err("Refresh should fail.");

		assert!(matches!(err, Error::NeedsReauthorization { .. }));
		assert!(!registry.can_connect(&id));
		assert!(!registry.is_ready(&id));
		assert!(registry.can_connect(&other));
		assert!(registry.is_ready(&other));
		assert!(matches!(
			manager.refresh_access_token().await,
			Err(Error::Config(ConfigError::MissingRefreshToken))
		));
	}

	#[tokio::test]
	async fn other_failures_propagate_and_keep_the_token() {
		let (registry, _store) = memory_registry();
		let endpoint = Arc::new(ScriptedTokenEndpoint::default());
		let id = authorized(&registry, "client-1").await;
		let manager = manager(&registry, endpoint.clone(), &id);

		endpoint.push_refresh(Err(crate::error::UpstreamError::new("backend error").with_status(503).into()));

		assert!(matches!(manager.refresh_access_token().await, Err(Error::Upstream(_))));
		assert!(registry.can_connect(&id));
		assert_eq!(manager.metrics().failures(), 1);
	}

	struct SlowEndpoint(AtomicUsize);
	impl TokenEndpoint for SlowEndpoint {
		fn exchange_code<'a>(
			&'a self,
			_credentials: &'a ApplicationCredentials,
			_code: &'a str,
		) -> TokenEndpointFuture<'a> {
			Box::pin(async { Err(Error::Revoked) })
		}

		fn refresh<'a>(
			&'a self,
			_credentials: &'a ApplicationCredentials,
			_refresh_token: &'a TokenSecret,
		) -> TokenEndpointFuture<'a> {
			Box::pin(async move {
				self.0.fetch_add(1, Ordering::SeqCst);
				tokio::time::sleep(StdDuration::from_millis(50)).await;

				Ok(token_record("shared", None))
			})
		}
	}

	#[tokio::test(start_paused = true)]
	async fn concurrent_callers_share_one_refresh() {
		let (registry, _store) = memory_registry();
		let endpoint = Arc::new(SlowEndpoint(AtomicUsize::new(0)));
		let id = authorized(&registry, "client-1").await;
		let manager = manager(&registry, endpoint.clone(), &id);
		let (a, b, c) = tokio::join!(manager.access_token(), manager.access_token(), manager.access_token());

		for token in [a, b, c] {
			assert_eq!(token.expect("Every caller should receive the token.").expose(), "shared");
		}

		assert_eq!(endpoint.0.load(Ordering::SeqCst), 1);
	}
}
