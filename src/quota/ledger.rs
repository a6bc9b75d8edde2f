//! Per-application quota accounting with debounced persistence.
//!
//! Each application gets a [`QuotaUsage`] record, created on its first recorded call and
//! reset in place once the clock passes its reset boundary. Threshold notifications fire
//! once per newly crossed integer percentage, in ascending order, and never on corrective
//! (negative) adjustments. Mutations schedule a single debounced write; the write stores
//! whatever the ledger holds when it fires.

// crates.io
use chrono_tz::Tz;
use tokio::runtime::Handle;
// self
use crate::{
	_prelude::*,
	auth::ApplicationId,
	clock::Clock,
	events::{BrokerEvent, EventSink, QuotaThresholdEvent},
	obs,
	quota::{boundary, schedule},
	registry::QuotaSettings,
	store::{self, KeyValueStore, StoreError},
	timer::ScheduledTask,
};

/// Name and daily quota of an application, as the ledger needs them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaProfile {
	/// Display name used in threshold notifications.
	pub name: String,
	/// Daily quota in units.
	pub daily_quota: u64,
}

/// Resolves quota profiles; the application registry is the production implementation.
pub trait QuotaProfileSource
where
	Self: Send + Sync,
{
	/// Returns the profile of `application_id`, or `None` when it is unknown.
	fn quota_profile(&self, application_id: &ApplicationId) -> Option<QuotaProfile>;
}

/// Persisted usage record of one application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
	/// Units consumed since the last reset; negative only after corrective adjustments.
	pub quota_units_used: i64,
	/// Epoch millis of the next reset.
	pub quota_reset_time: i64,
	/// Epoch millis of the last mutation.
	pub last_updated: i64,
	/// Highest percentage already notified in this reset cycle.
	pub last_threshold_notified: u8,
}
impl QuotaUsage {
	fn fresh(now: i64, reset_at: i64) -> Self {
		Self {
			quota_units_used: 0,
			quota_reset_time: reset_at,
			last_updated: now,
			last_threshold_notified: 0,
		}
	}

	fn is_expired_at(&self, now: i64) -> bool {
		now >= self.quota_reset_time
	}
}

type UsageMap = BTreeMap<ApplicationId, QuotaUsage>;

/// Collaborators and settings of a [`QuotaLedger`].
pub struct QuotaLedgerOptions {
	/// Backing store.
	pub store: Arc<dyn KeyValueStore>,
	/// Store key of the tracking document.
	pub path: String,
	/// Wall clock used for resets and timestamps.
	pub clock: Arc<dyn Clock>,
	/// Zone whose midnight resets usage.
	pub timezone: Tz,
	/// Resolves names and daily quotas.
	pub profiles: Arc<dyn QuotaProfileSource>,
	/// Receives threshold notifications.
	pub events: Arc<dyn EventSink>,
	/// Source identifier attached to emitted events.
	pub source_id: String,
	/// Debounce window for writes.
	pub debounce: StdDuration,
}

/// Quota ledger shared by the poll loop and every other subsystem that spends quota.
#[derive(Clone)]
pub struct QuotaLedger(Arc<LedgerInner>);
impl QuotaLedger {
	/// Creates an empty ledger; call [`QuotaLedger::initialize`] to load persisted usage.
	pub fn new(options: QuotaLedgerOptions) -> Self {
		Self(Arc::new(LedgerInner {
			options,
			records: Mutex::new(UsageMap::new()),
			pending: Mutex::new(None),
			write_guard: AsyncMutex::new(()),
		}))
	}

	/// Loads persisted usage; unreadable or corrupt content leaves the ledger empty.
	pub async fn initialize(&self) {
		let options = &self.0.options;
		let loaded = store::load_json::<UsageMap>(options.store.as_ref(), &options.path)
			.await
			.unwrap_or_default();

		tracing::info!(path = %options.path, applications = loaded.len(), "Quota ledger loaded.");

		*self.0.records.lock() = loaded;
	}

	/// Records a call costing `unit_cost` units against `application_id`.
	///
	/// Negative costs are corrective adjustments: they lower usage but never notify and never
	/// lower the notified high-water mark.
	pub fn record_api_call(&self, application_id: &ApplicationId, call_label: &str, unit_cost: i64) {
		let options = &self.0.options;
		let now = options.clock.now_millis();
		let profile = options.profiles.quota_profile(application_id);
		let mut crossed = Vec::new();
		let consumed = {
			let mut records = self.0.records.lock();
			let record = records.entry(application_id.clone()).or_insert_with(|| {
				QuotaUsage::fresh(now, boundary::next_reset_millis(now, options.timezone))
			});

			if record.is_expired_at(now) {
				tracing::info!(
					application = %application_id,
					previous_units = record.quota_units_used,
					"Daily quota reset."
				);

				*record = QuotaUsage::fresh(now, boundary::next_reset_millis(now, options.timezone));
			}

			record.quota_units_used = record.quota_units_used.saturating_add(unit_cost);
			record.last_updated = now;

			let daily_quota = profile.as_ref().map(|profile| profile.daily_quota).unwrap_or(0);

			if unit_cost > 0 && daily_quota > 0 {
				let percent = usage_percent(record.quota_units_used, daily_quota);

				if percent > record.last_threshold_notified {
					crossed.extend((record.last_threshold_notified + 1)..=percent);
					record.last_threshold_notified = percent;
				}
			}

			record.quota_units_used
		};

		tracing::debug!(
			application = %application_id,
			call = call_label,
			cost = unit_cost,
			used = consumed,
			"Quota spend recorded."
		);
		obs::record_quota_units(application_id, unit_cost);

		if let Some(profile) = profile {
			for threshold in crossed {
				let event = BrokerEvent::QuotaThreshold(QuotaThresholdEvent {
					application_id: application_id.clone(),
					application_name: profile.name.clone(),
					quota_consumed: consumed,
					quota_limit: profile.daily_quota,
					threshold,
				});

				options.events.emit(&options.source_id, &event);
			}
		}

		self.schedule_persist();
	}

	/// Current usage of `application_id`; a record past its reset boundary reads as zero.
	pub fn quota_usage(&self, application_id: &ApplicationId) -> Option<QuotaUsage> {
		let now = self.0.options.clock.now_millis();
		let record = self.0.records.lock().get(application_id).cloned()?;

		if record.is_expired_at(now) {
			return Some(QuotaUsage::fresh(
				now,
				boundary::next_reset_millis(now, self.0.options.timezone),
			));
		}

		Some(record)
	}

	/// Units left today: `max(0, daily_quota - used)`.
	pub fn quota_remaining(&self, application_id: &ApplicationId, daily_quota: u64) -> u64 {
		let used = self.quota_usage(application_id).map(|usage| usage.quota_units_used).unwrap_or(0);
		let remaining = i128::from(daily_quota) - i128::from(used);

		u64::try_from(remaining.max(0)).unwrap_or(u64::MAX)
	}

	/// Returns `true` when `needed_units` still fit in today's budget.
	pub fn is_quota_available(
		&self,
		application_id: &ApplicationId,
		needed_units: u64,
		daily_quota: u64,
	) -> bool {
		let remaining = self.quota_remaining(application_id, daily_quota);

		if remaining < needed_units {
			tracing::warn!(
				application = %application_id,
				needed = needed_units,
				remaining,
				"Insufficient quota remaining."
			);

			return false;
		}

		true
	}

	/// Delay for `settings`; see [`schedule::calculate_delay`].
	pub fn calculate_delay(&self, settings: &QuotaSettings) -> Option<u64> {
		schedule::calculate_delay(settings)
	}

	/// Drops the record of a deleted application.
	pub fn remove(&self, application_id: &ApplicationId) {
		if self.0.records.lock().remove(application_id).is_some() {
			self.schedule_persist();
		}
	}

	/// Cancels any pending debounced write and persists immediately.
	pub async fn flush(&self) -> Result<(), StoreError> {
		if let Some(task) = self.0.pending.lock().take() {
			task.cancel();
		}

		self.0.persist().await
	}

	fn schedule_persist(&self) {
		let mut pending = self.0.pending.lock();

		if pending.as_ref().is_some_and(|task| !task.is_finished()) {
			return;
		}
		if Handle::try_current().is_err() {
			tracing::debug!("No async runtime; quota changes stay in memory until flushed.");

			return;
		}

		let weak = Arc::downgrade(&self.0);

		*pending = Some(ScheduledTask::once("quota-flush", self.0.options.debounce, async move {
			let Some(inner) = weak.upgrade() else { return };

			inner.pending.lock().take();

			if let Err(e) = inner.persist().await {
				tracing::error!("Failed to persist quota usage: {e}");
			}
		}));
	}
}
impl Debug for QuotaLedger {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("QuotaLedger")
			.field("path", &self.0.options.path)
			.field("timezone", &self.0.options.timezone)
			.field("applications", &self.0.records.lock().len())
			.finish()
	}
}

struct LedgerInner {
	options: QuotaLedgerOptions,
	records: Mutex<UsageMap>,
	pending: Mutex<Option<ScheduledTask>>,
	write_guard: AsyncMutex<()>,
}
impl LedgerInner {
	async fn persist(&self) -> Result<(), StoreError> {
		let _guard = self.write_guard.lock().await;
		let snapshot = self.records.lock().clone();

		store::save_json(self.options.store.as_ref(), &self.options.path, &snapshot).await
	}
}

fn usage_percent(used: i64, daily_quota: u64) -> u8 {
	let percent = (i128::from(used) * 100 / i128::from(daily_quota)).clamp(0, 100);

	u8::try_from(percent).unwrap_or(100)
}
