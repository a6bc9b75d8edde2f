//! Operational settings for the broker.
//!
//! Every field has a default so an empty JSON object is a valid configuration. Parsing goes
//! through `serde_path_to_error`, so a bad value is reported with the path of the field that
//! rejected it.

// crates.io
use chrono_tz::Tz;
// self
use crate::{_prelude::*, error::ConfigError};

/// Broker configuration document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct BrokerConfig {
	/// Store key of the applications document.
	pub applications_file: String,
	/// Store key of the quota tracking document.
	pub quota_file: String,
	/// IANA zone whose midnight resets the daily quota.
	pub reference_timezone: String,
	/// Period of the background token refresh, in seconds.
	pub refresh_interval_secs: u64,
	/// Debounce window for quota ledger writes, in seconds.
	pub quota_flush_debounce_secs: u64,
	/// Cached access tokens are refreshed this many seconds before they expire.
	pub token_preemptive_window_secs: u64,
	/// Mirror non-critical failures into the chat feed as alerts.
	pub mirror_errors_to_chat_feed: bool,
	/// Source identifier attached to emitted events.
	pub event_source_id: String,
}
impl BrokerConfig {
	/// Zone used when none is configured; the upstream resets quotas at Pacific midnight.
	pub const DEFAULT_TIMEZONE: &'static str = "America/Los_Angeles";

	/// Parses a JSON configuration document and validates it.
	pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
		let mut de = serde_json::Deserializer::from_str(raw);
		let config: Self =
			serde_path_to_error::deserialize(&mut de).map_err(ConfigError::from_json)?;

		config.validate()?;

		Ok(config)
	}

	/// Checks cross-field invariants.
	pub fn validate(&self) -> Result<(), ConfigError> {
		self.timezone()?;

		if self.refresh_interval_secs == 0 {
			return Err(ConfigError::Parse {
				path: "refreshIntervalSecs".into(),
				message: "must be greater than zero".into(),
			});
		}
		if self.applications_file == self.quota_file {
			return Err(ConfigError::Parse {
				path: "quotaFile".into(),
				message: "must differ from applicationsFile".into(),
			});
		}

		Ok(())
	}

	/// Resolves the reference timezone.
	pub fn timezone(&self) -> Result<Tz, ConfigError> {
		self.reference_timezone
			.parse::<Tz>()
			.map_err(|_| ConfigError::InvalidTimezone { name: self.reference_timezone.clone() })
	}

	/// Background refresh period.
	pub fn refresh_interval(&self) -> StdDuration {
		StdDuration::from_secs(self.refresh_interval_secs)
	}

	/// Debounce window for ledger writes.
	pub fn quota_flush_debounce(&self) -> StdDuration {
		StdDuration::from_secs(self.quota_flush_debounce_secs)
	}

	/// Preemptive refresh window for cached access tokens.
	pub fn token_preemptive_window(&self) -> Duration {
		Duration::seconds(i64::try_from(self.token_preemptive_window_secs).unwrap_or(i64::MAX))
	}
}
impl Default for BrokerConfig {
	fn default() -> Self {
		Self {
			applications_file: "applications.json".into(),
			quota_file: "quota-tracking.json".into(),
			reference_timezone: Self::DEFAULT_TIMEZONE.into(),
			refresh_interval_secs: 50 * 60,
			quota_flush_debounce_secs: 5,
			token_preemptive_window_secs: 60,
			mirror_errors_to_chat_feed: true,
			event_source_id: "livechat-broker".into(),
		}
	}
}
