//! Persisted and runtime application records.
//!
//! [`PersistedApplication`] is exactly what lands on disk and has no readiness field.
//! [`RuntimeApplication`] pairs it with the readiness computed in this process; the two only
//! meet when the registry loads or saves.

// std
use std::ops::Deref;
// self
use crate::{_prelude::*, auth::ApplicationId, auth::TokenSecret, registry::RegistryError};

/// Polling budget of one application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuotaSettings {
	/// Units available per day.
	pub daily_quota: u64,
	/// Hours per day the bot is expected to stay connected.
	pub max_active_hours: f64,
	/// Use `custom_delay_seconds` instead of the computed delay.
	pub override_delay: bool,
	/// Manual poll delay; only honored when positive and `override_delay` is set.
	pub custom_delay_seconds: i64,
}
impl QuotaSettings {
	/// Rejects settings that cannot produce a poll delay.
	pub fn validate(&self) -> Result<(), RegistryError> {
		if self.daily_quota == 0 {
			return Err(RegistryError::InvalidQuotaSettings {
				reason: "dailyQuota must be positive".into(),
			});
		}
		if !(self.max_active_hours.is_finite() && self.max_active_hours > 0.) {
			return Err(RegistryError::InvalidQuotaSettings {
				reason: "maxActiveHours must be a positive number".into(),
			});
		}
		if self.custom_delay_seconds < 0 {
			return Err(RegistryError::InvalidQuotaSettings {
				reason: "customDelaySeconds cannot be negative".into(),
			});
		}

		Ok(())
	}
}
impl Default for QuotaSettings {
	fn default() -> Self {
		Self { daily_quota: 10_000, max_active_hours: 8., override_delay: false, custom_delay_seconds: 0 }
	}
}

/// Application record as stored in the applications document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedApplication {
	/// Generated identifier.
	pub id: ApplicationId,
	/// Unique display name (case-insensitive).
	pub name: String,
	/// OAuth client identifier; unique across applications.
	pub client_id: String,
	/// OAuth client secret.
	pub client_secret: TokenSecret,
	/// Refresh token; empty until the application is authorized.
	#[serde(default)]
	pub refresh_token: TokenSecret,
	/// Expiry of the last issued access token, in epoch millis.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub token_expires_at: Option<i64>,
	/// Polling budget.
	#[serde(default)]
	pub quota_settings: QuotaSettings,
}
impl PersistedApplication {
	/// An application can connect once it holds a refresh token.
	pub fn is_connectable(&self) -> bool {
		!self.refresh_token.is_empty()
	}

	/// Client credentials used at the token endpoint.
	pub fn credentials(&self) -> ApplicationCredentials {
		ApplicationCredentials {
			application_id: self.id.clone(),
			client_id: self.client_id.clone(),
			client_secret: self.client_secret.clone(),
		}
	}
}

/// Application as seen by the running process.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeApplication {
	/// Stored fields.
	pub application: PersistedApplication,
	/// `true` only after a token refresh succeeded in this process.
	pub ready: bool,
}
impl RuntimeApplication {
	/// Wraps a freshly loaded record; readiness always starts false.
	pub fn loaded(mut application: PersistedApplication) -> Self {
		application.token_expires_at = None;

		Self { application, ready: false }
	}
}
impl Deref for RuntimeApplication {
	type Target = PersistedApplication;

	fn deref(&self) -> &Self::Target {
		&self.application
	}
}

/// On-disk layout of the applications document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApplicationStorage {
	/// Applications keyed by identifier.
	pub applications: BTreeMap<ApplicationId, PersistedApplication>,
	/// Selected application, if any.
	pub active_application_id: Option<ApplicationId>,
}

/// Input of [`crate::registry::ApplicationRegistry::add`].
#[derive(Clone, Debug, PartialEq)]
pub struct NewApplication {
	/// Display name.
	pub name: String,
	/// OAuth client identifier.
	pub client_id: String,
	/// OAuth client secret.
	pub client_secret: String,
	/// Polling budget.
	pub quota_settings: QuotaSettings,
}

/// Partial update; `None` fields are left unchanged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApplicationUpdate {
	/// New display name.
	pub name: Option<String>,
	/// New OAuth client identifier; clears the refresh token when it differs.
	pub client_id: Option<String>,
	/// New OAuth client secret; clears the refresh token when it differs.
	pub client_secret: Option<String>,
	/// New polling budget.
	pub quota_settings: Option<QuotaSettings>,
}

/// Result of [`crate::registry::ApplicationRegistry::update`].
#[derive(Clone, Debug, PartialEq)]
pub struct ApplicationUpdated {
	/// Record after the update.
	pub application: RuntimeApplication,
	/// Client credentials changed, so existing authorization was dropped.
	pub credentials_changed: bool,
}

/// Client credentials of one application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplicationCredentials {
	/// Owning application.
	pub application_id: ApplicationId,
	/// OAuth client identifier.
	pub client_id: String,
	/// OAuth client secret.
	pub client_secret: TokenSecret,
}

/// Readiness transition reported by [`crate::registry::ApplicationRegistry::set_ready`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadinessChange {
	/// Readiness differs from before.
	pub changed: bool,
	/// The application was active and lost readiness, so the selection was cleared.
	pub cleared_active: bool,
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn stored_documents_never_carry_readiness() {
		let raw = r#"{
			"applications": {
				"app-1": {
					"id": "app-1",
					"name": "Main",
					"clientId": "client-1",
					"clientSecret": "secret-1",
					"refreshToken": "refresh-1",
					"tokenExpiresAt": 1741093200000,
					"ready": true,
					"quotaSettings": { "dailyQuota": 20000, "maxActiveHours": 12 }
				}
			},
			"activeApplicationId": "app-1"
		}"#;
		let storage: ApplicationStorage = serde_json::from_str(raw).expect("Fixture should parse.");
		let stored = storage.applications.values().next().cloned().expect("Fixture has one app.");
		let runtime = RuntimeApplication::loaded(stored);

		assert!(!runtime.ready);
		assert!(runtime.is_connectable());
		assert_eq!(runtime.token_expires_at, None);
		assert_eq!(runtime.quota_settings.daily_quota, 20_000);
		assert!(!runtime.quota_settings.override_delay);

		let json = serde_json::to_value(&storage).expect("Storage should serialize.");

		assert!(json["applications"]["app-1"].get("ready").is_none());
		assert_eq!(json["applications"]["app-1"]["clientSecret"], "secret-1");
	}

	#[test]
	fn quota_settings_validation() {
		assert!(QuotaSettings::default().validate().is_ok());
		assert!(QuotaSettings { daily_quota: 0, ..Default::default() }.validate().is_err());
		assert!(QuotaSettings { max_active_hours: 0., ..Default::default() }.validate().is_err());
		assert!(QuotaSettings { custom_delay_seconds: -1, ..Default::default() }.validate().is_err());
	}
}
