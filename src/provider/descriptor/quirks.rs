// self
use crate::_prelude::*;

/// Provider-specific toggles that shape the consent redirect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderQuirks {
	/// Request `access_type=offline` so the provider issues a refresh token.
	pub offline_access: bool,
	/// Request `prompt=consent` so repeat authorizations still return a refresh token.
	pub force_consent: bool,
	/// Character used to join scopes when constructing `scope` parameters.
	pub scope_delimiter: char,
}
impl Default for ProviderQuirks {
	fn default() -> Self {
		Self { offline_access: false, force_consent: false, scope_delimiter: ' ' }
	}
}
