//! Provider descriptor shared by every registered application.
//!
//! The descriptor is transport-agnostic: it only knows where the endpoints live, which
//! scopes to request, and how the provider wants the authorization redirect shaped.

/// Builder API for assembling provider descriptors.
pub mod builder;
/// Grant identifiers used when classifying token endpoint failures.
pub mod grant;
/// Provider-specific quirk toggles.
pub mod quirks;

pub use builder::*;
pub use grant::*;
pub use quirks::*;

// self
use crate::{
	_prelude::*,
	auth::{ProviderId, ScopeSet},
};

/// Client authentication mode used at the token endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
	#[default]
	/// HTTP Basic with `client_id`/`client_secret`.
	ClientSecretBasic,
	/// Form POST body parameters for `client_id`/`client_secret`.
	ClientSecretPost,
}

/// Endpoint set declared by a provider descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoints {
	/// Consent screen the operator is redirected to.
	pub authorization: Url,
	/// Token endpoint used for code exchanges and refreshes.
	pub token: Url,
	/// Optional OpenID userinfo endpoint used to resolve the authorized account.
	pub userinfo: Option<Url>,
}

/// Immutable provider descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
	/// Descriptor identifier.
	pub id: ProviderId,
	/// Endpoint definitions exposed by the provider.
	pub endpoints: ProviderEndpoints,
	/// Callback URI registered for every application.
	pub redirect_uri: Url,
	/// Scopes requested during authorization.
	pub scopes: ScopeSet,
	/// Client authentication mechanism.
	pub client_auth_method: ClientAuthMethod,
	/// Provider-specific quirks.
	pub quirks: ProviderQuirks,
}
impl ProviderDescriptor {
	/// Scope granting read and write access to live chat.
	pub const YOUTUBE_CHAT_SCOPE: &'static str = "https://www.googleapis.com/auth/youtube.force-ssl";
	/// Scope used to resolve the authorized account's email.
	pub const USERINFO_EMAIL_SCOPE: &'static str = "https://www.googleapis.com/auth/userinfo.email";

	/// Creates a new builder for the provided identifier.
	pub fn builder(id: ProviderId) -> ProviderDescriptorBuilder {
		ProviderDescriptorBuilder::new(id)
	}

	/// Descriptor for Google's OAuth endpoints with the live chat scopes.
	pub fn youtube(redirect_uri: Url) -> Result<Self, ProviderDescriptorError> {
		let id = ProviderId::new("youtube").map_err(|_| ProviderDescriptorError::InvalidIdentifier)?;

		Self::builder(id)
			.authorization_endpoint(parse_static("https://accounts.google.com/o/oauth2/v2/auth")?)
			.token_endpoint(parse_static("https://oauth2.googleapis.com/token")?)
			.userinfo_endpoint(parse_static("https://www.googleapis.com/oauth2/v2/userinfo")?)
			.redirect_uri(redirect_uri)
			.scopes([Self::YOUTUBE_CHAT_SCOPE, Self::USERINFO_EMAIL_SCOPE])
			.quirks(ProviderQuirks { offline_access: true, force_consent: true, ..Default::default() })
			.build()
	}

	/// Builds the consent URL for `client_id` carrying the opaque `state`.
	///
	/// `extra` pairs come from the provider strategy and are appended after the standard
	/// parameters.
	pub fn authorization_url(&self, client_id: &str, state: &str, extra: &[(String, String)]) -> Url {
		let mut url = self.endpoints.authorization.clone();
		let mut pairs = url.query_pairs_mut();

		pairs.append_pair("response_type", "code");
		pairs.append_pair("client_id", client_id);
		pairs.append_pair("redirect_uri", self.redirect_uri.as_str());

		if let Some(scope) = self.scopes.joined(self.quirks.scope_delimiter) {
			pairs.append_pair("scope", &scope);
		}

		pairs.append_pair("state", state);

		for (key, value) in extra {
			pairs.append_pair(key, value);
		}

		drop(pairs);

		url
	}
}

fn parse_static(raw: &str) -> Result<Url, ProviderDescriptorError> {
	Url::parse(raw).map_err(|_| ProviderDescriptorError::InvalidUrl { url: raw.to_owned() })
}
