//! Provider strategy hooks.
//!
//! A strategy classifies token endpoint failures and contributes provider-specific
//! authorization parameters without tying the lifecycle manager to an HTTP client.

// self
use crate::{
	_prelude::*,
	provider::{GrantType, ProviderDescriptor},
};

/// Strategy hook that lets providers classify errors and decorate the consent redirect.
pub trait ProviderStrategy
where
	Self: Send + Sync,
{
	/// Maps a token endpoint failure into the broker taxonomy.
	fn classify_token_error(&self, ctx: &ProviderErrorContext) -> ProviderErrorKind;

	/// Extra query parameters appended to the authorization URL.
	///
	/// The default derives `access_type=offline` and `prompt=consent` from the descriptor's
	/// quirks.
	fn authorization_params(&self, descriptor: &ProviderDescriptor) -> Vec<(String, String)> {
		let mut params = Vec::new();

		if descriptor.quirks.offline_access {
			params.push(("access_type".into(), "offline".into()));
		}
		if descriptor.quirks.force_consent {
			params.push(("prompt".into(), "consent".into()));
		}

		params
	}
}

/// Canonical provider error categories used by strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderErrorKind {
	/// The refresh token or code is no longer accepted; the application must re-authorize.
	InvalidGrant,
	/// Client credentials were rejected.
	InvalidClient,
	/// Requested scopes exceed what the grant covers.
	InsufficientScope,
	/// Failure is temporary and should be retried.
	Transient,
}

/// Context passed to provider strategies when classifying token errors.
///
/// Only primitive data is carried so strategies stay independent of the HTTP client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderErrorContext {
	/// Grant type associated with the failing request.
	pub grant_type: GrantType,
	/// HTTP status code returned by the provider, when available.
	pub http_status: Option<u16>,
	/// Provider-supplied OAuth `error` field.
	pub oauth_error: Option<String>,
	/// Provider-supplied OAuth `error_description` field.
	pub error_description: Option<String>,
	/// Indicates whether the failure originated from the network/transport layer.
	pub network_error: bool,
}
impl ProviderErrorContext {
	/// Creates a new context scoped to the provided grant type.
	pub fn new(grant_type: GrantType) -> Self {
		Self {
			grant_type,
			http_status: None,
			oauth_error: None,
			error_description: None,
			network_error: false,
		}
	}

	/// Convenience constructor for transport-level failures.
	pub fn network_failure(grant_type: GrantType) -> Self {
		Self { network_error: true, ..Self::new(grant_type) }
	}

	/// Adds an HTTP status code.
	pub fn with_http_status(mut self, status: u16) -> Self {
		self.http_status = Some(status);

		self
	}

	/// Adds the OAuth error code string returned by the provider.
	pub fn with_oauth_error(mut self, error: impl Into<String>) -> Self {
		self.oauth_error = Some(error.into());

		self
	}

	/// Adds the OAuth `error_description` field.
	pub fn with_error_description(mut self, description: impl Into<String>) -> Self {
		self.error_description = Some(description.into());

		self
	}
}

/// Default strategy.
///
/// Structured OAuth fields win, then hints in the description, then the HTTP status. A 401
/// on a refresh means the stored refresh token is dead, so it counts as an invalid grant.
#[derive(Debug, Default)]
pub struct DefaultProviderStrategy;
impl Display for DefaultProviderStrategy {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("default-provider-strategy")
	}
}
impl ProviderStrategy for DefaultProviderStrategy {
	fn classify_token_error(&self, ctx: &ProviderErrorContext) -> ProviderErrorKind {
		if ctx.network_error {
			return ProviderErrorKind::Transient;
		}

		ctx.oauth_error
			.as_deref()
			.and_then(classify_code)
			.or_else(|| ctx.error_description.as_deref().and_then(classify_description))
			.unwrap_or_else(|| classify_status(ctx.grant_type, ctx.http_status))
	}
}

fn classify_code(code: &str) -> Option<ProviderErrorKind> {
	const TABLE: &[(&str, ProviderErrorKind)] = &[
		("invalid_grant", ProviderErrorKind::InvalidGrant),
		("access_denied", ProviderErrorKind::InvalidGrant),
		("invalid_client", ProviderErrorKind::InvalidClient),
		("unauthorized_client", ProviderErrorKind::InvalidClient),
		("invalid_scope", ProviderErrorKind::InsufficientScope),
		("insufficient_scope", ProviderErrorKind::InsufficientScope),
		("temporarily_unavailable", ProviderErrorKind::Transient),
		("server_error", ProviderErrorKind::Transient),
	];

	TABLE.iter().find(|(name, _)| code.eq_ignore_ascii_case(name)).map(|(_, kind)| *kind)
}

fn classify_description(description: &str) -> Option<ProviderErrorKind> {
	let lowered = description.to_ascii_lowercase();

	if lowered.contains("revoked") || lowered.contains("invalid_grant") {
		Some(ProviderErrorKind::InvalidGrant)
	} else if lowered.contains("invalid_client") {
		Some(ProviderErrorKind::InvalidClient)
	} else if lowered.contains("scope") {
		Some(ProviderErrorKind::InsufficientScope)
	} else {
		None
	}
}

fn classify_status(grant: GrantType, status: Option<u16>) -> ProviderErrorKind {
	match (grant, status) {
		(_, Some(400)) => ProviderErrorKind::InvalidGrant,
		(GrantType::RefreshToken, Some(401)) => ProviderErrorKind::InvalidGrant,
		(GrantType::AuthorizationCode, Some(401)) => ProviderErrorKind::InvalidClient,
		(_, Some(403)) => ProviderErrorKind::InsufficientScope,
		_ => ProviderErrorKind::Transient,
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn oauth_codes_take_priority() {
		let ctx = ProviderErrorContext::new(GrantType::RefreshToken)
			.with_http_status(503)
			.with_oauth_error("invalid_grant")
			.with_error_description("Token has been expired or revoked.");

		assert_eq!(DefaultProviderStrategy.classify_token_error(&ctx), ProviderErrorKind::InvalidGrant);
	}

	#[test]
	fn refresh_401_means_reauthorization() {
		let refresh = ProviderErrorContext::new(GrantType::RefreshToken).with_http_status(401);
		let exchange = ProviderErrorContext::new(GrantType::AuthorizationCode).with_http_status(401);

		assert_eq!(
			DefaultProviderStrategy.classify_token_error(&refresh),
			ProviderErrorKind::InvalidGrant
		);
		assert_eq!(
			DefaultProviderStrategy.classify_token_error(&exchange),
			ProviderErrorKind::InvalidClient
		);
	}

	#[test]
	fn network_and_server_failures_are_transient() {
		let network = ProviderErrorContext::network_failure(GrantType::RefreshToken);
		let server = ProviderErrorContext::new(GrantType::RefreshToken).with_http_status(502);

		assert_eq!(DefaultProviderStrategy.classify_token_error(&network), ProviderErrorKind::Transient);
		assert_eq!(DefaultProviderStrategy.classify_token_error(&server), ProviderErrorKind::Transient);
	}
}
