//! Consent redirect handling: state encoding, parameter validation, and HTTP-style failures.

// crates.io
use rand::{Rng, distr::Alphanumeric};
// self
use crate::{_prelude::*, auth::ApplicationId};

const NONCE_LEN: usize = 32;

/// JSON payload carried in the OAuth `state` parameter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationState {
	/// Application the consent is for.
	pub application_id: ApplicationId,
	/// Random CSRF token.
	#[serde(default)]
	pub nonce: String,
}
impl AuthorizationState {
	/// Creates a state for `application_id` with a fresh nonce.
	pub fn new(application_id: ApplicationId) -> Self {
		let nonce = rand::rng().sample_iter(Alphanumeric).take(NONCE_LEN).map(char::from).collect();

		Self { application_id, nonce }
	}

	/// Serializes the state for the `state` query parameter.
	pub fn encode(&self) -> String {
		serde_json::json!({ "applicationId": &*self.application_id, "nonce": self.nonce }).to_string()
	}

	/// Parses a returned `state` value.
	pub fn decode(raw: &str) -> Result<Self, CallbackError> {
		let mut de = serde_json::Deserializer::from_str(raw);

		serde_path_to_error::deserialize(&mut de).map_err(|e| {
			CallbackError::bad_request(format!("The state parameter is malformed at `{}`.", e.path()))
		})
	}
}

/// Consent URL plus the state embedded in it.
#[derive(Clone, Debug)]
pub struct AuthorizationRequest {
	/// URL to send the operator to.
	pub url: Url,
	/// State carried by the URL.
	pub state: AuthorizationState,
}

/// Query parameters of the consent redirect.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct CallbackParams {
	/// Authorization code.
	pub code: Option<String>,
	/// State echoed back by the provider.
	pub state: Option<String>,
	/// Error reported by the provider (for example `access_denied`).
	pub error: Option<String>,
}
impl CallbackParams {
	pub(crate) fn validate(self) -> Result<(String, AuthorizationState), CallbackError> {
		if let Some(error) = self.error.filter(|error| !error.trim().is_empty()) {
			return Err(CallbackError::bad_request(format!("Authorization was denied: {error}.")));
		}

		let code = self
			.code
			.filter(|code| !code.trim().is_empty())
			.ok_or_else(|| CallbackError::bad_request("Missing authorization code."))?;
		let state = self
			.state
			.filter(|state| !state.trim().is_empty())
			.ok_or_else(|| CallbackError::bad_request("Missing state parameter."))?;

		Ok((code, AuthorizationState::decode(&state)?))
	}
}

/// Callback failure with the HTTP status a route handler should answer with.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
#[error("{message}")]
pub struct CallbackError {
	/// HTTP status code.
	pub status: u16,
	/// Operator-facing explanation.
	pub message: String,
}
impl CallbackError {
	/// 400 with `message`.
	pub fn bad_request(message: impl Into<String>) -> Self {
		Self { status: 400, message: message.into() }
	}

	/// 500 with `message`.
	pub fn internal(message: impl Into<String>) -> Self {
		Self { status: 500, message: message.into() }
	}

	pub(crate) fn missing_refresh_token() -> Self {
		Self::bad_request(
			"The provider did not return a refresh token. Remove the app's access from the \
			 account's security settings or authorize again in a private browsing window.",
		)
	}

	pub(crate) fn exchange_failed(err: &Error) -> Self {
		let status = if err.is_authorization_rejected() { 400 } else { 502 };

		Self { status, message: format!("Failed to exchange the authorization code: {err}") }
	}
}

/// Masks the local part of an email for logs: `jane@example.com` becomes `j***@example.com`.
pub fn redact_email(email: &str) -> String {
	match email.split_once('@') {
		Some((local, domain)) => {
			let first = local.chars().next().map(String::from).unwrap_or_default();

			format!("{first}***@{domain}")
		},
		None => "***".into(),
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn state_round_trips_through_the_query() {
		let id = ApplicationId::new("app-1").expect("Id should be valid.");
		let state = AuthorizationState::new(id.clone());
		let encoded = state.encode();

		assert!(encoded.contains(r#""applicationId":"app-1""#));
		assert_eq!(state.nonce.len(), NONCE_LEN);
		assert_eq!(AuthorizationState::decode(&encoded).expect("State should decode."), state);
		assert_eq!(
			AuthorizationState::decode(r#"{"applicationId":"app-1"}"#)
				.expect("Nonce is optional.")
				.application_id,
			id
		);
	}

	#[test]
	fn provider_errors_and_blank_parameters_are_rejected() {
		let denied = CallbackParams {
			code: Some("code".into()),
			state: Some("{}".into()),
			error: Some("access_denied".into()),
		};

		assert!(denied.validate().expect_err("Denied consent fails.").message.contains("access_denied"));

		let blank = CallbackParams { code: Some("  ".into()), state: Some("{}".into()), error: None };

		assert_eq!(blank.validate().expect_err("Blank code fails.").status, 400);
	}

	#[test]
	fn exchange_failures_split_by_cause() {
		let rejected = CallbackError::exchange_failed(&Error::InvalidGrant { reason: "bad code".into() });
		let upstream = CallbackError::exchange_failed(&Error::Revoked);
		let transient = CallbackError::exchange_failed(
			&crate::error::UpstreamError::new("boom").with_status(503).into(),
		);

		assert_eq!(rejected.status, 400);
		assert_eq!(upstream.status, 400);
		assert_eq!(transient.status, 502);
	}

	#[test]
	fn emails_are_masked() {
		assert_eq!(redact_email("jane@example.com"), "j***@example.com");
		assert_eq!(redact_email("@example.com"), "***@example.com");
		assert_eq!(redact_email("not-an-email"), "***");
	}
}
