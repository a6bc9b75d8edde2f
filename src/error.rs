//! Broker-level error types shared across the ledger, token lifecycle, registry, and stream.

// self
use crate::{_prelude::*, auth::ApplicationId};

/// Broker-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical broker error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Storage-layer failure.
	#[error("{0}")]
	Storage(
		#[from]
		#[source]
		crate::store::StoreError,
	),
	/// Local configuration problem; fails fast at the call site.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Application registry rejected the operation.
	#[error(transparent)]
	Registry(#[from] crate::registry::RegistryError),
	/// Temporary upstream failure; retry after the safe delay.
	#[error(transparent)]
	Transient(#[from] TransientError),
	/// Transport failure (DNS, TCP, TLS).
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Upstream API call failed; see [`crate::quota::is_quota_exceeded_error`].
	#[error(transparent)]
	Upstream(#[from] UpstreamError),

	/// Token lacks the scopes required by the upstream API.
	#[error("Token lacks the required scopes: {reason}.")]
	InsufficientScope {
		/// Provider- or broker-supplied reason string.
		reason: String,
	},
	/// Provider rejected the grant (e.g., bad code or refresh token).
	#[error("Provider rejected the grant: {reason}.")]
	InvalidGrant {
		/// Provider- or broker-supplied reason string.
		reason: String,
	},
	/// Client authentication failed or credentials are malformed.
	#[error("Client authentication failed: {reason}.")]
	InvalidClient {
		/// Provider- or broker-supplied reason string.
		reason: String,
	},
	/// Token has been revoked and must not be reused.
	#[error("Token has been revoked.")]
	Revoked,
	/// The stored refresh token was rejected and has been cleared.
	#[error("Application {application} needs to be re-authorized.")]
	NeedsReauthorization {
		/// Application whose refresh token was cleared.
		application: ApplicationId,
	},
}
impl Error {
	/// Returns `true` when the error means the refresh token can no longer be used.
	pub fn is_authorization_rejected(&self) -> bool {
		matches!(
			self,
			Error::InvalidGrant { .. }
				| Error::InvalidClient { .. }
				| Error::Revoked | Error::NeedsReauthorization { .. }
		)
	}

	/// Returns the upstream error when this failure originated from an API call.
	pub fn as_upstream(&self) -> Option<&UpstreamError> {
		match self {
			Error::Upstream(inner) => Some(inner),
			_ => None,
		}
	}
}

/// Configuration and validation failures raised by the broker.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
	/// HTTP request construction failed.
	#[error(transparent)]
	HttpRequest(#[from] oauth2::http::Error),
	/// Provider descriptor contains an invalid URL.
	#[error("Descriptor contains an invalid URL.")]
	InvalidDescriptor {
		/// Underlying parsing failure.
		#[source]
		source: oauth2::url::ParseError,
	},
	/// Redirect URI cannot be parsed.
	#[error("Redirect URI is invalid.")]
	InvalidRedirect {
		/// Underlying parsing failure.
		#[source]
		source: oauth2::url::ParseError,
	},
	/// Configuration document could not be parsed.
	#[error("Configuration is invalid at `{path}`: {message}.")]
	Parse {
		/// Path to the offending field.
		path: String,
		/// Parser message.
		message: String,
	},
	/// Reference timezone is not a known IANA zone name.
	#[error("Unknown reference timezone `{name}`.")]
	InvalidTimezone {
		/// Rejected zone name.
		name: String,
	},

	/// Quota settings cannot produce a polling delay.
	#[error("Quota settings are invalid: {reason}.")]
	InvalidQuotaSettings {
		/// Why the settings were rejected.
		reason: String,
	},
	/// Application is unknown to the registry.
	#[error("Application {application} does not exist.")]
	UnknownApplication {
		/// Requested application.
		application: ApplicationId,
	},
	/// Application has no OAuth client identifier.
	#[error("Application {application} is missing a client id.")]
	MissingClientId {
		/// Requested application.
		application: ApplicationId,
	},
	/// Application has no refresh token stored.
	#[error("Application has no refresh token; authorize it first.")]
	MissingRefreshToken,
	/// No application is selected as active.
	#[error("No active application is selected.")]
	NoActiveApplication,
	/// Application has not completed a token refresh in this process.
	#[error("Application {application} is not ready.")]
	ApplicationNotReady {
		/// Requested application.
		application: ApplicationId,
	},
	/// The operation needs a live chat connection.
	#[error("Not connected to a live chat.")]
	NotConnected,
	/// Token endpoint response omitted `expires_in`.
	#[error("Token endpoint response is missing expires_in.")]
	MissingExpiresIn,
	/// Token endpoint returned an excessively large `expires_in`.
	#[error("The expires_in value exceeds the supported range.")]
	ExpiresInOutOfRange,
	/// Token endpoint returned a non-positive duration.
	#[error("The expires_in value must be positive.")]
	NonPositiveExpiresIn,
	/// Token record builder validation failed.
	#[error("Unable to build token record.")]
	TokenBuild(#[from] crate::auth::TokenRecordBuilderError),
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}

	/// Converts a path-aware JSON failure into [`ConfigError::Parse`].
	pub fn from_json(err: serde_path_to_error::Error<serde_json::Error>) -> Self {
		let path = err.path().to_string();

		Self::Parse { path, message: err.into_inner().to_string() }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}

/// Temporary failure variants (safe to retry).
#[derive(Debug, ThisError)]
pub enum TransientError {
	/// Provider returned an unexpected but non-fatal response.
	#[error("Token endpoint returned an unexpected response: {message}.")]
	TokenEndpoint {
		/// Provider- or broker-supplied message summarizing the failure.
		message: String,
		/// HTTP status code, when available.
		status: Option<u16>,
		/// Retry-After hint from upstream, if supplied.
		retry_after: Option<Duration>,
	},
	/// Token endpoint responded with malformed JSON that could not be parsed.
	#[error("Token endpoint returned malformed JSON.")]
	TokenResponseParse {
		/// Structured parsing failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::error::Error>,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
}

/// Transport-level failures (network, IO).
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling the provider.")]
	Network {
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred while calling the provider.")]
	Io(#[from] std::io::Error),
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Box::new(src) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		Self::network(e)
	}
}

/// Failure reported by an upstream API call (message source, message send, lookups).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
#[error("Upstream call failed: {message}.")]
pub struct UpstreamError {
	/// HTTP status code, when available.
	pub status: Option<u16>,
	/// Structured reason code (e.g. `quotaExceeded`), when available.
	pub reason: Option<String>,
	/// Human-readable message.
	pub message: String,
}
impl UpstreamError {
	/// Creates an error carrying only a message.
	pub fn new(message: impl Into<String>) -> Self {
		Self { status: None, reason: None, message: message.into() }
	}

	/// Attaches an HTTP status code.
	pub fn with_status(mut self, status: u16) -> Self {
		self.status = Some(status);

		self
	}

	/// Attaches a structured reason code.
	pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
		self.reason = Some(reason.into());

		self
	}
}
