//! `oauth2`-backed token endpoint and userinfo account lookup.
//!
//! [`OAuthTokenEndpoint`] turns per-application credentials plus the shared
//! [`ProviderDescriptor`] into `oauth2` requests, then maps every failure through the
//! [`ProviderStrategy`] so the lifecycle manager only ever sees broker errors.

pub use oauth2;

// crates.io
use oauth2::{
	AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, EndpointNotSet, EndpointSet,
	HttpClientError, RedirectUrl, RefreshToken, RequestTokenError, TokenResponse, TokenUrl,
	basic::{BasicClient, BasicErrorResponse, BasicRequestTokenError, BasicTokenResponse},
};
// self
use crate::{
	_prelude::*,
	auth::{TokenRecord, TokenSecret},
	error::{ConfigError, TransientError, TransportError},
	http::{ResponseMetadata, ResponseMetadataSlot, TokenHttpClient},
	lifecycle::{ApplicationCredentials, TokenEndpoint, TokenEndpointFuture},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	provider::{
		ClientAuthMethod, DefaultProviderStrategy, GrantType, ProviderDescriptor,
		ProviderErrorContext, ProviderErrorKind, ProviderStrategy,
	},
};
#[cfg(feature = "reqwest")]
use crate::{
	http::ReqwestHttpClient,
	lifecycle::{AccountFuture, AccountLookup},
};

#[cfg(feature = "reqwest")]
/// Token endpoint specialized for the crate's default reqwest transport stack.
pub type ReqwestTokenEndpoint = OAuthTokenEndpoint<ReqwestHttpClient, ReqwestTransportErrorMapper>;

type ConfiguredBasicClient =
	BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Maps HTTP transport failures into broker [`Error`] values.
pub trait TransportErrorMapper<E>
where
	Self: 'static + Send + Sync,
	E: 'static + Send + Sync + StdError,
{
	/// Converts an [`HttpClientError`] emitted by the transport into a broker error.
	fn map_transport_error(
		&self,
		grant: GrantType,
		metadata: Option<&ResponseMetadata>,
		error: HttpClientError<E>,
	) -> Error;
}

/// Default mapper for reqwest-backed transports.
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransportErrorMapper;
#[cfg(feature = "reqwest")]
impl TransportErrorMapper<ReqwestError> for ReqwestTransportErrorMapper {
	fn map_transport_error(
		&self,
		grant: GrantType,
		meta: Option<&ResponseMetadata>,
		err: HttpClientError<ReqwestError>,
	) -> Error {
		match err {
			HttpClientError::Reqwest(inner) if inner.is_builder() => ConfigError::from(*inner).into(),
			HttpClientError::Reqwest(inner) if inner.is_timeout() => transient(
				format!("{grant} request timed out"),
				meta_status(meta).or_else(|| inner.status().map(|code| code.as_u16())),
				meta,
			),
			HttpClientError::Reqwest(inner) => TransportError::from(*inner).into(),
			HttpClientError::Http(inner) => ConfigError::from(inner).into(),
			HttpClientError::Io(inner) => TransportError::Io(inner).into(),
			HttpClientError::Other(message) =>
				transient(format!("HTTP client error during {grant}: {message}"), meta_status(meta), meta),
			_ => transient(format!("HTTP client error during {grant}"), meta_status(meta), meta),
		}
	}
}

/// Token endpoint client shared by every application.
pub struct OAuthTokenEndpoint<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	descriptor: ProviderDescriptor,
	strategy: Arc<dyn ProviderStrategy>,
	http_client: Arc<C>,
	error_mapper: Arc<M>,
}
impl<C, M> OAuthTokenEndpoint<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates an endpoint over a caller-provided transport and mapper.
	pub fn with_http_client(
		descriptor: ProviderDescriptor,
		http_client: impl Into<Arc<C>>,
		error_mapper: impl Into<Arc<M>>,
	) -> Self {
		Self {
			descriptor,
			strategy: Arc::new(DefaultProviderStrategy),
			http_client: http_client.into(),
			error_mapper: error_mapper.into(),
		}
	}

	/// Replaces the provider strategy.
	pub fn with_strategy(mut self, strategy: Arc<dyn ProviderStrategy>) -> Self {
		self.strategy = strategy;

		self
	}

	/// Descriptor the endpoint was built for.
	pub fn descriptor(&self) -> &ProviderDescriptor {
		&self.descriptor
	}

	fn client_for(&self, credentials: &ApplicationCredentials) -> Result<ConfiguredBasicClient> {
		let auth_url = AuthUrl::new(self.descriptor.endpoints.authorization.to_string())
			.map_err(|source| ConfigError::InvalidDescriptor { source })?;
		let token_url = TokenUrl::new(self.descriptor.endpoints.token.to_string())
			.map_err(|source| ConfigError::InvalidDescriptor { source })?;
		let redirect_url = RedirectUrl::new(self.descriptor.redirect_uri.to_string())
			.map_err(|source| ConfigError::InvalidRedirect { source })?;
		let mut client = BasicClient::new(ClientId::new(credentials.client_id.clone()))
			.set_client_secret(ClientSecret::new(credentials.client_secret.expose().to_owned()))
			.set_auth_uri(auth_url)
			.set_token_uri(token_url)
			.set_redirect_uri(redirect_url);

		if matches!(self.descriptor.client_auth_method, ClientAuthMethod::ClientSecretPost) {
			client = client.set_auth_type(AuthType::RequestBody);
		}

		Ok(client)
	}

	fn map_request_error(
		&self,
		grant: GrantType,
		meta: Option<ResponseMetadata>,
		err: BasicRequestTokenError<HttpClientError<C::TransportError>>,
	) -> Error {
		let meta = meta.as_ref();

		match err {
			RequestTokenError::ServerResponse(response) =>
				map_server_response(self.strategy.as_ref(), grant, response, meta),
			RequestTokenError::Request(error) =>
				self.error_mapper.map_transport_error(grant, meta, error),
			RequestTokenError::Parse(source, _body) =>
				TransientError::TokenResponseParse { source, status: meta_status(meta) }.into(),
			RequestTokenError::Other(message) => transient(message, meta_status(meta), meta),
		}
	}
}
#[cfg(feature = "reqwest")]
impl OAuthTokenEndpoint<ReqwestHttpClient, ReqwestTransportErrorMapper> {
	/// Creates an endpoint with its own reqwest transport.
	pub fn new(descriptor: ProviderDescriptor) -> Result<Self> {
		Ok(Self::with_http_client(
			descriptor,
			ReqwestHttpClient::new()?,
			ReqwestTransportErrorMapper,
		))
	}
}
impl<C, M> TokenEndpoint for OAuthTokenEndpoint<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn exchange_code<'a>(
		&'a self,
		credentials: &'a ApplicationCredentials,
		code: &'a str,
	) -> TokenEndpointFuture<'a> {
		const KIND: FlowKind = FlowKind::Authorization;

		let span = FlowSpan::new(KIND, "exchange_code");

		Box::pin(span.instrument(async move {
			obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

			let meta = ResponseMetadataSlot::default();
			let result = async {
				let client = self.client_for(credentials)?;
				let handle = self.http_client.with_metadata(meta.clone());
				let response = client
					.exchange_code(AuthorizationCode::new(code.to_owned()))
					.request_async(&handle)
					.await
					.map_err(|err| {
						self.map_request_error(GrantType::AuthorizationCode, meta.take(), err)
					})?;

				token_record_from(response)
			}
			.await;

			obs::record_result(KIND, &result);

			result
		}))
	}

	fn refresh<'a>(
		&'a self,
		credentials: &'a ApplicationCredentials,
		refresh_token: &'a TokenSecret,
	) -> TokenEndpointFuture<'a> {
		const KIND: FlowKind = FlowKind::Refresh;

		let span = FlowSpan::new(KIND, "refresh");

		Box::pin(span.instrument(async move {
			obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

			let meta = ResponseMetadataSlot::default();
			let result = async {
				let client = self.client_for(credentials)?;
				let handle = self.http_client.with_metadata(meta.clone());
				let secret = RefreshToken::new(refresh_token.expose().to_owned());
				let response = client
					.exchange_refresh_token(&secret)
					.request_async(&handle)
					.await
					.map_err(|err| self.map_request_error(GrantType::RefreshToken, meta.take(), err))?;

				token_record_from(response)
			}
			.await;

			obs::record_result(KIND, &result);

			result
		}))
	}
}
impl<C, M> Debug for OAuthTokenEndpoint<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("OAuthTokenEndpoint").field("descriptor", &self.descriptor).finish()
	}
}

/// Resolves the authorized account's email through the provider's userinfo endpoint.
#[cfg(feature = "reqwest")]
#[derive(Clone)]
pub struct UserInfoLookup {
	endpoint: Url,
	client: ReqwestHttpClient,
}
#[cfg(feature = "reqwest")]
impl UserInfoLookup {
	/// Creates a lookup against `endpoint`.
	pub fn new(endpoint: Url, client: ReqwestHttpClient) -> Self {
		Self { endpoint, client }
	}

	/// Creates a lookup from the descriptor's userinfo endpoint, if it declares one.
	pub fn from_descriptor(descriptor: &ProviderDescriptor, client: ReqwestHttpClient) -> Option<Self> {
		descriptor.endpoints.userinfo.clone().map(|endpoint| Self::new(endpoint, client))
	}
}
#[cfg(feature = "reqwest")]
impl AccountLookup for UserInfoLookup {
	fn account_email<'a>(&'a self, access_token: &'a TokenSecret) -> AccountFuture<'a> {
		#[derive(Deserialize)]
		struct UserInfo {
			email: Option<String>,
		}

		Box::pin(async move {
			let info: UserInfo = self.client.get_json(&self.endpoint, access_token.expose()).await?;

			Ok(info.email)
		})
	}
}
#[cfg(feature = "reqwest")]
impl Debug for UserInfoLookup {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("UserInfoLookup").field("endpoint", &self.endpoint.as_str()).finish()
	}
}

fn token_record_from(response: BasicTokenResponse) -> Result<TokenRecord> {
	let expires_in = response.expires_in().ok_or(ConfigError::MissingExpiresIn)?.as_secs();
	let expires_in = i64::try_from(expires_in).map_err(|_| ConfigError::ExpiresInOutOfRange)?;

	if expires_in <= 0 {
		return Err(ConfigError::NonPositiveExpiresIn.into());
	}

	let mut builder = TokenRecord::builder()
		.access_token(response.access_token().secret().to_owned())
		.issued_at(OffsetDateTime::now_utc())
		.expires_in(Duration::seconds(expires_in));

	if let Some(refresh) = response.refresh_token() {
		builder = builder.refresh_token(refresh.secret().to_owned());
	}

	builder.build().map_err(|e| ConfigError::from(e).into())
}

fn map_server_response(
	strategy: &dyn ProviderStrategy,
	grant: GrantType,
	response: BasicErrorResponse,
	meta: Option<&ResponseMetadata>,
) -> Error {
	let mut ctx =
		ProviderErrorContext::new(grant).with_oauth_error(response.error().as_ref().to_string());

	if let Some(description) = response.error_description() {
		ctx = ctx.with_error_description(description.clone());
	}
	if let Some(status) = meta_status(meta) {
		ctx = ctx.with_http_status(status);
	}

	let reason = match response.error_description() {
		Some(description) => format!("{} ({description})", response.error().as_ref()),
		None => response.error().as_ref().to_string(),
	};

	match strategy.classify_token_error(&ctx) {
		ProviderErrorKind::InvalidGrant => Error::InvalidGrant { reason },
		ProviderErrorKind::InvalidClient => Error::InvalidClient { reason },
		ProviderErrorKind::InsufficientScope => Error::InsufficientScope { reason },
		ProviderErrorKind::Transient => transient(reason, meta_status(meta), meta),
	}
}

fn transient(message: impl Into<String>, status: Option<u16>, meta: Option<&ResponseMetadata>) -> Error {
	TransientError::TokenEndpoint {
		message: message.into(),
		status,
		retry_after: meta.and_then(|value| value.retry_after),
	}
	.into()
}

fn meta_status(meta: Option<&ResponseMetadata>) -> Option<u16> {
	meta.and_then(|value| value.status)
}
