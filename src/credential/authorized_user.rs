//! `authorized_user` credentials (gcloud user login) refreshed through an OAuth 2.0
//! `refresh_token` grant.

// crates.io
use oauth2::{
	AuthType, ClientId, ClientSecret, EndpointNotSet, EndpointSet, HttpClientError, RefreshToken,
	RequestTokenError, TokenResponse, TokenUrl,
	basic::{BasicClient, BasicRequestTokenError},
};
// self
use crate::{
	_prelude::*,
	auth::AccessCredential,
	credential::CredentialSource,
	error::{ConfigError, CredentialError, TransportError},
	http::{HttpTransport, OAuthHttpClient},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
};

/// Value of the `type` field in an `authorized_user` credentials file.
pub const CREDENTIAL_TYPE: &str = "authorized_user";
/// Google's OAuth 2.0 token endpoint.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

type ConfiguredBasicClient =
	BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

#[derive(Deserialize)]
struct AuthorizedUserFile {
	client_id: String,
	client_secret: String,
	refresh_token: String,
	#[serde(default)]
	token_uri: Option<String>,
}

/// User credentials that mint access tokens from a long-lived refresh token.
pub struct AuthorizedUserCredentials {
	oauth_client: ConfiguredBasicClient,
	refresh_token: RefreshToken,
	transport: Arc<dyn HttpTransport>,
	held: RwLock<Option<AccessCredential>>,
}
impl AuthorizedUserCredentials {
	/// Creates credentials for the given OAuth client and refresh token.
	pub fn new(
		client_id: impl Into<String>,
		client_secret: impl Into<String>,
		refresh_token: impl Into<String>,
		token_uri: &str,
		transport: Arc<dyn HttpTransport>,
	) -> Result<Self> {
		let token_url = TokenUrl::new(token_uri.to_owned())
			.map_err(|source| ConfigError::invalid_endpoint(token_uri, source))?;
		let oauth_client = BasicClient::new(ClientId::new(client_id.into()))
			.set_client_secret(ClientSecret::new(client_secret.into()))
			.set_auth_type(AuthType::RequestBody)
			.set_token_uri(token_url);

		Ok(Self {
			oauth_client,
			refresh_token: RefreshToken::new(refresh_token.into()),
			transport,
			held: RwLock::new(None),
		})
	}

	/// Parses the contents of an `authorized_user` credentials file.
	pub fn from_json(raw: &[u8], transport: Arc<dyn HttpTransport>) -> Result<Self> {
		let deserializer = &mut serde_json::Deserializer::from_slice(raw);
		let file: AuthorizedUserFile =
			serde_path_to_error::deserialize(deserializer).map_err(CredentialError::Parse)?;
		let token_uri = file.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);

		Self::new(file.client_id, file.client_secret, file.refresh_token, token_uri, transport)
	}
}
impl CredentialSource for AuthorizedUserCredentials {
	fn current(&self) -> Option<AccessCredential> {
		self.held.read().clone()
	}

	fn refresh(&self) -> Result<()> {
		const KIND: FlowKind = FlowKind::Credential;

		let _span = FlowSpan::new(KIND, "authorized_user").entered();

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let http_client = OAuthHttpClient(self.transport.as_ref());
		let response = self
			.oauth_client
			.exchange_refresh_token(&self.refresh_token)
			.request(&http_client)
			.map_err(map_request_error)
			.inspect_err(|_| obs::record_flow_outcome(KIND, FlowOutcome::Failure))?;
		let now = OffsetDateTime::now_utc();
		let credential = match response.expires_in() {
			Some(expires_in) => AccessCredential::expiring(
				response.access_token().secret().to_owned(),
				now,
				Duration::try_from(expires_in).unwrap_or(Duration::MAX),
			),
			None => AccessCredential::new(response.access_token().secret().to_owned()),
		};

		*self.held.write() = Some(credential);

		obs::record_flow_outcome(KIND, FlowOutcome::Success);

		Ok(())
	}
}
impl Debug for AuthorizedUserCredentials {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AuthorizedUserCredentials")
			.field("client_id", self.oauth_client.client_id())
			.field("refresh_token", &"<redacted>")
			.finish()
	}
}

fn map_request_error(err: BasicRequestTokenError<HttpClientError<TransportError>>) -> Error {
	match err {
		RequestTokenError::ServerResponse(response) => {
			let message = match response.error_description() {
				Some(description) => format!("{}: {description}", response.error().as_ref()),
				None => response.error().as_ref().to_owned(),
			};

			CredentialError::OAuth { message }.into()
		},
		RequestTokenError::Request(HttpClientError::Reqwest(inner)) =>
			CredentialError::Transport(*inner).into(),
		RequestTokenError::Request(HttpClientError::Http(inner)) =>
			CredentialError::Transport(TransportError::Http(inner)).into(),
		RequestTokenError::Request(HttpClientError::Io(inner)) =>
			CredentialError::Transport(TransportError::Io(inner)).into(),
		RequestTokenError::Request(other) =>
			CredentialError::OAuth { message: other.to_string() }.into(),
		RequestTokenError::Parse(source, _body) => CredentialError::Parse(source).into(),
		RequestTokenError::Other(message) => CredentialError::OAuth { message }.into(),
	}
}
