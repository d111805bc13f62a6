//! `service_account` key files exchanged for access tokens through a signed JWT-bearer grant.

// crates.io
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use oauth2::http::{
	Method, Request, StatusCode,
	header::{ACCEPT, CONTENT_TYPE},
};
// self
use crate::{
	_prelude::*,
	auth::{AccessCredential, ServiceAccount},
	credential::{CredentialSource, authorized_user::DEFAULT_TOKEN_URI},
	error::{ConfigError, CredentialError, TransportError, body_preview},
	http::HttpTransport,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
};

/// Value of the `type` field in a `service_account` key file.
pub const CREDENTIAL_TYPE: &str = "service_account";
/// Scope requested for the ambient access token.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME: Duration = Duration::hours(1);

#[derive(Deserialize)]
struct ServiceAccountFile {
	client_email: String,
	private_key: String,
	#[serde(default)]
	private_key_id: Option<String>,
	#[serde(default)]
	token_uri: Option<String>,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
	iss: &'a str,
	scope: &'a str,
	aud: &'a str,
	iat: i64,
	exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
	access_token: String,
	#[serde(default)]
	expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
	error: String,
	#[serde(default)]
	error_description: Option<String>,
}

/// Service account key credentials.
///
/// Each refresh signs a short-lived RS256 assertion with the account's private key and trades
/// it at the token endpoint for a `cloud-platform` access token.
pub struct ServiceAccountCredentials {
	client_email: ServiceAccount,
	key: EncodingKey,
	key_id: Option<String>,
	token_url: Url,
	transport: Arc<dyn HttpTransport>,
	held: RwLock<Option<AccessCredential>>,
}
impl ServiceAccountCredentials {
	/// Builds credentials from the key's parts. `private_key_pem` is parsed immediately.
	pub fn new(
		client_email: &str,
		private_key_pem: &str,
		key_id: Option<String>,
		token_uri: &str,
		transport: Arc<dyn HttpTransport>,
	) -> Result<Self> {
		let client_email = ServiceAccount::new(client_email).map_err(ConfigError::from)?;
		let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
			.map_err(|source| ConfigError::InvalidPrivateKey { source })?;
		let token_url = Url::parse(token_uri)
			.map_err(|source| ConfigError::invalid_endpoint(token_uri, source))?;

		Ok(Self { client_email, key, key_id, token_url, transport, held: RwLock::new(None) })
	}

	/// Parses a `service_account` key file.
	pub fn from_json(raw: &[u8], transport: Arc<dyn HttpTransport>) -> Result<Self> {
		let deserializer = &mut serde_json::Deserializer::from_slice(raw);
		let file: ServiceAccountFile =
			serde_path_to_error::deserialize(deserializer).map_err(CredentialError::Parse)?;
		let token_uri = file.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);

		Self::new(&file.client_email, &file.private_key, file.private_key_id, token_uri, transport)
	}

	/// Service account the key belongs to.
	pub fn client_email(&self) -> &ServiceAccount {
		&self.client_email
	}

	fn assertion(&self, now: OffsetDateTime) -> Result<String, CredentialError> {
		let mut header = Header::new(Algorithm::RS256);

		header.kid = self.key_id.clone();

		let claims = AssertionClaims {
			iss: self.client_email.as_ref(),
			scope: CLOUD_PLATFORM_SCOPE,
			aud: self.token_url.as_str(),
			iat: now.unix_timestamp(),
			exp: (now + ASSERTION_LIFETIME).unix_timestamp(),
		};

		jsonwebtoken::encode(&header, &claims, &self.key).map_err(CredentialError::Signing)
	}

	fn fetch(&self) -> Result<AccessCredential, CredentialError> {
		let now = OffsetDateTime::now_utc();
		let assertion = self.assertion(now)?;
		let body = url::form_urlencoded::Serializer::new(String::new())
			.append_pair("grant_type", JWT_BEARER_GRANT)
			.append_pair("assertion", &assertion)
			.finish();
		let request = Request::builder()
			.method(Method::POST)
			.uri(self.token_url.as_str())
			.header(ACCEPT, "application/json")
			.header(CONTENT_TYPE, "application/x-www-form-urlencoded")
			.body(body.into_bytes())
			.map_err(TransportError::from)?;
		let response = self.transport.execute(request)?;

		if response.status() != StatusCode::OK {
			return Err(
				match serde_json::from_slice::<TokenErrorResponse>(response.body()) {
					Ok(TokenErrorResponse { error, error_description: Some(description) }) =>
						CredentialError::OAuth { message: format!("{error}: {description}") },
					Ok(TokenErrorResponse { error, error_description: None }) =>
						CredentialError::OAuth { message: error },
					Err(_) => CredentialError::Status {
						status: response.status().as_u16(),
						body: body_preview(response.body()),
					},
				},
			);
		}

		let deserializer = &mut serde_json::Deserializer::from_slice(response.body());
		let token: TokenResponse =
			serde_path_to_error::deserialize(deserializer).map_err(CredentialError::Parse)?;

		Ok(match token.expires_in {
			Some(secs) => AccessCredential::expiring(
				token.access_token,
				OffsetDateTime::now_utc(),
				Duration::seconds(secs),
			),
			None => AccessCredential::new(token.access_token),
		})
	}
}
impl CredentialSource for ServiceAccountCredentials {
	fn current(&self) -> Option<AccessCredential> {
		self.held.read().clone()
	}

	fn refresh(&self) -> Result<()> {
		const KIND: FlowKind = FlowKind::Credential;

		let _span = FlowSpan::new(KIND, "service_account").entered();

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		match self.fetch() {
			Ok(credential) => {
				*self.held.write() = Some(credential);

				obs::record_flow_outcome(KIND, FlowOutcome::Success);

				Ok(())
			},
			Err(err) => {
				obs::record_flow_outcome(KIND, FlowOutcome::Failure);

				Err(err.into())
			},
		}
	}
}
impl Debug for ServiceAccountCredentials {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ServiceAccountCredentials")
			.field("client_email", &self.client_email)
			.field("key_id", &self.key_id)
			.field("private_key", &"<redacted>")
			.field("token_url", &self.token_url)
			.finish()
	}
}
