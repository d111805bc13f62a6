//! Audience lookup through the Secret Manager `versions.access` REST call.

// crates.io
use base64::{Engine, engine::general_purpose::STANDARD};
use oauth2::http::Method;
// self
use crate::{
	_prelude::*,
	audience::{AudienceResolver, parse_client_id},
	auth::Audience,
	credential::{self, CredentialSource},
	error::{ConfigError, ResolutionError, body_preview},
	http::{self, HttpTransport},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
};

/// Production Secret Manager endpoint.
pub const DEFAULT_SECRET_MANAGER_ENDPOINT: &str = "https://secretmanager.googleapis.com/v1/";

#[derive(Deserialize)]
struct AccessSecretVersionResponse {
	payload: SecretPayload,
}

#[derive(Deserialize)]
struct SecretPayload {
	data: String,
}

/// Reads the proxy client identifier from a secret version.
pub struct SecretManagerAudience {
	secret_version: Option<String>,
	endpoint: Url,
	credentials: Arc<dyn CredentialSource>,
	transport: Arc<dyn HttpTransport>,
}
impl SecretManagerAudience {
	/// Creates a resolver for `secret_version`
	/// (`projects/PROJECT/secrets/SECRET/versions/VERSION`).
	///
	/// A missing path is reported by [`AudienceResolver::resolve`], not here.
	pub fn new(
		secret_version: Option<String>,
		credentials: Arc<dyn CredentialSource>,
		transport: Arc<dyn HttpTransport>,
	) -> Result<Self> {
		let endpoint = Url::parse(DEFAULT_SECRET_MANAGER_ENDPOINT).map_err(|source| {
			ConfigError::invalid_endpoint(DEFAULT_SECRET_MANAGER_ENDPOINT, source)
		})?;

		Ok(Self {
			secret_version: secret_version.filter(|path| !path.trim().is_empty()),
			endpoint,
			credentials,
			transport,
		})
	}

	/// Overrides the Secret Manager base URL (must end with `/`).
	pub fn with_endpoint(mut self, endpoint: Url) -> Self {
		self.endpoint = endpoint;

		self
	}

	fn access_url(&self, secret_version: &str) -> Result<Url> {
		let path = format!("{}:access", secret_version.trim().trim_start_matches('/'));

		self.endpoint
			.join(&path)
			.map_err(|source| ConfigError::invalid_endpoint(&self.endpoint, source).into())
	}
}
impl AudienceResolver for SecretManagerAudience {
	fn resolve(&self) -> Result<Audience> {
		const KIND: FlowKind = FlowKind::Resolve;

		let _span = FlowSpan::new(KIND, "secret_manager").entered();
		let secret_version =
			self.secret_version.as_deref().ok_or(ConfigError::MissingSecretVersion)?;
		let url = self.access_url(secret_version)?;

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = credential::valid_access_token(self.credentials.as_ref()).and_then(|token| {
			let request = http::json_request(Method::GET, &url, &token, Vec::new())
				.map_err(ResolutionError::from)?;
			let response = self.transport.execute(request).map_err(ResolutionError::from)?;

			if !response.status().is_success() {
				return Err(ResolutionError::Status {
					status: response.status().as_u16(),
					body: body_preview(response.body()),
				}
				.into());
			}

			let deserializer = &mut serde_json::Deserializer::from_slice(response.body());
			let envelope: AccessSecretVersionResponse =
				serde_path_to_error::deserialize(deserializer).map_err(ResolutionError::Parse)?;
			let decoded = STANDARD.decode(envelope.payload.data.trim()).map_err(ResolutionError::from)?;
			let text = String::from_utf8(decoded).map_err(ResolutionError::from)?;

			Ok(parse_client_id(&text)?)
		});

		match &result {
			Ok(_) => obs::record_flow_outcome(KIND, FlowOutcome::Success),
			Err(_) => obs::record_flow_outcome(KIND, FlowOutcome::Failure),
		}

		result
	}
}
impl Debug for SecretManagerAudience {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("SecretManagerAudience")
			.field("secret_version", &self.secret_version)
			.field("endpoint", &self.endpoint)
			.finish()
	}
}
