//! Compute Engine metadata server credentials.

// crates.io
use oauth2::http::{Method, Request, StatusCode};
// self
use crate::{
	_prelude::*,
	auth::AccessCredential,
	credential::CredentialSource,
	error::{ConfigError, CredentialError, TransportError, body_preview},
	http::HttpTransport,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
};

/// Environment variable overriding the metadata server host.
pub const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";
/// Default metadata server host.
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

const TOKEN_PATH: &str = "computeMetadata/v1/instance/service-accounts/default/token";

#[derive(Deserialize)]
struct MetadataToken {
	access_token: String,
	#[serde(default)]
	expires_in: Option<i64>,
}

/// Access tokens for the workload's attached service account, served by the metadata server.
pub struct MetadataServerCredentials {
	token_url: Url,
	transport: Arc<dyn HttpTransport>,
	held: RwLock<Option<AccessCredential>>,
}
impl MetadataServerCredentials {
	/// Targets the metadata server at `base` (e.g. `http://metadata.google.internal/`).
	pub fn new(base: &Url, transport: Arc<dyn HttpTransport>) -> Result<Self> {
		let token_url =
			base.join(TOKEN_PATH).map_err(|source| ConfigError::invalid_endpoint(base, source))?;

		Ok(Self { token_url, transport, held: RwLock::new(None) })
	}

	/// Targets the host named by `GCE_METADATA_HOST`, falling back to the default host.
	pub fn from_env(transport: Arc<dyn HttpTransport>) -> Result<Self> {
		let host = std::env::var(METADATA_HOST_ENV)
			.ok()
			.filter(|value| !value.is_empty())
			.unwrap_or_else(|| DEFAULT_METADATA_HOST.to_owned());
		let raw = format!("http://{host}/");
		let base = Url::parse(&raw).map_err(|source| ConfigError::invalid_endpoint(&raw, source))?;

		Self::new(&base, transport)
	}

	fn fetch(&self) -> Result<AccessCredential, CredentialError> {
		let request = Request::builder()
			.method(Method::GET)
			.uri(self.token_url.as_str())
			.header("Metadata-Flavor", "Google")
			.body(Vec::new())
			.map_err(TransportError::from)?;
		let response = self.transport.execute(request)?;

		if response.status() != StatusCode::OK {
			return Err(CredentialError::Status {
				status: response.status().as_u16(),
				body: body_preview(response.body()),
			});
		}

		let deserializer = &mut serde_json::Deserializer::from_slice(response.body());
		let token: MetadataToken =
			serde_path_to_error::deserialize(deserializer).map_err(CredentialError::Parse)?;
		let now = OffsetDateTime::now_utc();

		Ok(match token.expires_in {
			Some(secs) => AccessCredential::expiring(token.access_token, now, Duration::seconds(secs)),
			None => AccessCredential::new(token.access_token),
		})
	}
}
impl CredentialSource for MetadataServerCredentials {
	fn current(&self) -> Option<AccessCredential> {
		self.held.read().clone()
	}

	fn refresh(&self) -> Result<()> {
		const KIND: FlowKind = FlowKind::Credential;

		let _span = FlowSpan::new(KIND, "metadata_server").entered();

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
impl Debug for MetadataServerCredentials {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("MetadataServerCredentials").field("token_url", &self.token_url).finish()
	}
}
