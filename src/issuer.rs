//! Identity token issuance through the IAM Credentials `generateIdToken` call.

// crates.io
use oauth2::http::Method;
// self
use crate::{
	_prelude::*,
	auth::{Audience, ServiceAccount, TokenSecret},
	error::{ConfigError, IssuanceError, body_preview},
	http::{self, HttpTransport},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
};

/// Production IAM Credentials endpoint.
pub const DEFAULT_IAM_CREDENTIALS_ENDPOINT: &str = "https://iamcredentials.googleapis.com/v1/";
/// Validity window applied to every issued identity token.
pub const ISSUED_TOKEN_LIFETIME: Duration = Duration::seconds(3600);

/// Exchanges an access token for an identity token scoped to an audience.
pub trait IdentityTokenIssuer
where
	Self: Send + Sync,
{
	/// Fails fast when the issuer lacks required configuration. Must not touch the network.
	fn ensure_configured(&self) -> Result<()> {
		Ok(())
	}

	/// Mints an identity token for `audience`, authorized by `access_token`.
	fn issue(&self, access_token: &TokenSecret, audience: &Audience) -> Result<TokenSecret>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateIdTokenRequest<'a> {
	audience: &'a str,
	include_email: &'static str,
}

#[derive(Deserialize)]
struct GenerateIdTokenResponse {
	token: String,
}

/// Mints identity tokens by impersonating a service account.
pub struct IamCredentialsIssuer {
	service_account: Option<ServiceAccount>,
	endpoint: Url,
	transport: Arc<dyn HttpTransport>,
}
impl IamCredentialsIssuer {
	/// Creates an issuer for `service_account`.
	///
	/// A missing service account is reported by [`IdentityTokenIssuer::ensure_configured`].
	pub fn new(
		service_account: Option<ServiceAccount>,
		transport: Arc<dyn HttpTransport>,
	) -> Result<Self> {
		let endpoint = Url::parse(DEFAULT_IAM_CREDENTIALS_ENDPOINT).map_err(|source| {
			ConfigError::invalid_endpoint(DEFAULT_IAM_CREDENTIALS_ENDPOINT, source)
		})?;

		Ok(Self { service_account, endpoint, transport })
	}

	/// Overrides the IAM Credentials base URL (must end with `/`).
	pub fn with_endpoint(mut self, endpoint: Url) -> Self {
		self.endpoint = endpoint;

		self
	}

	fn generate_url(&self, service_account: &ServiceAccount) -> Result<Url> {
		let path = format!("projects/-/serviceAccounts/{service_account}:generateIdToken");

		self.endpoint
			.join(&path)
			.map_err(|source| ConfigError::invalid_endpoint(&self.endpoint, source).into())
	}

	fn exchange(
		&self,
		url: &Url,
		access_token: &TokenSecret,
		audience: &Audience,
	) -> Result<TokenSecret, IssuanceError> {
		let body = serde_json::to_vec(&GenerateIdTokenRequest {
			audience: audience.as_ref(),
			include_email: "true",
		})
		.map_err(IssuanceError::Encode)?;
		let request = http::json_request(Method::POST, url, access_token, body)?;
		let response = self.transport.execute(request)?;

		if !response.status().is_success() {
			return Err(IssuanceError::Status {
				status: response.status().as_u16(),
				body: body_preview(response.body()),
			});
		}

		let deserializer = &mut serde_json::Deserializer::from_slice(response.body());
		let payload: GenerateIdTokenResponse =
			serde_path_to_error::deserialize(deserializer).map_err(IssuanceError::Parse)?;

		Ok(TokenSecret::new(payload.token))
	}
}
impl IdentityTokenIssuer for IamCredentialsIssuer {
	fn ensure_configured(&self) -> Result<()> {
		match self.service_account {
			Some(_) => Ok(()),
			None => Err(ConfigError::MissingServiceAccount.into()),
		}
	}

	fn issue(&self, access_token: &TokenSecret, audience: &Audience) -> Result<TokenSecret> {
		const KIND: FlowKind = FlowKind::Issue;

		let _span = FlowSpan::new(KIND, "generate_id_token").entered();
		let service_account =
			self.service_account.as_ref().ok_or(ConfigError::MissingServiceAccount)?;
		let url = self.generate_url(service_account)?;

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		match self.exchange(&url, access_token, audience) {
			Ok(token) => {
				obs::record_flow_outcome(KIND, FlowOutcome::Success);

				Ok(token)
			},
			Err(err) => {
				obs::record_flow_outcome(KIND, FlowOutcome::Failure);

				Err(err.into())
			},
		}
	}
}
impl Debug for IamCredentialsIssuer {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("IamCredentialsIssuer")
			.field("service_account", &self.service_account)
			.field("endpoint", &self.endpoint)
			.finish()
	}
}
