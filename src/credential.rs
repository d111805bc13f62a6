//! Ambient access credentials ("application default credentials").
//!
//! A [`CredentialSource`] hands out the caller's current access token and refreshes it on
//! demand. The token cache only reads through this seam; the source owns its own mutable
//! state.

pub mod authorized_user;
pub mod metadata;
pub mod service_account;

pub use authorized_user::AuthorizedUserCredentials;
pub use metadata::MetadataServerCredentials;
pub use service_account::ServiceAccountCredentials;

// std
use std::{env, path::PathBuf};
// self
use crate::{
	_prelude::*,
	auth::{AccessCredential, TokenSecret},
	error::{ConfigError, CredentialError},
	http::HttpTransport,
};

/// Environment variable naming an explicit credentials file.
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

const WELL_KNOWN_FILE: &str = "application_default_credentials.json";

/// Source of the bearer credential that authorizes refresh-path calls.
pub trait CredentialSource
where
	Self: Send + Sync,
{
	/// Returns the currently held credential, if any. Validity is judged by the caller.
	fn current(&self) -> Option<AccessCredential>;

	/// Fetches a new credential, replacing the held one.
	fn refresh(&self) -> Result<()>;
}

/// Returns an access token from `source`, refreshing it first when the held one is missing or
/// about to expire.
///
/// The token held after a successful refresh is returned as-is, even when its lifetime is
/// shorter than [`ACCESS_TOKEN_REFRESH_THRESHOLD`](crate::auth::ACCESS_TOKEN_REFRESH_THRESHOLD).
pub fn valid_access_token(source: &dyn CredentialSource) -> Result<TokenSecret> {
	if let Some(credential) = source.current().filter(AccessCredential::is_valid) {
		return Ok(credential.token);
	}

	source.refresh()?;

	source
		.current()
		.map(|credential| credential.token)
		.ok_or_else(|| CredentialError::Unavailable.into())
}

/// Fixed credential; never expires and refreshing is a no-op.
#[derive(Clone, Debug)]
pub struct StaticCredentials(AccessCredential);
impl StaticCredentials {
	/// Wraps a fixed access token.
	pub fn new(token: impl Into<String>) -> Self {
		Self(AccessCredential::new(token))
	}
}
impl CredentialSource for StaticCredentials {
	fn current(&self) -> Option<AccessCredential> {
		Some(self.0.clone())
	}

	fn refresh(&self) -> Result<()> {
		Ok(())
	}
}

/// Resolves application default credentials.
///
/// Lookup order: the file named by `GOOGLE_APPLICATION_CREDENTIALS`, the gcloud well-known
/// file, then the GCE metadata server. `authorized_user` and `service_account` files are
/// supported; other file types fail with [`ConfigError::UnsupportedCredentialType`]. Nothing
/// is fetched here; the first token request happens on the first refresh.
pub fn application_default(
	transport: Arc<dyn HttpTransport>,
) -> Result<Arc<dyn CredentialSource>> {
	if let Some(path) = env::var_os(CREDENTIALS_ENV).filter(|value| !value.is_empty()) {
		return from_file(PathBuf::from(path), transport);
	}
	if let Some(path) = well_known_file().filter(|path| path.is_file()) {
		return from_file(path, transport);
	}

	Ok(Arc::new(MetadataServerCredentials::from_env(transport)?))
}

fn from_file(path: PathBuf, transport: Arc<dyn HttpTransport>) -> Result<Arc<dyn CredentialSource>> {
	let raw = std::fs::read(&path).map_err(|source| CredentialError::Io {
		path: path.display().to_string(),
		source,
	})?;
	let kind = credential_type(&raw)?;

	match kind.as_str() {
		authorized_user::CREDENTIAL_TYPE =>
			Ok(Arc::new(AuthorizedUserCredentials::from_json(&raw, transport)?)),
		service_account::CREDENTIAL_TYPE =>
			Ok(Arc::new(ServiceAccountCredentials::from_json(&raw, transport)?)),
		_ => Err(ConfigError::UnsupportedCredentialType { kind }.into()),
	}
}

fn credential_type(raw: &[u8]) -> Result<String> {
	#[derive(Deserialize)]
	struct Header {
		#[serde(rename = "type")]
		kind: String,
	}

	let deserializer = &mut serde_json::Deserializer::from_slice(raw);
	let header: Header =
		serde_path_to_error::deserialize(deserializer).map_err(CredentialError::Parse)?;

	Ok(header.kind)
}

fn well_known_file() -> Option<PathBuf> {
	if cfg!(windows) {
		env::var_os("APPDATA").map(|dir| PathBuf::from(dir).join("gcloud").join(WELL_KNOWN_FILE))
	} else {
		env::var_os("HOME")
			.map(|dir| PathBuf::from(dir).join(".config").join("gcloud").join(WELL_KNOWN_FILE))
	}
}
