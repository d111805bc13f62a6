//! Error taxonomy shared by the token cache, its collaborators, and the request flow.

// self
use crate::_prelude::*;

/// Crate-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const BODY_PREVIEW_LIMIT: usize = 256;

/// Canonical error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// A required setting is missing or invalid.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// The audience (proxy client identifier) could not be resolved.
	#[error(transparent)]
	Resolution(#[from] ResolutionError),
	/// The identity token exchange failed.
	#[error(transparent)]
	Issuance(#[from] IssuanceError),
	/// Ambient credential acquisition or refresh failed.
	#[error(transparent)]
	Credential(#[from] CredentialError),
	/// The authenticated request could not be delivered to the protected service.
	#[error("Failed to send the authenticated request.")]
	Transport(#[source] TransportError),
	/// The background worker running a token refresh did not complete.
	#[error("Token refresh worker did not complete.")]
	Worker {
		/// Join failure reported by the runtime.
		#[source]
		source: tokio::task::JoinError,
	},
}

/// Configuration problems. Raised before any network call is made.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// No secret version path was configured for audience resolution.
	#[error(
		"The client ID secret version must be set to the full secret version path (e.g. `projects/PROJECT/secrets/SECRET/versions/VERSION`)."
	)]
	MissingSecretVersion,
	/// No service account was configured for impersonation.
	#[error(
		"The impersonated service account must be set to the email address of the service account to impersonate."
	)]
	MissingServiceAccount,
	/// A setting could not be parsed.
	#[error("Setting `{name}` has an invalid value: {reason}.")]
	InvalidSetting {
		/// Setting name (environment variable or field).
		name: String,
		/// Why the value was rejected.
		reason: String,
	},
	/// An identifier failed validation.
	#[error(transparent)]
	InvalidIdentifier(#[from] crate::auth::IdentifierError),
	/// The configured auth header name is not a valid HTTP header name.
	#[error("Header name `{name}` is not a valid HTTP header name.")]
	InvalidHeaderName {
		/// Rejected header name.
		name: String,
	},
	/// A configured endpoint could not be parsed or joined.
	#[error("Endpoint `{endpoint}` is not a valid URL.")]
	InvalidEndpoint {
		/// Offending endpoint value.
		endpoint: String,
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// The credentials file names a type this crate cannot refresh.
	#[error("Credential type `{kind}` is not supported; use an `authorized_user` or `service_account` file, or the metadata server.")]
	UnsupportedCredentialType {
		/// Value of the file's `type` field.
		kind: String,
	},
	/// A service account private key is not a usable RSA PEM key.
	#[error("Service account private key could not be parsed.")]
	InvalidPrivateKey {
		/// Underlying key parsing failure.
		#[source]
		source: jsonwebtoken::errors::Error,
	},
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying builder failure.
		#[source]
		source: BoxError,
	},
	/// The async path was used outside of a Tokio runtime.
	#[error("Async token retrieval requires a Tokio runtime.")]
	MissingRuntime,
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}

	pub(crate) fn invalid_endpoint(endpoint: impl Display, source: url::ParseError) -> Self {
		Self::InvalidEndpoint { endpoint: endpoint.to_string(), source }
	}
}
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}

/// Failures while resolving the audience from the secret store.
#[derive(Debug, ThisError)]
pub enum ResolutionError {
	/// The secret store could not be reached.
	#[error("Secret store request failed.")]
	Transport(#[from] TransportError),
	/// The secret store answered with a non-success status.
	#[error("Secret store returned HTTP {status}: {body}.")]
	Status {
		/// HTTP status code.
		status: u16,
		/// Truncated response body.
		body: String,
	},
	/// The secret store response was not the expected JSON document.
	#[error("Secret store returned malformed JSON.")]
	Parse(#[source] serde_path_to_error::Error<serde_json::Error>),
	/// The secret payload was not valid base64.
	#[error("Secret payload is not valid base64.")]
	Decode(#[from] base64::DecodeError),
	/// The decoded secret payload was not UTF-8.
	#[error("Secret payload is not valid UTF-8.")]
	Utf8(#[from] std::string::FromUtf8Error),
	/// The payload parsed as JSON but did not carry a usable client identifier.
	#[error("Secret payload is malformed: {reason}.")]
	MalformedPayload {
		/// What was missing.
		reason: String,
	},
	/// The resolved value is not a valid audience.
	#[error(transparent)]
	InvalidAudience(#[from] crate::auth::IdentifierError),
}

/// Failures while exchanging an access token for an identity token.
#[derive(Debug, ThisError)]
pub enum IssuanceError {
	/// The token exchange endpoint could not be reached.
	#[error("Identity token request failed.")]
	Transport(#[from] TransportError),
	/// The token exchange endpoint answered with a non-success status.
	#[error("Identity token endpoint returned HTTP {status}: {body}.")]
	Status {
		/// HTTP status code.
		status: u16,
		/// Truncated response body.
		body: String,
	},
	/// The token exchange response could not be parsed.
	#[error("Identity token endpoint returned malformed JSON.")]
	Parse(#[source] serde_path_to_error::Error<serde_json::Error>),
	/// The request body could not be encoded.
	#[error("Identity token request could not be encoded.")]
	Encode(#[source] serde_json::Error),
	/// The issued token cannot be placed in an HTTP header.
	#[error("Issued token is not a valid HTTP header value.")]
	InvalidToken,
}

/// Failures while acquiring or refreshing the ambient access credential.
#[derive(Debug, ThisError)]
pub enum CredentialError {
	/// The credential endpoint could not be reached.
	#[error("Credential endpoint request failed.")]
	Transport(#[from] TransportError),
	/// The credential endpoint answered with a non-success status.
	#[error("Credential endpoint returned HTTP {status}: {body}.")]
	Status {
		/// HTTP status code.
		status: u16,
		/// Truncated response body.
		body: String,
	},
	/// The credential endpoint or credentials file returned malformed JSON.
	#[error("Credential payload is malformed JSON.")]
	Parse(#[source] serde_path_to_error::Error<serde_json::Error>),
	/// The OAuth token endpoint rejected the refresh.
	#[error("OAuth token endpoint rejected the refresh: {message}.")]
	OAuth {
		/// Provider-supplied reason.
		message: String,
	},
	/// The credentials file could not be read.
	#[error("Credentials file `{path}` could not be read.")]
	Io {
		/// Path that failed.
		path: String,
		/// Underlying IO failure.
		#[source]
		source: std::io::Error,
	},
	/// The JWT-bearer assertion could not be signed.
	#[error("Service account assertion could not be signed.")]
	Signing(#[source] jsonwebtoken::errors::Error),
	/// A refresh completed without producing a usable token.
	#[error("Credential source produced no valid access token after refresh.")]
	Unavailable,
}

/// Transport-level failures (network, IO, request construction).
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while sending the request.")]
	Network {
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// The request could not be built.
	#[error(transparent)]
	Http(#[from] oauth2::http::Error),
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred while sending the request.")]
	Io(#[from] std::io::Error),
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Box::new(src) }
	}
}
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		Self::network(e)
	}
}

/// Renders at most [`BODY_PREVIEW_LIMIT`] characters of a response body for error messages.
pub(crate) fn body_preview(body: &[u8]) -> String {
	let text = String::from_utf8_lossy(body);
	let trimmed = text.trim();

	match trimmed.char_indices().nth(BODY_PREVIEW_LIMIT) {
		Some((idx, _)) => format!("{}...", &trimmed[..idx]),
		None => trimmed.to_owned(),
	}
}
