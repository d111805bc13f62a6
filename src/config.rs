//! Settings that switch IAP authentication on and point it at its collaborators.

// self
use crate::{_prelude::*, error::ConfigError};

/// Default environment variable prefix.
pub const DEFAULT_ENV_PREFIX: &str = "PREFECT_API_IAP_";
/// Header that carries the bearer credential unless configured otherwise.
pub const DEFAULT_AUTH_HEADER_NAME: &str = "Authorization";

/// IAP authentication settings.
///
/// Missing secret path or service account values are accepted here; the token cache reports
/// them on the first lookup that needs them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IapSettings {
	/// Whether requests are authenticated with IAP identity tokens.
	pub enabled: bool,
	/// Secret version holding the proxy client identifier
	/// (`projects/PROJECT/secrets/SECRET/versions/VERSION`).
	pub client_id_gcp_secret_version: Option<String>,
	/// Service account impersonated when minting identity tokens.
	pub impersonate_service_account: Option<String>,
	/// Header the bearer credential is written to.
	pub auth_header_name: String,
}
impl IapSettings {
	/// Loads settings from `PREFECT_API_IAP_*` environment variables.
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_env_with_prefix(DEFAULT_ENV_PREFIX)
	}

	/// Loads settings from environment variables named `{prefix}{FIELD}`.
	pub fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
		Self::from_lookup(prefix, |name| std::env::var(name).ok())
	}

	/// Loads settings through `lookup`, which maps a variable name to its value.
	///
	/// Empty values count as unset.
	pub fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let read = |field: &str| {
			lookup(&format!("{prefix}{field}"))
				.map(|value| value.trim().to_owned())
				.filter(|value| !value.is_empty())
		};
		let mut settings = Self::default();

		if let Some(raw) = read("ENABLED") {
			settings.enabled = parse_bool(&format!("{prefix}ENABLED"), &raw)?;
		}

		settings.client_id_gcp_secret_version = read("CLIENT_ID_GCP_SECRET_VERSION");
		settings.impersonate_service_account = read("IMPERSONATE_SERVICE_ACCOUNT");

		if let Some(name) = read("AUTH_HEADER_NAME") {
			settings.auth_header_name = name;
		}

		Ok(settings)
	}
}
impl Default for IapSettings {
	fn default() -> Self {
		Self {
			enabled: false,
			client_id_gcp_secret_version: None,
			impersonate_service_account: None,
			auth_header_name: DEFAULT_AUTH_HEADER_NAME.into(),
		}
	}
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ConfigError> {
	match raw.to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(ConfigError::InvalidSetting {
			name: name.to_owned(),
			reason: format!("`{raw}` is not a boolean"),
		}),
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::collections::HashMap;
	// self
	use super::*;

	fn load(vars: &[(&str, &str)]) -> Result<IapSettings, ConfigError> {
		let vars = vars
			.iter()
			.map(|(name, value)| (name.to_string(), value.to_string()))
			.collect::<HashMap<_, _>>();

		IapSettings::from_lookup(DEFAULT_ENV_PREFIX, |name| vars.get(name).cloned())
	}

	#[test]
	fn defaults_leave_iap_disabled() {
		let settings = load(&[]).expect("Empty environment should load.");

		assert_eq!(settings, IapSettings::default());
		assert!(!settings.enabled);
		assert_eq!(settings.auth_header_name, "Authorization");
	}

	#[test]
	fn reads_every_field() {
		let settings = load(&[
			("PREFECT_API_IAP_ENABLED", "True"),
			("PREFECT_API_IAP_CLIENT_ID_GCP_SECRET_VERSION", "projects/p/secrets/s/versions/1"),
			("PREFECT_API_IAP_IMPERSONATE_SERVICE_ACCOUNT", "invoker@p.iam.gserviceaccount.com"),
			("PREFECT_API_IAP_AUTH_HEADER_NAME", "Proxy-Authorization"),
		])
		.expect("Environment should load.");

		assert!(settings.enabled);
		assert_eq!(
			settings.client_id_gcp_secret_version.as_deref(),
			Some("projects/p/secrets/s/versions/1")
		);
		assert_eq!(
			settings.impersonate_service_account.as_deref(),
			Some("invoker@p.iam.gserviceaccount.com")
		);
		assert_eq!(settings.auth_header_name, "Proxy-Authorization");
	}

	#[test]
	fn empty_values_are_unset() {
		let settings = load(&[
			("PREFECT_API_IAP_ENABLED", ""),
			("PREFECT_API_IAP_IMPERSONATE_SERVICE_ACCOUNT", "   "),
			("PREFECT_API_IAP_AUTH_HEADER_NAME", ""),
		])
		.expect("Empty values should load.");

		assert_eq!(settings, IapSettings::default());
	}

	#[test]
	fn booleans_accept_common_spellings() {
		for (raw, expected) in
			[("1", true), ("yes", true), ("ON", true), ("0", false), ("no", false), ("off", false)]
		{
			let settings =
				load(&[("PREFECT_API_IAP_ENABLED", raw)]).expect("Boolean spelling should load.");

			assert_eq!(settings.enabled, expected, "{raw}");
		}

		let err = load(&[("PREFECT_API_IAP_ENABLED", "maybe")]).expect_err("Garbage must fail.");

		assert!(matches!(err, ConfigError::InvalidSetting { ref name, .. } if name == "PREFECT_API_IAP_ENABLED"));
	}

	#[test]
	fn custom_prefix_is_honored() {
		let settings = IapSettings::from_lookup("MY_IAP_", |name| {
			(name == "MY_IAP_ENABLED").then(|| "true".to_owned())
		})
		.expect("Custom prefix should load.");

		assert!(settings.enabled);
	}

	#[test]
	fn deserializes_with_defaults() {
		let settings: IapSettings =
			serde_json::from_str(r#"{"enabled":true}"#).expect("Partial settings should parse.");

		assert!(settings.enabled);
		assert_eq!(settings.auth_header_name, "Authorization");
		assert!(settings.client_id_gcp_secret_version.is_none());
	}
}
