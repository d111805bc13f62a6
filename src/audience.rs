//! Audience resolution: which proxy client identifier the identity token is minted for.

pub mod secret_manager;

pub use secret_manager::SecretManagerAudience;

// self
use crate::{_prelude::*, auth::Audience, error::ResolutionError};

/// Resolves the target audience. The token cache memoizes the first successful result.
pub trait AudienceResolver
where
	Self: Send + Sync,
{
	/// Looks the audience up. May perform blocking network I/O.
	fn resolve(&self) -> Result<Audience>;
}

/// Audience known up front.
#[derive(Clone, Debug)]
pub struct StaticAudience(Audience);
impl StaticAudience {
	/// Wraps a fixed audience.
	pub fn new(audience: Audience) -> Self {
		Self(audience)
	}
}
impl AudienceResolver for StaticAudience {
	fn resolve(&self) -> Result<Audience> {
		Ok(self.0.clone())
	}
}

/// Extracts the OAuth client identifier from a secret payload.
///
/// Preference order: a JSON object's `client_id`, then `web.client_id`, then
/// `installed.client_id`; anything else is used verbatim after trimming surrounding whitespace,
/// inner spaces included.
pub fn parse_client_id(payload: &str) -> Result<Audience, ResolutionError> {
	let payload = payload.trim();
	let Ok(serde_json::Value::Object(object)) = serde_json::from_str::<serde_json::Value>(payload)
	else {
		return Ok(Audience::new(payload)?);
	};

	if let Some(value) = object.get("client_id") {
		return client_id_string(value, "client_id");
	}

	for section in ["web", "installed"] {
		if let Some(nested) = object.get(section) {
			let value = nested.get("client_id").ok_or_else(|| ResolutionError::MalformedPayload {
				reason: format!("`{section}` has no `client_id` field"),
			})?;

			return client_id_string(value, section);
		}
	}

	Ok(Audience::new(payload)?)
}

fn client_id_string(value: &serde_json::Value, field: &str) -> Result<Audience, ResolutionError> {
	let raw = value.as_str().ok_or_else(|| ResolutionError::MalformedPayload {
		reason: format!("`{field}` client identifier is not a string"),
	})?;

	Ok(Audience::new(raw)?)
}
