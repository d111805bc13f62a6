//! Ambient access credential handed out by a credential source.

// crates.io
use time::PrimitiveDateTime;
// self
use crate::{_prelude::*, auth::token::secret::TokenSecret};

/// Access tokens this close to expiry are treated as invalid and refreshed.
pub const ACCESS_TOKEN_REFRESH_THRESHOLD: Duration = Duration::seconds(225);

/// Bearer credential representing the calling identity.
#[derive(Clone, Debug)]
pub struct AccessCredential {
	/// Access token value.
	pub token: TokenSecret,
	/// Expiry reported by the issuer, when known.
	pub expires_at: Option<OffsetDateTime>,
}
impl AccessCredential {
	/// Wraps a token that carries no expiry information.
	pub fn new(token: impl Into<String>) -> Self {
		Self { token: TokenSecret::new(token), expires_at: None }
	}

	/// Wraps a token that expires `expires_in` after `now`.
	///
	/// Lifetimes past the representable range saturate at the latest (or, for negative values,
	/// the current) instant instead of overflowing.
	pub fn expiring(token: impl Into<String>, now: OffsetDateTime, expires_in: Duration) -> Self {
		let expires_at = now.checked_add(expires_in).unwrap_or(if expires_in.is_positive() {
			PrimitiveDateTime::MAX.assume_utc()
		} else {
			now
		});

		Self { token: TokenSecret::new(token), expires_at: Some(expires_at) }
	}

	/// Returns `true` unless the token expires within [`ACCESS_TOKEN_REFRESH_THRESHOLD`] of `now`.
	pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
		match self.expires_at {
			Some(expires_at) => expires_at
				.checked_sub(ACCESS_TOKEN_REFRESH_THRESHOLD)
				.is_some_and(|limit| now < limit),
			None => true,
		}
	}

	/// Convenience helper that checks validity against the current UTC instant.
	pub fn is_valid(&self) -> bool {
		self.is_valid_at(OffsetDateTime::now_utc())
	}
}
