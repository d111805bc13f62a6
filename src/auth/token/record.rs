//! The cached identity token and its freshness rules.

// self
use crate::{
	_prelude::*,
	auth::{Audience, token::secret::TokenSecret},
};

/// Identity token held by the cache together with the audience it was minted for.
///
/// `expires_at` is the only record of the token's validity; reuse decisions never consult
/// anything else.
#[derive(Clone)]
pub struct CachedToken {
	/// Identity token value.
	pub value: TokenSecret,
	/// Audience the token was issued for.
	pub issued_for: Audience,
	/// Instant the cache stored the token.
	pub issued_at: OffsetDateTime,
	/// Absolute expiry instant.
	pub expires_at: OffsetDateTime,
}
impl CachedToken {
	/// Creates a record issued at `issued_at` and valid for `lifetime`.
	pub fn new(
		value: TokenSecret,
		issued_for: Audience,
		issued_at: OffsetDateTime,
		lifetime: Duration,
	) -> Self {
		Self { value, issued_for, issued_at, expires_at: issued_at + lifetime }
	}

	/// Returns `true` while `now` is earlier than `expires_at - buffer`.
	pub fn is_fresh_at(&self, now: OffsetDateTime, buffer: Duration) -> bool {
		now < self.expires_at - buffer
	}

	/// Returns `true` if the token may be reused for `audience` at `now`.
	pub fn is_reusable_for(
		&self,
		audience: &Audience,
		now: OffsetDateTime,
		buffer: Duration,
	) -> bool {
		self.issued_for == *audience && self.is_fresh_at(now, buffer)
	}

	/// Time left before the hard expiry, clamped at zero.
	pub fn remaining_at(&self, now: OffsetDateTime) -> Duration {
		let remaining = self.expires_at - now;

		if remaining.is_negative() { Duration::ZERO } else { remaining }
	}
}
impl Debug for CachedToken {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CachedToken")
			.field("value", &"<redacted>")
			.field("issued_for", &self.issued_for)
			.field("issued_at", &self.issued_at)
			.field("expires_at", &self.expires_at)
			.finish()
	}
}
