//! Optional observability helpers for the token cache and the request flow.
//!
//! # Feature Flags
//!
//! - Enable `tracing` to emit structured spans named `iap_auth.flow` with the `flow` (operation)
//!   and `stage` (call site) fields, plus debug/info/warn events for refreshes, invalidations,
//!   and retries.
//! - Enable `metrics` to increment the `iap_auth_flow_total` counter for every
//!   attempt/success/failure, labeled by `flow` + `outcome`.

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

// self
use crate::_prelude::*;

/// Operations observed by the crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowKind {
	/// Token lookup through the cache (hit or refresh).
	Token,
	/// Cache refresh (credential + audience + issuance).
	Refresh,
	/// Audience resolution.
	Resolve,
	/// Identity token issuance.
	Issue,
	/// Ambient credential refresh.
	Credential,
	/// Authenticated request to the protected service.
	Request,
}
impl FlowKind {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowKind::Token => "token",
			FlowKind::Refresh => "refresh",
			FlowKind::Resolve => "resolve",
			FlowKind::Issue => "issue",
			FlowKind::Credential => "credential",
			FlowKind::Request => "request",
		}
	}
}
impl Display for FlowKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowOutcome {
	/// Entry to an operation.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
}
impl FlowOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowOutcome::Attempt => "attempt",
			FlowOutcome::Success => "success",
			FlowOutcome::Failure => "failure",
		}
	}
}
impl Display for FlowOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
