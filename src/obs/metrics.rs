//! `iap_auth_flow_total` counter shared by the token cache and the request flow.
//!
//! Each operation records `attempt` on entry and then `success` or `failure`, so the counter
//! can be read as calls started versus calls that failed per `flow` label. A cache hit records
//! a `token` attempt and success with no `refresh` entries.

// self
use crate::obs::{FlowKind, FlowOutcome};

/// Name of the counter incremented by [`record_flow_outcome`].
pub const FLOW_COUNTER: &str = "iap_auth_flow_total";

/// Increments [`FLOW_COUNTER`] labeled by `flow` and `outcome`; a no-op without `metrics`.
pub fn record_flow_outcome(kind: FlowKind, outcome: FlowOutcome) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(FLOW_COUNTER, "flow" => kind.as_str(), "outcome" => outcome.as_str())
			.increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = (kind, outcome);
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn every_refresh_stage_can_record_failures() {
		for kind in [FlowKind::Refresh, FlowKind::Resolve, FlowKind::Credential, FlowKind::Issue] {
			record_flow_outcome(kind, FlowOutcome::Attempt);
			record_flow_outcome(kind, FlowOutcome::Failure);
		}

		assert_eq!(FLOW_COUNTER, "iap_auth_flow_total");
	}
}
