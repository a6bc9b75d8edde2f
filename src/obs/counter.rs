// self
use crate::obs::{FlowKind, FlowOutcome};

/// Records a flow outcome via the global metrics recorder (when enabled).
pub fn record_flow_outcome(kind: FlowKind, outcome: FlowOutcome) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(
			"livechat_broker_flow_total",
			"flow" => kind.as_str(),
			"outcome" => outcome.as_str()
		)
		.increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = (kind, outcome);
	}
}

/// Records success or failure depending on `result`.
pub fn record_result<T, E>(kind: FlowKind, result: &std::result::Result<T, E>) {
	let outcome = if result.is_ok() { FlowOutcome::Success } else { FlowOutcome::Failure };

	record_flow_outcome(kind, outcome);
}

/// Adds positive quota spend for `application` to the units counter.
pub fn record_quota_units(application: &str, units: i64) {
	#[cfg(feature = "metrics")]
	{
		if let Ok(units) = u64::try_from(units) {
			metrics::counter!("livechat_broker_quota_units_total", "application" => application.to_owned())
				.increment(units);
		}
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = (application, units);
	}
}
