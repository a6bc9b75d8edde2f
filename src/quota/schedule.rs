//! Pure delay scheduling and quota error classification.

// self
use crate::{
	_prelude::*,
	error::UpstreamError,
	quota::STREAM_LIST_UNIT_COST,
	registry::QuotaSettings,
};

/// Share of the daily quota the poll loop may spend; the rest covers sends, lookups, and
/// token refreshes.
pub const POLL_BUDGET_RATIO: f64 = 0.8;

const QUOTA_REASONS: &[&str] =
	&["quotaExceeded", "rateLimitExceeded", "dailyLimitExceeded", "userRateLimitExceeded"];

/// Converts quota settings into a per-poll delay in whole seconds.
///
/// A manual override with a positive custom delay wins. Otherwise the poll budget is
/// spread over `max_active_hours`, and `None` is returned (with an error log) when either
/// input is not positive.
pub fn calculate_delay(settings: &QuotaSettings) -> Option<u64> {
	if settings.override_delay && settings.custom_delay_seconds > 0 {
		return u64::try_from(settings.custom_delay_seconds).ok();
	}
	if settings.daily_quota == 0 {
		tracing::error!(daily_quota = settings.daily_quota, "Daily quota must be positive.");

		return None;
	}
	if !(settings.max_active_hours.is_finite() && settings.max_active_hours > 0.) {
		tracing::error!(
			max_active_hours = settings.max_active_hours,
			"Max active hours must be a positive number."
		);

		return None;
	}

	let calls_per_day = settings.daily_quota as f64 * POLL_BUDGET_RATIO / STREAM_LIST_UNIT_COST as f64;
	let calls_per_hour = calls_per_day / settings.max_active_hours;
	let delay = (3_600. / calls_per_hour).round().max(0.);

	Some(delay as u64)
}

/// Formats a delay as `45s`, `2m`, or `2m 5s`.
pub fn format_delay(seconds: u64) -> String {
	let (minutes, rest) = (seconds / 60, seconds % 60);

	match (minutes, rest) {
		(0, rest) => format!("{rest}s"),
		(minutes, 0) => format!("{minutes}m"),
		(minutes, rest) => format!("{minutes}m {rest}s"),
	}
}

/// Returns `true` when an upstream failure is a quota or rate-limit denial.
pub fn is_quota_exceeded(err: &UpstreamError) -> bool {
	if err
		.reason
		.as_deref()
		.is_some_and(|reason| QUOTA_REASONS.iter().any(|known| reason.eq_ignore_ascii_case(known)))
	{
		return true;
	}

	let message = err.message.to_ascii_lowercase();

	message.contains("quota") && (message.contains("exceed") || message.contains("exhaust"))
}

/// Broker-error form of [`is_quota_exceeded`]; only upstream failures can be quota denials.
pub fn is_quota_exceeded_error(err: &Error) -> bool {
	err.as_upstream().is_some_and(is_quota_exceeded)
}
