//! Wall-clock abstraction so quota boundaries and session timestamps can be pinned in tests.

// std
use std::{
	sync::atomic::{AtomicI64, Ordering},
	time::{SystemTime, UNIX_EPOCH},
};
// self
use crate::_prelude::*;

/// Source of the current wall-clock time in epoch milliseconds.
pub trait Clock
where
	Self: Send + Sync,
{
	/// Returns the current time as milliseconds since the Unix epoch.
	fn now_millis(&self) -> i64;

	/// Returns the current time as a UTC timestamp.
	fn now_utc(&self) -> OffsetDateTime {
		OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.now_millis()) * 1_000_000)
			.unwrap_or(OffsetDateTime::UNIX_EPOCH)
	}
}

/// Clock backed by the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;
impl Clock for SystemClock {
	fn now_millis(&self) -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
			.unwrap_or_default()
	}
}

/// Manually driven clock for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);
impl ManualClock {
	/// Creates a clock pinned at `millis`.
	pub fn new(millis: i64) -> Self {
		Self(AtomicI64::new(millis))
	}

	/// Moves the clock to an absolute instant.
	pub fn set(&self, millis: i64) {
		self.0.store(millis, Ordering::SeqCst);
	}

	/// Advances the clock by `delta`.
	pub fn advance(&self, delta: StdDuration) {
		let delta = i64::try_from(delta.as_millis()).unwrap_or(i64::MAX);

		self.0.fetch_add(delta, Ordering::SeqCst);
	}
}
impl Clock for ManualClock {
	fn now_millis(&self) -> i64 {
		self.0.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn manual_clock_moves_only_when_told() {
		let clock = ManualClock::new(1_000);

		assert_eq!(clock.now_millis(), 1_000);

		clock.advance(StdDuration::from_secs(2));

		assert_eq!(clock.now_millis(), 3_000);

		clock.set(10);

		assert_eq!(clock.now_millis(), 10);
	}

	#[test]
	fn utc_view_matches_the_millis() {
		let clock = ManualClock::new(1_741_089_600_123);
		let now = clock.now_utc();

		assert_eq!(now.unix_timestamp(), 1_741_089_600);
		assert_eq!(now.millisecond(), 123);
	}

	#[test]
	fn system_clock_is_after_2024() {
		assert!(SystemClock.now_millis() > 1_704_067_200_000);
	}
}
