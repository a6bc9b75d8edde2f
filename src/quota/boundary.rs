//! Daily reset boundary in a named timezone.

// crates.io
use chrono::{DateTime, NaiveDate, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

/// Returns the epoch millis of the first local midnight in `tz` strictly after `now_millis`.
///
/// The date arithmetic happens on the local calendar, so the result stays at 00:00 local
/// across DST transitions. A day containing a fall-back transition is 25 hours long, so the
/// result can be up to 25 hours ahead. Zones whose clocks skip midnight resolve to the first
/// valid local instant of that day.
pub fn next_reset_millis(now_millis: i64, tz: Tz) -> i64 {
	let now = DateTime::<Utc>::from_timestamp_millis(now_millis).unwrap_or(DateTime::<Utc>::MIN_UTC);
	let today = now.with_timezone(&tz).date_naive();
	let tomorrow = today.succ_opt().unwrap_or(NaiveDate::MAX);

	first_instant_of(tomorrow, tz)
		.map(|instant| instant.timestamp_millis())
		.unwrap_or_else(|| now_millis.saturating_add(TimeDelta::days(1).num_milliseconds()))
}

fn first_instant_of(date: NaiveDate, tz: Tz) -> Option<DateTime<Tz>> {
	let midnight = date.and_hms_opt(0, 0, 0)?;

	(0..24).find_map(|hour| tz.from_local_datetime(&(midnight + TimeDelta::hours(hour))).earliest())
}

#[cfg(test)]
mod tests {
	// crates.io
	use chrono::Timelike;
	// self
	use super::*;

	const HOUR: i64 = 3_600_000;
	const LA: Tz = Tz::America__Los_Angeles;

	fn utc_millis(y: i32, m: u32, d: u32, h: u32, min: u32) -> i64 {
		Utc.with_ymd_and_hms(y, m, d, h, min, 0)
			.single()
			.expect("UTC fixture should be unambiguous.")
			.timestamp_millis()
	}

	#[test]
	fn ordinary_day_resets_at_pacific_midnight() {
		// 2025-03-04 04:00 PST.
		let now = utc_millis(2025, 3, 4, 12, 0);

		assert_eq!(next_reset_millis(now, LA), utc_millis(2025, 3, 5, 8, 0));
	}

	#[test]
	fn spring_forward_day_is_23_hours_long() {
		// 2025-03-09 00:30 PST; clocks jump to PDT at 02:00.
		let now = utc_millis(2025, 3, 9, 8, 30);
		let next = next_reset_millis(now, LA);

		assert_eq!(next, utc_millis(2025, 3, 10, 7, 0));
		assert_eq!(next - now, 22 * HOUR + HOUR / 2);
	}

	#[test]
	fn fall_back_day_is_25_hours_long() {
		// 2025-11-02 00:30 PDT; clocks fall back to PST at 02:00.
		let now = utc_millis(2025, 11, 2, 7, 30);
		let next = next_reset_millis(now, LA);

		assert_eq!(next, utc_millis(2025, 11, 3, 8, 0));
		assert_eq!(next - now, 24 * HOUR + HOUR / 2);
	}

	#[test]
	fn exact_midnight_moves_to_the_following_day() {
		let midnight = utc_millis(2025, 3, 5, 8, 0);

		assert_eq!(next_reset_millis(midnight, LA), utc_millis(2025, 3, 6, 8, 0));
	}

	#[test]
	fn boundary_is_always_future_local_midnight() {
		let start = utc_millis(2025, 1, 1, 0, 17);

		for step in 0..(366 * 24) {
			let now = start + step * HOUR;
			let next = next_reset_millis(now, LA);
			let local = DateTime::<Utc>::from_timestamp_millis(next)
				.expect("Boundary should be representable.")
				.with_timezone(&LA);

			assert!(next > now, "Boundary must lie strictly in the future.");
			assert!(next - now <= 25 * HOUR, "Boundary must be at most one local day ahead.");
			assert_eq!((local.hour(), local.minute()), (0, 0));
		}
	}

	#[test]
	fn other_zones_use_their_own_midnight() {
		// 2025-03-04 12:00 UTC is 21:00 in Tokyo.
		let now = utc_millis(2025, 3, 4, 12, 0);

		assert_eq!(next_reset_millis(now, Tz::Asia__Tokyo), utc_millis(2025, 3, 4, 15, 0));
	}
}
