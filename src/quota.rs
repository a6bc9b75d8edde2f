//! Quota ledger, reset boundary, and delay scheduler.
//!
//! The upstream API charges every call against a shared daily budget that resets at
//! midnight in a fixed reference timezone. [`QuotaLedger`] tracks spend per application,
//! [`schedule`] turns quota settings into a safe poll delay, and [`boundary`] computes the
//! next reset instant.

pub mod boundary;
pub mod ledger;
pub mod schedule;

pub use boundary::next_reset_millis;
pub use ledger::*;
pub use schedule::*;

/// Units charged for one live chat message list call.
pub const STREAM_LIST_UNIT_COST: i64 = 5;
/// Units charged for inserting one live chat message.
pub const MESSAGE_INSERT_UNIT_COST: i64 = 50;
