//! Cancellable timer handles for background refresh and poll scheduling.
//!
//! Every recurring job in the broker is represented by a [`ScheduledTask`]: the instant it
//! will next fire plus a cancel handle. Cancelling only aborts a task that is still waiting;
//! a job that already fired runs to completion and is expected to notice the cancellation on
//! its own. Tests drive these with Tokio's paused clock.

// std
use std::sync::atomic::{AtomicU8, Ordering};
// crates.io
use tokio::{
	task::JoinHandle,
	time::{self, Instant},
};
// self
use crate::_prelude::*;

const WAITING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to a one-shot or recurring job spawned on the Tokio runtime.
pub struct ScheduledTask {
	label: &'static str,
	delay: StdDuration,
	fires_at: Instant,
	phase: Arc<AtomicU8>,
	handle: JoinHandle<()>,
}
impl ScheduledTask {
	/// Runs `job` once after `delay`.
	pub fn once<F>(label: &'static str, delay: StdDuration, job: F) -> Self
	where
		F: 'static + Send + Future<Output = ()>,
	{
		let fires_at = Instant::now() + delay;
		let phase = Arc::new(AtomicU8::new(WAITING));
		let task_phase = phase.clone();
		let handle = tokio::spawn(async move {
			time::sleep_until(fires_at).await;

			if !fire(&task_phase) {
				return;
			}

			job.await;
		});

		Self { label, delay, fires_at, phase, handle }
	}

	/// Runs the job produced by `make_job` every `period`, first firing after one period.
	///
	/// The loop ends when `make_job` returns `None`, which lets jobs hold a [`Weak`] owner
	/// reference and stop once the owner is dropped.
	pub fn every<F, Fut>(label: &'static str, period: StdDuration, mut make_job: F) -> Self
	where
		F: 'static + Send + FnMut() -> Option<Fut>,
		Fut: 'static + Send + Future<Output = ()>,
	{
		let fires_at = Instant::now() + period;
		let phase = Arc::new(AtomicU8::new(WAITING));
		let task_phase = phase.clone();
		let handle = tokio::spawn(async move {
			let mut next = fires_at;

			loop {
				time::sleep_until(next).await;

				if !fire(&task_phase) {
					break;
				}

				let Some(job) = make_job() else { break };

				job.await;

				// A cancel that arrived while the job ran leaves the phase at `CANCELLED`.
				if task_phase.compare_exchange(RUNNING, WAITING, Ordering::AcqRel, Ordering::Acquire).is_err()
				{
					break;
				}

				next += period;
			}
		});

		Self { label, delay: period, fires_at, phase, handle }
	}

	/// Label used in logs.
	pub fn label(&self) -> &'static str {
		self.label
	}

	/// Delay (or period) the task was scheduled with.
	pub fn delay(&self) -> StdDuration {
		self.delay
	}

	/// Instant of the first firing.
	pub fn fires_at(&self) -> Instant {
		self.fires_at
	}

	/// Returns `true` once the task has completed or been cancelled.
	pub fn is_finished(&self) -> bool {
		self.handle.is_finished()
	}

	/// Returns `true` while a fired job is executing.
	pub fn is_running(&self) -> bool {
		self.phase.load(Ordering::Acquire) == RUNNING && !self.handle.is_finished()
	}

	/// Cancels the task.
	///
	/// A task still waiting for its instant is aborted. A job that already fired is detached
	/// instead and finishes on its own; a recurring task then stops before its next firing.
	pub fn cancel(self) {
		loop {
			match self.phase.compare_exchange(WAITING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
			{
				Ok(_) => {
					self.handle.abort();

					return;
				},
				Err(RUNNING) => {
					if self
						.phase
						.compare_exchange(RUNNING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
						.is_ok()
					{
						tracing::trace!(label = self.label, "Detached a job that already fired.");

						return;
					}
				},
				Err(_) => return,
			}
		}
	}
}
impl Debug for ScheduledTask {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ScheduledTask")
			.field("label", &self.label)
			.field("delay", &self.delay)
			.field("finished", &self.handle.is_finished())
			.finish()
	}
}

/// Moves a waiting task to running; fails once it was cancelled.
fn fire(phase: &AtomicU8) -> bool {
	phase.compare_exchange(WAITING, RUNNING, Ordering::AcqRel, Ordering::Acquire).is_ok()
}
