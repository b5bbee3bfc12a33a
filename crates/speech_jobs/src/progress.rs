use crate::error::Result;
use crate::record::JobStatus;
use crate::store::JobStore;
use tracing::debug;

/// Writes intermediate stage transitions for a job as it advances through
/// the pipeline. Callable only by the executor owning the job's active
/// delivery; progress writes are monotone because no one else writes
/// `stage_meta`.
#[derive(Clone)]
pub struct ProgressReporter {
	store: JobStore,
}

impl ProgressReporter {
	#[must_use]
	pub const fn new(store: JobStore) -> Self {
		Self { store }
	}

	/// Idempotent, last-write-wins update of `stage_meta`. A no-op once the
	/// record is terminal; that only happens when a stale retry raced a
	/// cancellation or finalization, and the terminal state must stand.
	pub async fn report(&self, job_id: &str, stage: &str, percent: u8) -> Result<()> {
		let Some(mut record) = self.store.load_job(job_id).await? else {
			// Record expired mid-flight; nothing left to update.
			return Ok(());
		};

		if record.status.is_terminal() {
			debug!(job_id, stage, "progress write after terminal state, dropped");
			return Ok(());
		}

		record.status = JobStatus::Progress;
		record.stage_meta.insert(stage.to_string(), percent.min(100));
		self.store.save_job(&record).await
	}
}
