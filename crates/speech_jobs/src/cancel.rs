use crate::error::Result;
use crate::record::JobStatus;
use crate::store::JobStore;
use chrono::Utc;
use tracing::info;

/// Best-effort revoke-and-terminate for a job.
///
/// Cancellation is cooperative: a job not yet picked up is skipped
/// straight to REVOKED by the worker's pre-check; an in-flight execution
/// observes the revocation flag at its next stage boundary. A transcribe
/// call already running is not interrupted — its eventual terminal write is
/// discarded by the finalize guard instead.
#[derive(Clone)]
pub struct CancellationController {
	store: JobStore,
}

impl CancellationController {
	#[must_use]
	pub const fn new(store: JobStore) -> Self {
		Self { store }
	}

	/// Mark a job revoked. Cancelling an already-terminal job is a no-op,
	/// not an error, and leaves the stored result untouched. Returns the
	/// job's status after the call.
	pub async fn cancel(&self, job_id: &str) -> Result<JobStatus> {
		let mut record = self.store.require_job(job_id).await?;

		if record.status.is_terminal() {
			info!(job_id, status = ?record.status, "cancel requested for terminal job, no-op");
			return Ok(record.status);
		}

		// Flag first: an executor between stage boundaries sees the flag
		// even if its own record write races with the status flip below
		// (last write wins, no compare-and-swap).
		self.store.mark_revoked(job_id).await?;

		record.status = JobStatus::Revoked;
		record.result = None;
		record.error = None;
		record.completed_at = Some(Utc::now());
		self.store.save_job(&record).await?;

		info!(job_id, "job revoked");
		Ok(JobStatus::Revoked)
	}
}
