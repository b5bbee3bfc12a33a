use crate::analysis::round1;
use crate::broker::{Broker, Envelope};
use crate::error::{JobQueueError, Result};
use crate::record::{AudioUpload, BatchMember, BatchRecord, BatchStatus, JobRecord, JobStatus, ProcessingOptions};
use crate::status::{BatchMemberView, BatchView};
use crate::store::JobStore;
use std::sync::Arc;
use tracing::info;

/// Fans a batch submission out into individual jobs and aggregates member
/// statuses into a single view on demand.
pub struct BatchCoordinator {
	store: JobStore,
	broker: Arc<dyn Broker>,
	queue: String,
	max_batch_size: usize,
	member_retry_budget: u32,
}

impl BatchCoordinator {
	#[must_use]
	pub const fn new(store: JobStore, broker: Arc<dyn Broker>, queue: String, max_batch_size: usize, member_retry_budget: u32) -> Self {
		Self {
			store,
			broker,
			queue,
			max_batch_size,
			member_retry_budget,
		}
	}

	/// Create and enqueue one job per member, then persist the batch record.
	///
	/// All-or-nothing: the cap and the content-type precheck run over every
	/// member before the first job record is created, so a rejected
	/// submission leaves no partial batch behind. Returns without waiting
	/// for any member to start executing.
	pub async fn submit_batch(&self, files: Vec<AudioUpload>, options: &ProcessingOptions) -> Result<BatchRecord> {
		if files.is_empty() {
			return Err(JobQueueError::InvalidInput("batch contains no files".to_string()));
		}

		if files.len() > self.max_batch_size {
			return Err(JobQueueError::InvalidInput(format!("batch size limited to {} files", self.max_batch_size)));
		}

		for file in &files {
			if !file.is_audio() {
				return Err(JobQueueError::InvalidInput(format!("file {} is not an audio file", file.filename)));
			}
		}

		let mut members = Vec::with_capacity(files.len());

		for file in files {
			let record = JobRecord::new(&file.filename, self.member_retry_budget);
			self.store.save_job(&record).await?;

			let envelope = Envelope {
				job_id: record.job_id.clone(),
				filename: file.filename.clone(),
				audio: file.data,
				options: options.clone(),
				redelivered: false,
			};
			self.broker.enqueue(&self.queue, &envelope).await?;

			members.push(BatchMember {
				job_id: record.job_id,
				filename: file.filename,
			});
		}

		let batch = BatchRecord::new(members);
		self.store.save_batch(&batch).await?;

		info!(batch_id = %batch.batch_id, total_files = batch.members.len(), "batch submitted");
		Ok(batch)
	}

	/// Aggregate the batch by re-reading every member record. This is a
	/// pure function over the member job records, recomputed on each call
	/// so the view is never stale. Fails with `NotFound` for an unknown
	/// batch id.
	pub async fn batch_status(&self, batch_id: &str) -> Result<BatchView> {
		let batch = self.store.require_batch(batch_id).await?;

		let total_jobs = batch.members.len();
		let mut jobs = Vec::with_capacity(total_jobs);
		let mut completed_jobs = 0;
		let mut failed_jobs = 0;
		let mut any_started = false;

		for member in &batch.members {
			let view = match self.store.load_job(&member.job_id).await? {
				Some(record) => member_view(member, record),
				// An expired member reads as still pending; with matching
				// TTLs the batch record goes with it shortly after.
				None => BatchMemberView {
					job_id: member.job_id.clone(),
					filename: member.filename.clone(),
					status: JobStatus::Pending,
					ready: false,
					result: None,
					error: None,
				},
			};

			if view.ready {
				completed_jobs += 1;
				// Anything settled without a result counts as failed here,
				// revoked members included.
				if view.status != JobStatus::Success {
					failed_jobs += 1;
				}
			}
			if view.status != JobStatus::Pending {
				any_started = true;
			}

			jobs.push(view);
		}

		let status = if completed_jobs == total_jobs {
			BatchStatus::Completed
		} else if any_started {
			BatchStatus::InProgress
		} else {
			BatchStatus::Submitted
		};

		let progress_percentage = round1(completed_jobs as f64 / total_jobs as f64 * 100.0);

		Ok(BatchView {
			batch_id: batch.batch_id,
			status,
			total_jobs,
			completed_jobs,
			failed_jobs,
			progress_percentage,
			jobs,
			submitted_at: batch.submitted_at,
		})
	}
}

fn member_view(member: &BatchMember, record: JobRecord) -> BatchMemberView {
	let ready = record.status.is_terminal();

	BatchMemberView {
		job_id: member.job_id.clone(),
		filename: member.filename.clone(),
		status: record.status,
		ready,
		result: if record.status == JobStatus::Success { record.result } else { None },
		error: if record.status == JobStatus::Failure {
			record.error.map(|e| e.message)
		} else {
			None
		},
	}
}
