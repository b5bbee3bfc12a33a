use crate::batch::BatchCoordinator;
use crate::broker::{Broker, Envelope};
use crate::cancel::CancellationController;
use crate::config::Config;
use crate::error::{JobQueueError, Result};
use crate::record::{AudioUpload, BatchRecord, JobRecord, JobStatus, ProcessingOptions};
use crate::status::{BatchView, JobView, StatusService};
use crate::store::JobStore;
use crate::worker::{ActiveJobs, JobSummary, WorkerMetrics};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueDepth {
	pub queue: String,
	pub depth: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkerStatsSnapshot {
	pub active_workers: u64,
	pub jobs_processed: u64,
	pub jobs_failed: u64,
	pub jobs_retried: u64,
	pub jobs_revoked: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueStats {
	pub queues: Vec<QueueDepth>,
	pub workers: WorkerStatsSnapshot,
	pub timestamp: DateTime<Utc>,
}

/// Client-facing entry point: submission, status, cancellation and
/// introspection over one store/broker pair. Workers run elsewhere; the
/// service never executes jobs itself.
pub struct JobService {
	store: JobStore,
	broker: Arc<dyn Broker>,
	batches: BatchCoordinator,
	statuses: StatusService,
	cancellations: CancellationController,
	active: Arc<ActiveJobs>,
	metrics: WorkerMetrics,
	queue: String,
	max_retries: u32,
}

impl JobService {
	#[must_use]
	pub fn new(config: &Config, store: JobStore, broker: Arc<dyn Broker>, active: Arc<ActiveJobs>, metrics: WorkerMetrics) -> Self {
		let batches = BatchCoordinator::new(
			store.clone(),
			Arc::clone(&broker),
			config.queue_key.clone(),
			config.max_batch_size,
			config.batch_max_retries,
		);

		Self {
			batches,
			statuses: StatusService::new(store.clone()),
			cancellations: CancellationController::new(store.clone()),
			store,
			broker,
			active,
			metrics,
			queue: config.queue_key.clone(),
			max_retries: config.max_retries,
		}
	}

	/// Accept a single upload: persist a PENDING record, enqueue the work,
	/// return immediately with the new record.
	///
	/// # Errors
	/// `InvalidInput` when the upload is not audio; infrastructure errors
	/// from the store or broker otherwise.
	pub async fn submit_job(&self, file: AudioUpload, options: &ProcessingOptions) -> Result<JobRecord> {
		if !file.is_audio() {
			return Err(JobQueueError::InvalidInput(format!("file {} is not an audio file", file.filename)));
		}

		let record = JobRecord::new(&file.filename, self.max_retries);
		self.store.save_job(&record).await?;

		let envelope = Envelope {
			job_id: record.job_id.clone(),
			filename: file.filename,
			audio: file.data,
			options: options.clone(),
			redelivered: false,
		};
		self.broker.enqueue(&self.queue, &envelope).await?;

		info!(job_id = %record.job_id, filename = %record.filename, "job submitted");
		Ok(record)
	}

	/// Accept up to the configured cap of uploads as one batch. Rejects the
	/// whole submission before creating anything if any file fails the
	/// precheck.
	pub async fn submit_batch(&self, files: Vec<AudioUpload>, options: &ProcessingOptions) -> Result<BatchRecord> {
		self.batches.submit_batch(files, options).await
	}

	pub async fn get_job_status(&self, job_id: &str) -> Result<JobView> {
		self.statuses.job_status(job_id).await
	}

	pub async fn get_batch_status(&self, batch_id: &str) -> Result<BatchView> {
		self.batches.batch_status(batch_id).await
	}

	/// Request cancellation. Takes effect at the next stage boundary for a
	/// running job; a not-yet-started job is revoked before it ever runs.
	pub async fn cancel_job(&self, job_id: &str) -> Result<JobStatus> {
		self.cancellations.cancel(job_id).await
	}

	pub async fn list_active_jobs(&self) -> Vec<JobSummary> {
		self.active.snapshot().await
	}

	/// Point-in-time queue depths plus cumulative worker counters.
	pub async fn queue_stats(&self) -> Result<QueueStats> {
		let depths = self.broker.queue_depths().await?;

		#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
		let workers = WorkerStatsSnapshot {
			active_workers: self.metrics.active_workers.get() as u64,
			jobs_processed: self.metrics.jobs_processed.get() as u64,
			jobs_failed: self.metrics.jobs_failed.get() as u64,
			jobs_retried: self.metrics.jobs_retried.get() as u64,
			jobs_revoked: self.metrics.jobs_revoked.get() as u64,
		};

		Ok(QueueStats {
			queues: depths.into_iter().map(|(queue, depth)| QueueDepth { queue, depth }).collect(),
			workers,
			timestamp: Utc::now(),
		})
	}
}
