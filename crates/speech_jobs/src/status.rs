use crate::error::Result;
use crate::record::{BatchStatus, JobRecord, JobStatus, TranscriptReport};
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Read model of a single job for polling clients.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobView {
	pub job_id: String,
	pub status: JobStatus,
	pub ready: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub successful: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub failed: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<TranscriptReport>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub progress: Option<BTreeMap<String, u8>>,
}

impl JobView {
	/// Pure projection of a job record. A revoked job is ready with neither
	/// result nor error payload.
	#[must_use]
	pub fn from_record(record: JobRecord) -> Self {
		let ready = record.status.is_terminal();

		Self {
			job_id: record.job_id,
			status: record.status,
			ready,
			successful: ready.then(|| record.status == JobStatus::Success),
			failed: ready.then(|| record.status == JobStatus::Failure),
			result: if record.status == JobStatus::Success { record.result } else { None },
			error: if record.status == JobStatus::Failure {
				record.error.map(|e| e.message)
			} else {
				None
			},
			progress: if record.status == JobStatus::Progress {
				Some(record.stage_meta)
			} else {
				None
			},
		}
	}
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchMemberView {
	pub job_id: String,
	pub filename: String,
	pub status: JobStatus,
	pub ready: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<TranscriptReport>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

/// Aggregated batch read model, recomputed from every member record on
/// each call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchView {
	pub batch_id: String,
	pub status: BatchStatus,
	pub total_jobs: usize,
	pub completed_jobs: usize,
	pub failed_jobs: usize,
	pub progress_percentage: f64,
	pub jobs: Vec<BatchMemberView>,
	pub submitted_at: DateTime<Utc>,
}

/// Read-only views over job state for polling clients. Never retries and
/// never mutates; it reports whatever terminal or in-flight state exists.
#[derive(Clone)]
pub struct StatusService {
	store: JobStore,
}

impl StatusService {
	#[must_use]
	pub const fn new(store: JobStore) -> Self {
		Self { store }
	}

	/// Fails fast with `NotFound` when the store has no record, including
	/// after TTL expiry — callers must not rely on post-expiry status.
	pub async fn job_status(&self, job_id: &str) -> Result<JobView> {
		let record = self.store.require_job(job_id).await?;
		Ok(JobView::from_record(record))
	}
}
