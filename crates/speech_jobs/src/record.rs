use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle state of a single job.
///
/// Created `Pending` at submission, flips to `Progress` on the first
/// execution attempt, then settles in exactly one of the terminal states.
/// A job waiting out a retry backoff returns to `Pending` with its
/// `retries_used` counter advanced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
	Pending,
	Progress,
	Success,
	Failure,
	Revoked,
}

impl JobStatus {
	#[must_use]
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Success | Self::Failure | Self::Revoked)
	}
}

/// Derived batch state, never stored. Computed on every read from the
/// status of each member job record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
	Submitted,
	InProgress,
	Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentReport {
	pub start: f64,
	pub end: f64,
	pub text: String,
	pub confidence: f64,
}

/// Success payload of a finished job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptReport {
	pub text: String,
	pub language: String,
	pub confidence: f64,
	pub segments: Vec<SegmentReport>,
	pub duration: f64,
	pub words_per_minute: f64,
	pub pause_count: u32,
	pub fluency_score: f64,
	pub accuracy_score: Option<f64>,
	pub model_used: String,
	pub processed_at: DateTime<Utc>,
}

/// Options applied to a job at submission. Batch members all share one
/// options value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingOptions {
	pub model: String,
	pub expected_text: Option<String>,
	pub expected_wpm: f64,
}

impl Default for ProcessingOptions {
	fn default() -> Self {
		Self {
			model: "base".to_string(),
			expected_text: None,
			expected_wpm: 100.0,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobFailure {
	pub message: String,
	pub retries_used: u32,
}

/// Persisted state of one unit of audio-analysis work.
///
/// Written only by the executor instance holding the job's active broker
/// delivery, with two exceptions: submission creates it, and the
/// cancellation controller may flip it to `Revoked` out-of-band.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
	pub job_id: String,
	pub filename: String,
	pub status: JobStatus,
	pub stage_meta: BTreeMap<String, u8>,
	pub result: Option<TranscriptReport>,
	pub error: Option<JobFailure>,
	pub retries_used: u32,
	pub retry_budget: u32,
	pub created_at: DateTime<Utc>,
	pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
	#[must_use]
	pub fn new(filename: &str, retry_budget: u32) -> Self {
		Self {
			job_id: Uuid::new_v4().to_string(),
			filename: filename.to_string(),
			status: JobStatus::Pending,
			stage_meta: BTreeMap::new(),
			result: None,
			error: None,
			retries_used: 0,
			retry_budget,
			created_at: Utc::now(),
			completed_at: None,
		}
	}

	#[must_use]
	pub fn key(job_id: &str) -> String {
		format!("job:{job_id}")
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchMember {
	pub job_id: String,
	pub filename: String,
}

/// Persisted membership of a batch. The member list is fixed at creation
/// and never changes; everything else about a batch is derived on read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchRecord {
	pub batch_id: String,
	pub members: Vec<BatchMember>,
	pub submitted_at: DateTime<Utc>,
}

impl BatchRecord {
	#[must_use]
	pub fn new(members: Vec<BatchMember>) -> Self {
		Self {
			batch_id: Uuid::new_v4().to_string(),
			members,
			submitted_at: Utc::now(),
		}
	}

	#[must_use]
	pub fn key(batch_id: &str) -> String {
		format!("batch:{batch_id}")
	}
}

/// Raw submission input as handed over by the upload boundary.
#[derive(Debug, Clone)]
pub struct AudioUpload {
	pub filename: String,
	pub content_type: String,
	pub data: Vec<u8>,
}

impl AudioUpload {
	#[must_use]
	pub fn is_audio(&self) -> bool {
		self.content_type.starts_with("audio/")
	}
}
