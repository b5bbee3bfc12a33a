use crate::analysis;
use crate::broker::{Broker, Delivery, Envelope};
use crate::engine::EngineRegistry;
use crate::error::{JobQueueError, Result};
use crate::progress::ProgressReporter;
use crate::record::{JobFailure, JobRecord, JobStatus, SegmentReport, TranscriptReport};
use crate::store::JobStore;
use chrono::Utc;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Stage names written into `stage_meta`, with the percent reported on
/// entering each stage.
pub mod stage {
	pub const RESOLVE_MODEL: (&str, u8) = ("Loading model", 10);
	pub const PERSIST_AUDIO: (&str, u8) = ("Saving audio file", 20);
	pub const TRANSCRIBE: (&str, u8) = ("Transcribing audio", 30);
	pub const ANALYZE: (&str, u8) = ("Analyzing speech", 70);
	pub const FINALIZE: (&str, u8) = ("Finalizing results", 90);
}

/// How one delivery settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
	/// The job reached a terminal state (Success, Failure or Revoked).
	Completed(JobStatus),
	/// A retryable failure consumed one attempt; the job was re-enqueued
	/// with backoff.
	Retrying { attempt: u32, delay: Duration },
}

/// Exponential backoff: `base × 2^attempt` for the attempt about to be
/// consumed (0-based).
#[must_use]
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
	base.saturating_mul(2_u32.saturating_pow(attempt))
}

/// Consumes one delivered job and drives it through the five-stage
/// pipeline, writing stage metadata at every boundary and applying the
/// retry/backoff policy on failure.
pub struct JobExecutor {
	store: JobStore,
	broker: Arc<dyn Broker>,
	engines: Arc<EngineRegistry>,
	progress: ProgressReporter,
	retry_base_delay: Duration,
}

impl JobExecutor {
	#[must_use]
	pub fn new(store: JobStore, broker: Arc<dyn Broker>, engines: Arc<EngineRegistry>, retry_base_delay: Duration) -> Self {
		let progress = ProgressReporter::new(store.clone());
		Self {
			store,
			broker,
			engines,
			progress,
			retry_base_delay,
		}
	}

	/// Execute a delivery to a settled outcome. Errors escape only when the
	/// job record itself is unreachable (expired or store down); every
	/// pipeline failure is absorbed into retry bookkeeping or a FAILURE
	/// record.
	pub async fn execute(&self, delivery: &Delivery) -> Result<ExecOutcome> {
		let envelope = &delivery.envelope;
		let mut record = self.store.require_job(&envelope.job_id).await?;

		// Revocation pre-check: a job cancelled before pickup skips the
		// pipeline entirely.
		if record.status == JobStatus::Revoked || self.store.is_revoked(&envelope.job_id).await? {
			info!(job_id = %envelope.job_id, "job revoked before execution, skipping");
			return Ok(ExecOutcome::Completed(JobStatus::Revoked));
		}

		if record.status.is_terminal() {
			// Duplicate delivery of an already-settled job (at-least-once
			// transport); the stored result stands.
			return Ok(ExecOutcome::Completed(record.status));
		}

		// A redelivered envelope whose record still says PROGRESS means the
		// previous worker was lost mid-execution. That counts as a failed
		// attempt under the same budget.
		if envelope.redelivered && record.status == JobStatus::Progress {
			if record.retries_used >= record.retry_budget {
				return self.finalize_failure(record, "worker lost during execution").await;
			}
			record.retries_used += 1;
			warn!(
				job_id = %envelope.job_id,
				retries_used = record.retries_used,
				"worker lost, redelivery consumed one retry"
			);
		}

		record.status = JobStatus::Progress;
		record.stage_meta.clear();
		self.store.save_job(&record).await?;

		info!(job_id = %envelope.job_id, filename = %envelope.filename, attempt = record.retries_used, "starting audio processing job");

		match self.run_pipeline(&mut record, envelope).await {
			Ok(report) => {
				record.status = JobStatus::Success;
				record.result = Some(report);
				record.error = None;
				let settled = self.store.finalize(record).await?;
				info!(job_id = %envelope.job_id, status = ?settled.status, "job completed");
				Ok(ExecOutcome::Completed(settled.status))
			}
			Err(JobQueueError::Revoked) => {
				info!(job_id = %envelope.job_id, "job revoked mid-execution");
				Ok(ExecOutcome::Completed(JobStatus::Revoked))
			}
			Err(e) if e.is_retryable() && record.retries_used < record.retry_budget => self.schedule_retry(record, delivery, &e).await,
			Err(e) => {
				error!(job_id = %envelope.job_id, error = %e, "job failed with retry budget exhausted");
				self.finalize_failure(record, &e.to_string()).await
			}
		}
	}

	async fn run_pipeline(&self, record: &mut JobRecord, envelope: &Envelope) -> Result<TranscriptReport> {
		self.checkpoint(record, stage::RESOLVE_MODEL).await?;
		let engine = self.engines.resolve(&envelope.options.model)?;

		self.checkpoint(record, stage::PERSIST_AUDIO).await?;
		// Scratch artifact lives exactly as long as this function; the
		// tempfile is removed on drop on every exit path.
		let mut scratch = tempfile::NamedTempFile::new()?;
		scratch.write_all(&envelope.audio)?;
		scratch.flush()?;

		self.checkpoint(record, stage::TRANSCRIBE).await?;
		let path = scratch.path().to_path_buf();
		let output = tokio::task::spawn_blocking(move || engine.transcribe(&path)).await??;

		self.checkpoint(record, stage::ANALYZE).await?;
		let metrics = analysis::analyze_segments(&output.segments, envelope.options.expected_wpm);

		self.checkpoint(record, stage::FINALIZE).await?;
		let accuracy_score = envelope
			.options
			.expected_text
			.as_deref()
			.map(|expected| analysis::accuracy_score(&output.text, expected));

		let segments = output
			.segments
			.iter()
			.map(|s| SegmentReport {
				start: s.start,
				end: s.end,
				text: s.text.trim().to_string(),
				confidence: s.avg_logprob,
			})
			.collect();

		Ok(TranscriptReport {
			text: output.text.trim().to_string(),
			language: output.language,
			confidence: analysis::mean_confidence(&output.segments),
			segments,
			duration: metrics.duration,
			words_per_minute: metrics.words_per_minute,
			pause_count: metrics.pause_count,
			fluency_score: metrics.fluency_score,
			accuracy_score,
			model_used: envelope.options.model.clone(),
			processed_at: Utc::now(),
		})
	}

	/// Stage boundary: re-check revocation, then publish the stage entry.
	async fn checkpoint(&self, record: &mut JobRecord, (name, percent): (&str, u8)) -> Result<()> {
		if self.store.is_revoked(&record.job_id).await? {
			return Err(JobQueueError::Revoked);
		}

		record.stage_meta.insert(name.to_string(), percent);
		self.progress.report(&record.job_id, name, percent).await
	}

	async fn schedule_retry(&self, mut record: JobRecord, delivery: &Delivery, cause: &JobQueueError) -> Result<ExecOutcome> {
		let delay = backoff_delay(self.retry_base_delay, record.retries_used);
		record.retries_used += 1;
		record.status = JobStatus::Pending;
		// Stage meta from the failed attempt is cleared so percent stays
		// monotone within each attempt.
		record.stage_meta.clear();
		self.store.save_job(&record).await?;

		warn!(
			job_id = %record.job_id,
			attempt = record.retries_used,
			delay_ms = delay.as_millis() as u64,
			error = %cause,
			"retrying job with backoff"
		);

		let mut envelope = delivery.envelope.clone();
		envelope.redelivered = false;

		// The retry is persisted in the broker before the worker acks the
		// original delivery, so a crash here loses nothing: either the
		// delayed entry exists, or the unacked delivery comes back via
		// reclaim once its claim expires.
		self.broker.enqueue_delayed(&delivery.queue, &envelope, delay).await?;

		Ok(ExecOutcome::Retrying {
			attempt: record.retries_used,
			delay,
		})
	}

	async fn finalize_failure(&self, mut record: JobRecord, message: &str) -> Result<ExecOutcome> {
		record.status = JobStatus::Failure;
		record.error = Some(JobFailure {
			message: message.to_string(),
			retries_used: record.retries_used,
		});
		record.result = None;
		let settled = self.store.finalize(record).await?;
		Ok(ExecOutcome::Completed(settled.status))
	}
}
