use crate::broker::{Broker, Delivery};
use crate::error::Result;
use crate::executor::{ExecOutcome, JobExecutor};
use crate::record::JobStatus;
use chrono::{DateTime, Utc};
use prometheus::{Counter, Gauge, Registry};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pool-level counters, registered on the shared prometheus registry.
#[derive(Clone)]
pub struct WorkerMetrics {
	pub active_workers: Gauge,
	pub jobs_processed: Counter,
	pub jobs_failed: Counter,
	pub jobs_retried: Counter,
	pub jobs_revoked: Counter,
}

impl WorkerMetrics {
	///
	/// # Errors
	/// Returns an error if a collector cannot be created or registered.
	pub fn new(registry: &Registry) -> Result<Self> {
		let active_workers = Gauge::new("worker_pool_active_workers", "Number of active workers")?;
		let jobs_processed = Counter::new("worker_pool_jobs_processed", "Total jobs settled by the pool")?;
		let jobs_failed = Counter::new("worker_pool_jobs_failed", "Jobs finalized as FAILURE")?;
		let jobs_retried = Counter::new("worker_pool_jobs_retried", "Retry attempts consumed")?;
		let jobs_revoked = Counter::new("worker_pool_jobs_revoked", "Jobs settled as REVOKED")?;

		registry.register(Box::new(active_workers.clone()))?;
		registry.register(Box::new(jobs_processed.clone()))?;
		registry.register(Box::new(jobs_failed.clone()))?;
		registry.register(Box::new(jobs_retried.clone()))?;
		registry.register(Box::new(jobs_revoked.clone()))?;

		Ok(Self {
			active_workers,
			jobs_processed,
			jobs_failed,
			jobs_retried,
			jobs_revoked,
		})
	}
}

/// One currently-executing job as listed by `list_active_jobs`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobSummary {
	pub job_id: String,
	pub filename: String,
	pub worker_id: usize,
	pub started_at: DateTime<Utc>,
}

/// Registry of in-flight jobs across all workers in this process.
#[derive(Default)]
pub struct ActiveJobs {
	jobs: RwLock<HashMap<String, JobSummary>>,
}

impl ActiveJobs {
	#[must_use]
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub async fn insert(&self, summary: JobSummary) {
		self.jobs.write().await.insert(summary.job_id.clone(), summary);
	}

	pub async fn remove(&self, job_id: &str) {
		self.jobs.write().await.remove(job_id);
	}

	pub async fn snapshot(&self) -> Vec<JobSummary> {
		let mut summaries: Vec<JobSummary> = self.jobs.read().await.values().cloned().collect();
		summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at));
		summaries
	}
}

/// Pool of independent workers, each pulling one delivery at a time
/// (prefetch = 1) and executing it to a settled outcome before accepting
/// the next.
pub struct WorkerPool {
	executor: Arc<JobExecutor>,
	broker: Arc<dyn Broker>,
	metrics: WorkerMetrics,
	active: Arc<ActiveJobs>,
	dequeue_timeout: Duration,
}

impl WorkerPool {
	#[must_use]
	pub fn new(executor: Arc<JobExecutor>, broker: Arc<dyn Broker>, metrics: WorkerMetrics, active: Arc<ActiveJobs>, dequeue_timeout: Duration) -> Self {
		Self {
			executor,
			broker,
			metrics,
			active,
			dequeue_timeout,
		}
	}

	/// Spawn `num_workers` worker loops. Each loop runs until the shutdown
	/// token fires, finishing its in-flight job first.
	pub fn spawn(&self, num_workers: usize, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
		let mut handles = Vec::with_capacity(num_workers);

		for worker_id in 0..num_workers {
			let executor = Arc::clone(&self.executor);
			let broker = Arc::clone(&self.broker);
			let metrics = self.metrics.clone();
			let active = Arc::clone(&self.active);
			let dequeue_timeout = self.dequeue_timeout;
			let shutdown = shutdown.clone();

			metrics.active_workers.inc();

			handles.push(tokio::spawn(async move {
				worker_loop(worker_id, executor, broker, &metrics, active, dequeue_timeout, shutdown).await;
				metrics.active_workers.dec();
			}));
		}

		info!(num_workers, "worker pool started");
		handles
	}
}

async fn worker_loop(
	worker_id: usize,
	executor: Arc<JobExecutor>,
	broker: Arc<dyn Broker>,
	metrics: &WorkerMetrics,
	active: Arc<ActiveJobs>,
	dequeue_timeout: Duration,
	shutdown: CancellationToken,
) {
	info!(worker_id, "worker started");

	loop {
		let delivery = tokio::select! {
			() = shutdown.cancelled() => {
				info!(worker_id, "worker shutting down");
				break;
			}
			result = broker.dequeue(dequeue_timeout) => match result {
				Ok(Some(delivery)) => delivery,
				Ok(None) => continue,
				Err(e) => {
					warn!(worker_id, error = %e, "dequeue failed, backing off");
					tokio::time::sleep(Duration::from_secs(1)).await;
					continue;
				}
			}
		};

		process_delivery(worker_id, &executor, &broker, metrics, &active, delivery).await;
	}
}

async fn process_delivery(worker_id: usize, executor: &JobExecutor, broker: &Arc<dyn Broker>, metrics: &WorkerMetrics, active: &ActiveJobs, delivery: Delivery) {
	let job_id = delivery.envelope.job_id.clone();

	active
		.insert(JobSummary {
			job_id: job_id.clone(),
			filename: delivery.envelope.filename.clone(),
			worker_id,
			started_at: Utc::now(),
		})
		.await;

	let settled = match executor.execute(&delivery).await {
		Ok(ExecOutcome::Completed(status)) => {
			metrics.jobs_processed.inc();
			match status {
				JobStatus::Failure => metrics.jobs_failed.inc(),
				JobStatus::Revoked => metrics.jobs_revoked.inc(),
				_ => {}
			}
			true
		}
		Ok(ExecOutcome::Retrying { attempt, .. }) => {
			metrics.jobs_retried.inc();
			info!(worker_id, job_id = %job_id, attempt, "job requeued for retry");
			true
		}
		Err(e) if e.is_retryable() => {
			// A transient outage (store or broker) kept the job from even
			// being bookkept. Leave the delivery unacked; reclaim will
			// redeliver it once its claim expires.
			warn!(worker_id, job_id = %job_id, error = %e, "execution hit transient infrastructure failure, leaving delivery for reclaim");
			false
		}
		Err(e) => {
			metrics.jobs_failed.inc();
			error!(worker_id, job_id = %job_id, error = %e, "job execution unrecoverable");
			true
		}
	};

	active.remove(&job_id).await;

	if settled {
		if let Err(e) = broker.ack(&delivery).await {
			warn!(worker_id, job_id = %job_id, error = %e, "failed to ack delivery");
		}
	}
}
