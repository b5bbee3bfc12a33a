//! End-to-end orchestration tests over the in-memory store and broker:
//! submission through worker execution to terminal status, retries,
//! batches, cancellation and lost-worker recovery.

use async_trait::async_trait;
use prometheus::Registry;
use speech_jobs::broker::MemoryBroker;
use speech_jobs::config::Config;
use speech_jobs::engine::{EngineError, EngineFactory, EngineRegistry, Segment, SpeechEngine, TranscriptOutput};
use speech_jobs::error::JobQueueError;
use speech_jobs::record::{AudioUpload, BatchStatus, JobRecord, JobStatus, ProcessingOptions};
use speech_jobs::service::JobService;
use speech_jobs::store::{JobStore, MemoryStore, ResultStore, StoreError};
use speech_jobs::worker::{ActiveJobs, WorkerMetrics, WorkerPool};
use speech_jobs::{Broker, ExecOutcome, JobExecutor};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum ScriptStep {
	Succeed,
	FailTransient,
}

/// Engine whose per-call behavior follows a script; once the script is
/// exhausted every further call succeeds. While `hold` is set, transcribe
/// calls block until `release`, simulating long-running inference.
struct ScriptedEngine {
	script: Mutex<VecDeque<ScriptStep>>,
	calls: AtomicU32,
	held: AtomicBool,
	output: TranscriptOutput,
}

impl ScriptedEngine {
	fn new(script: Vec<ScriptStep>) -> Arc<Self> {
		Arc::new(Self {
			script: Mutex::new(script.into()),
			calls: AtomicU32::new(0),
			held: AtomicBool::new(false),
			output: sample_output(),
		})
	}

	fn calls(&self) -> u32 {
		self.calls.load(Ordering::SeqCst)
	}

	fn hold(&self) {
		self.held.store(true, Ordering::SeqCst);
	}

	fn release(&self) {
		self.held.store(false, Ordering::SeqCst);
	}
}

impl SpeechEngine for ScriptedEngine {
	fn transcribe(&self, _audio: &Path) -> Result<TranscriptOutput, EngineError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		while self.held.load(Ordering::SeqCst) {
			std::thread::sleep(Duration::from_millis(5));
		}
		match self.script.lock().unwrap().pop_front() {
			Some(ScriptStep::FailTransient) => Err(EngineError::Inference("scripted failure".to_string())),
			_ => Ok(self.output.clone()),
		}
	}
}

struct ScriptedFactory {
	engine: Arc<ScriptedEngine>,
}

impl EngineFactory for ScriptedFactory {
	fn load(&self, variant: &str) -> Result<Arc<dyn SpeechEngine>, EngineError> {
		if variant == "base" {
			Ok(Arc::clone(&self.engine) as Arc<dyn SpeechEngine>)
		} else {
			Err(EngineError::UnsupportedVariant(variant.to_string()))
		}
	}
}

/// Store wrapper that fails reads while the outage flag is up, passing
/// everything else through to the in-memory store.
struct FlakyStore {
	inner: Arc<MemoryStore>,
	read_outage: AtomicBool,
}

impl FlakyStore {
	fn new(inner: Arc<MemoryStore>) -> Self {
		Self {
			inner,
			read_outage: AtomicBool::new(false),
		}
	}

	fn set_read_outage(&self, down: bool) {
		self.read_outage.store(down, Ordering::SeqCst);
	}
}

#[async_trait]
impl ResultStore for FlakyStore {
	async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
		self.inner.put(key, value, ttl).await
	}

	async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
		if self.read_outage.load(Ordering::SeqCst) {
			return Err(StoreError::Redis(redis::RedisError::from((redis::ErrorKind::IoError, "simulated outage"))));
		}
		self.inner.get(key).await
	}

	async fn delete(&self, key: &str) -> Result<(), StoreError> {
		self.inner.delete(key).await
	}
}

/// Two segments, six words, a one-second gap, five seconds of speech.
fn sample_output() -> TranscriptOutput {
	TranscriptOutput {
		text: " hello world one two three four ".to_string(),
		language: "en".to_string(),
		segments: vec![
			Segment {
				start: 0.0,
				end: 2.0,
				text: " hello world ".to_string(),
				avg_logprob: -0.2,
			},
			Segment {
				start: 3.0,
				end: 5.0,
				text: " one two three four ".to_string(),
				avg_logprob: -0.2,
			},
		],
	}
}

struct Harness {
	service: JobService,
	store: JobStore,
	backend: Arc<MemoryStore>,
	broker: Arc<MemoryBroker>,
	engine: Arc<ScriptedEngine>,
	executor: Arc<JobExecutor>,
	config: Config,
	shutdown: CancellationToken,
}

impl Harness {
	fn new(script: Vec<ScriptStep>) -> Self {
		Self::with_config(script, Config::test())
	}

	fn with_config(script: Vec<ScriptStep>, config: Config) -> Self {
		let backend = Arc::new(MemoryStore::new());
		Self::assemble(script, config, Arc::clone(&backend) as Arc<dyn ResultStore>, backend)
	}

	fn with_flaky_store(script: Vec<ScriptStep>, config: Config) -> (Self, Arc<FlakyStore>) {
		let backend = Arc::new(MemoryStore::new());
		let flaky = Arc::new(FlakyStore::new(Arc::clone(&backend)));
		let harness = Self::assemble(script, config, Arc::clone(&flaky) as Arc<dyn ResultStore>, backend);
		(harness, flaky)
	}

	fn assemble(script: Vec<ScriptStep>, config: Config, store_backend: Arc<dyn ResultStore>, backend: Arc<MemoryStore>) -> Self {
		let store = JobStore::new(store_backend, config.result_ttl);
		let broker = Arc::new(MemoryBroker::new(vec![config.queue_key.clone()], config.visibility_timeout));

		let engine = ScriptedEngine::new(script);
		let registry = Arc::new(EngineRegistry::new(Arc::new(ScriptedFactory { engine: Arc::clone(&engine) })));

		let executor = Arc::new(JobExecutor::new(
			store.clone(),
			Arc::clone(&broker) as Arc<dyn Broker>,
			registry,
			config.retry_base_delay,
		));

		let metrics = WorkerMetrics::new(&Registry::new()).unwrap();
		let service = JobService::new(&config, store.clone(), Arc::clone(&broker) as Arc<dyn Broker>, ActiveJobs::new(), metrics);

		Self {
			service,
			store,
			backend,
			broker,
			engine,
			executor,
			config,
			shutdown: CancellationToken::new(),
		}
	}

	/// Spawn detached worker loops; the harness shutdown token stops them
	/// on drop.
	fn start_workers(&self, num_workers: usize) {
		let metrics = WorkerMetrics::new(&Registry::new()).unwrap();
		let pool = WorkerPool::new(
			Arc::clone(&self.executor),
			Arc::clone(&self.broker) as Arc<dyn Broker>,
			metrics,
			ActiveJobs::new(),
			self.config.dequeue_timeout,
		);
		drop(pool.spawn(num_workers, self.shutdown.clone()));
	}

	async fn wait_terminal(&self, job_id: &str) -> JobRecord {
		let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
		loop {
			let record = self.store.require_job(job_id).await.unwrap();
			if record.status.is_terminal() {
				return record;
			}
			assert!(tokio::time::Instant::now() < deadline, "job {job_id} did not settle in time");
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	}

	async fn wait_engine_started(&self) {
		let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
		while self.engine.calls() == 0 {
			assert!(tokio::time::Instant::now() < deadline, "engine never invoked");
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	}

	async fn wait_batch_completed(&self, batch_id: &str) {
		let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
		loop {
			let view = self.service.get_batch_status(batch_id).await.unwrap();
			if view.status == BatchStatus::Completed {
				return;
			}
			assert!(tokio::time::Instant::now() < deadline, "batch {batch_id} did not complete in time");
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	}
}

impl Drop for Harness {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

fn wav(filename: &str) -> AudioUpload {
	AudioUpload {
		filename: filename.to_string(),
		content_type: "audio/wav".to_string(),
		data: vec![0u8; 64],
	}
}

#[tokio::test]
async fn single_job_runs_to_success_with_full_report() {
	let harness = Harness::new(vec![ScriptStep::Succeed]);
	harness.start_workers(1);

	let options = ProcessingOptions {
		expected_text: Some("hello world one two three four".to_string()),
		..ProcessingOptions::default()
	};
	let record = harness.service.submit_job(wav("reading.wav"), &options).await.unwrap();
	harness.wait_terminal(&record.job_id).await;

	let view = harness.service.get_job_status(&record.job_id).await.unwrap();
	assert_eq!(view.status, JobStatus::Success);
	assert!(view.ready);
	assert_eq!(view.successful, Some(true));
	assert_eq!(view.failed, Some(false));
	assert!(view.progress.is_none());
	assert!(view.error.is_none());

	let report = view.result.expect("success view carries the report");
	assert_eq!(report.text, "hello world one two three four");
	assert_eq!(report.language, "en");
	assert_eq!(report.model_used, "base");
	assert_eq!(report.pause_count, 1);
	assert!((report.duration - 5.0).abs() < f64::EPSILON);
	assert!((report.words_per_minute - 72.0).abs() < 1e-9);
	// wpm_score 0.72 weighted 0.7; the pause penalty bottoms out at zero.
	assert!((report.fluency_score - 50.4).abs() < 1e-9);
	assert!((report.confidence + 0.2).abs() < 1e-9);
	assert!((report.accuracy_score.unwrap() - 100.0).abs() < f64::EPSILON);
	assert_eq!(report.segments.len(), 2);
	assert_eq!(report.segments[0].text, "hello world");

	assert_eq!(harness.engine.calls(), 1);
}

#[tokio::test]
async fn terminal_view_is_byte_stable_across_polls() {
	let harness = Harness::new(vec![ScriptStep::Succeed]);
	harness.start_workers(1);

	let record = harness.service.submit_job(wav("a.wav"), &ProcessingOptions::default()).await.unwrap();
	harness.wait_terminal(&record.job_id).await;

	let first = serde_json::to_value(harness.service.get_job_status(&record.job_id).await.unwrap()).unwrap();
	tokio::time::sleep(Duration::from_millis(30)).await;
	let second = serde_json::to_value(harness.service.get_job_status(&record.job_id).await.unwrap()).unwrap();

	assert_eq!(first, second);
}

#[tokio::test]
async fn transient_failure_retries_then_succeeds() {
	let harness = Harness::new(vec![ScriptStep::FailTransient, ScriptStep::Succeed]);
	harness.start_workers(1);

	let record = harness.service.submit_job(wav("flaky.wav"), &ProcessingOptions::default()).await.unwrap();
	let settled = harness.wait_terminal(&record.job_id).await;

	assert_eq!(settled.status, JobStatus::Success);
	assert_eq!(settled.retries_used, 1);
	assert_eq!(harness.engine.calls(), 2);
}

#[tokio::test]
async fn exhausted_retry_budget_ends_in_failure() {
	// Config::test gives single jobs a budget of 2 retries.
	let harness = Harness::new(vec![ScriptStep::FailTransient, ScriptStep::FailTransient, ScriptStep::FailTransient]);
	harness.start_workers(1);

	let record = harness.service.submit_job(wav("broken.wav"), &ProcessingOptions::default()).await.unwrap();
	let settled = harness.wait_terminal(&record.job_id).await;

	assert_eq!(settled.status, JobStatus::Failure);
	assert_eq!(settled.retries_used, 2);
	assert_eq!(harness.engine.calls(), 3);

	let view = harness.service.get_job_status(&record.job_id).await.unwrap();
	assert_eq!(view.failed, Some(true));
	assert!(view.result.is_none());
	assert!(view.error.is_some());
}

#[tokio::test]
async fn scheduled_retry_lives_in_the_broker() {
	let harness = Harness::new(vec![ScriptStep::FailTransient, ScriptStep::Succeed]);

	let record = harness.service.submit_job(wav("flaky.wav"), &ProcessingOptions::default()).await.unwrap();

	// Drive the executor by hand: the retry must be durable in the broker
	// by the time the outcome is returned, before any ack.
	let delivery = harness.broker.dequeue(Duration::from_millis(100)).await.unwrap().expect("delivery available");
	let outcome = harness.executor.execute(&delivery).await.unwrap();
	assert!(matches!(outcome, ExecOutcome::Retrying { attempt: 1, .. }));
	harness.broker.ack(&delivery).await.unwrap();

	let stored = harness.store.require_job(&record.job_id).await.unwrap();
	assert_eq!(stored.status, JobStatus::Pending);
	assert_eq!(stored.retries_used, 1);

	// The delayed entry surfaces from the broker once the backoff elapses,
	// with no worker-resident timer involved.
	let redelivery = harness.broker.dequeue(Duration::from_millis(500)).await.unwrap().expect("retry promoted after backoff");
	assert_eq!(redelivery.envelope.job_id, record.job_id);
	assert!(!redelivery.envelope.redelivered);
}

#[tokio::test]
async fn store_outage_leaves_delivery_for_reclaim() {
	let mut config = Config::test();
	config.visibility_timeout = Duration::ZERO;
	let (harness, flaky) = Harness::with_flaky_store(vec![ScriptStep::Succeed], config);

	let record = harness.service.submit_job(wav("outage.wav"), &ProcessingOptions::default()).await.unwrap();

	flaky.set_read_outage(true);
	harness.start_workers(1);
	tokio::time::sleep(Duration::from_millis(150)).await;
	flaky.set_read_outage(false);

	// The pickup failed against the store, so the delivery must still be
	// claimable rather than acked away.
	assert_eq!(harness.broker.reclaim().await.unwrap(), 1);

	let settled = harness.wait_terminal(&record.job_id).await;
	assert_eq!(settled.status, JobStatus::Success);
	assert_eq!(settled.retries_used, 0);
	assert_eq!(harness.engine.calls(), 1);
}

#[tokio::test]
async fn in_flight_delivery_survives_reclaim_sweep() {
	let mut config = Config::test();
	config.visibility_timeout = Duration::from_secs(60);
	let harness = Harness::with_config(vec![ScriptStep::Succeed], config);

	harness.engine.hold();
	harness.start_workers(1);

	let record = harness.service.submit_job(wav("long.wav"), &ProcessingOptions::default()).await.unwrap();
	harness.wait_engine_started().await;

	// A sweep while the engine is mid-transcription must not steal the
	// delivery from its live worker.
	assert_eq!(harness.broker.reclaim().await.unwrap(), 0);
	harness.engine.release();

	let settled = harness.wait_terminal(&record.job_id).await;
	assert_eq!(settled.status, JobStatus::Success);
	assert_eq!(settled.retries_used, 0);
	assert_eq!(harness.engine.calls(), 1);
}

#[tokio::test]
async fn oversized_batch_is_rejected_atomically() {
	let harness = Harness::new(vec![]);

	let files: Vec<AudioUpload> = (0..51).map(|i| wav(&format!("file_{i}.wav"))).collect();
	let err = harness.service.submit_batch(files, &ProcessingOptions::default()).await.unwrap_err();

	assert!(matches!(err, JobQueueError::InvalidInput(_)));
	assert!(harness.backend.is_empty());
	assert_eq!(harness.broker.queue_depths().await.unwrap()[0].1, 0);
}

#[tokio::test]
async fn batch_with_non_audio_member_creates_nothing() {
	let harness = Harness::new(vec![]);

	let files = vec![
		wav("ok.wav"),
		AudioUpload {
			filename: "notes.txt".to_string(),
			content_type: "text/plain".to_string(),
			data: vec![0u8; 8],
		},
	];
	let err = harness.service.submit_batch(files, &ProcessingOptions::default()).await.unwrap_err();

	assert!(matches!(err, JobQueueError::InvalidInput(_)));
	assert!(harness.backend.is_empty());
}

#[tokio::test]
async fn batch_completes_with_aggregated_status() {
	let harness = Harness::new(vec![]);
	harness.start_workers(2);

	let files = vec![wav("a.wav"), wav("b.wav"), wav("c.wav")];
	let batch = harness.service.submit_batch(files, &ProcessingOptions::default()).await.unwrap();
	harness.wait_batch_completed(&batch.batch_id).await;

	let view = harness.service.get_batch_status(&batch.batch_id).await.unwrap();
	assert_eq!(view.status, BatchStatus::Completed);
	assert_eq!(view.total_jobs, 3);
	assert_eq!(view.completed_jobs, 3);
	assert_eq!(view.failed_jobs, 0);
	assert!((view.progress_percentage - 100.0).abs() < f64::EPSILON);
	assert!(view.jobs.iter().all(|j| j.status == JobStatus::Success && j.result.is_some()));
}

#[tokio::test]
async fn cancel_before_pickup_prevents_execution() {
	// No workers yet; the delivery sits in the queue while we revoke.
	let harness = Harness::new(vec![ScriptStep::Succeed]);

	let record = harness.service.submit_job(wav("cancel-me.wav"), &ProcessingOptions::default()).await.unwrap();
	let status = harness.service.cancel_job(&record.job_id).await.unwrap();
	assert_eq!(status, JobStatus::Revoked);

	harness.start_workers(1);
	tokio::time::sleep(Duration::from_millis(150)).await;

	let view = harness.service.get_job_status(&record.job_id).await.unwrap();
	assert_eq!(view.status, JobStatus::Revoked);
	assert!(view.ready);
	assert_eq!(view.successful, Some(false));
	assert_eq!(view.failed, Some(false));
	assert!(view.result.is_none());
	assert!(view.error.is_none());

	assert_eq!(harness.engine.calls(), 0);
}

#[tokio::test]
async fn cancel_mid_transcription_settles_revoked_without_retry() {
	let harness = Harness::new(vec![ScriptStep::Succeed]);
	harness.engine.hold();
	harness.start_workers(1);

	let record = harness.service.submit_job(wav("long.wav"), &ProcessingOptions::default()).await.unwrap();
	harness.wait_engine_started().await;

	let status = harness.service.cancel_job(&record.job_id).await.unwrap();
	assert_eq!(status, JobStatus::Revoked);

	// Let the blocked transcribe finish; the revocation flag is observed at
	// the next stage boundary and the result is discarded.
	harness.engine.release();
	tokio::time::sleep(Duration::from_millis(200)).await;

	let settled = harness.store.require_job(&record.job_id).await.unwrap();
	assert_eq!(settled.status, JobStatus::Revoked);
	assert!(settled.result.is_none());
	assert!(settled.error.is_none());
	assert_eq!(settled.retries_used, 0);

	let view = harness.service.get_job_status(&record.job_id).await.unwrap();
	assert_eq!(view.successful, Some(false));
	assert_eq!(view.failed, Some(false));

	// Revocation is terminal: the finished execution neither retried nor
	// re-enqueued anything.
	assert_eq!(harness.broker.queue_depths().await.unwrap()[0].1, 0);
	assert_eq!(harness.engine.calls(), 1);
}

#[tokio::test]
async fn cancel_after_success_is_a_noop() {
	let harness = Harness::new(vec![ScriptStep::Succeed]);
	harness.start_workers(1);

	let record = harness.service.submit_job(wav("done.wav"), &ProcessingOptions::default()).await.unwrap();
	harness.wait_terminal(&record.job_id).await;

	let status = harness.service.cancel_job(&record.job_id).await.unwrap();
	assert_eq!(status, JobStatus::Success);

	let view = harness.service.get_job_status(&record.job_id).await.unwrap();
	assert_eq!(view.status, JobStatus::Success);
	assert!(view.result.is_some());
}

#[tokio::test]
async fn cancel_unknown_job_is_not_found() {
	let harness = Harness::new(vec![]);

	let err = harness.service.cancel_job("missing").await.unwrap_err();
	assert!(matches!(err, JobQueueError::NotFound(_)));
}

#[tokio::test]
async fn lost_worker_redelivery_consumes_one_retry() {
	let mut config = Config::test();
	config.visibility_timeout = Duration::ZERO;
	let harness = Harness::with_config(vec![ScriptStep::Succeed], config);

	let record = harness.service.submit_job(wav("orphan.wav"), &ProcessingOptions::default()).await.unwrap();

	// Take the delivery without acking and mark the record in progress, as
	// a worker that died mid-pipeline would leave things.
	let delivery = harness
		.broker
		.dequeue(harness.config.dequeue_timeout)
		.await
		.unwrap()
		.expect("delivery available");
	let mut in_progress = harness.store.require_job(&record.job_id).await.unwrap();
	in_progress.status = JobStatus::Progress;
	harness.store.save_job(&in_progress).await.unwrap();
	drop(delivery);

	assert_eq!(harness.broker.reclaim().await.unwrap(), 1);

	harness.start_workers(1);
	let settled = harness.wait_terminal(&record.job_id).await;

	assert_eq!(settled.status, JobStatus::Success);
	assert_eq!(settled.retries_used, 1);
	assert_eq!(harness.engine.calls(), 1);
}
