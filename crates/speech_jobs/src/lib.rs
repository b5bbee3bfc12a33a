//! Job orchestration for asynchronous speech analysis.
//!
//! Audio uploads become durable job records executed by a pool of workers:
//! each job runs a fixed five-stage pipeline (resolve model, persist audio,
//! transcribe, analyze, finalize) with staged progress reporting, bounded
//! retries with exponential backoff, cooperative cancellation, and batch
//! submission with aggregated status. Redis backs both the result store and
//! the work queue in production; in-memory implementations of the same ports
//! back the tests.

pub mod analysis;
pub mod batch;
pub mod broker;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod progress;
pub mod record;
pub mod service;
pub mod status;
pub mod store;
pub mod worker;

pub use broker::{Broker, Delivery, Envelope, MemoryBroker, RedisBroker};
pub use config::Config;
pub use engine::{EngineError, EngineFactory, EngineRegistry, Segment, SpeechEngine, TranscriptOutput};
pub use error::{JobQueueError, Result};
pub use executor::{ExecOutcome, JobExecutor};
pub use record::{AudioUpload, BatchRecord, JobRecord, JobStatus, ProcessingOptions, TranscriptReport};
pub use service::{JobService, QueueStats};
pub use status::{BatchView, JobView};
pub use store::{JobStore, MemoryStore, RedisStore, ResultStore};
pub use worker::{ActiveJobs, WorkerMetrics, WorkerPool};
