use crate::broker::BrokerError;
use crate::engine::EngineError;
use crate::store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, JobQueueError>;

/// Error taxonomy for the orchestration core.
///
/// `InvalidInput` and `NotFound` are surfaced to the caller and never
/// retried. `Engine` and `TransientInfra` are retried by the executor up to
/// the job's retry budget, then finalized as a FAILURE record.
#[derive(Error, Debug)]
pub enum JobQueueError {
	#[error("invalid input: {0}")]
	InvalidInput(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("engine error: {0}")]
	Engine(#[from] EngineError),

	#[error("transient infrastructure error: {0}")]
	TransientInfra(String),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("metrics error: {0}")]
	Metrics(#[from] prometheus::Error),

	#[error("job was revoked")]
	Revoked,
}

impl JobQueueError {
	/// Whether the executor may consume a retry attempt for this error.
	#[must_use]
	pub const fn is_retryable(&self) -> bool {
		matches!(self, Self::Engine(_) | Self::TransientInfra(_))
	}
}

impl From<StoreError> for JobQueueError {
	fn from(error: StoreError) -> Self {
		Self::TransientInfra(format!("result store: {error}"))
	}
}

impl From<BrokerError> for JobQueueError {
	fn from(error: BrokerError) -> Self {
		Self::TransientInfra(format!("broker: {error}"))
	}
}

impl From<std::io::Error> for JobQueueError {
	fn from(error: std::io::Error) -> Self {
		Self::TransientInfra(format!("io: {error}"))
	}
}

impl From<tokio::task::JoinError> for JobQueueError {
	fn from(error: tokio::task::JoinError) -> Self {
		Self::TransientInfra(format!("worker task: {error}"))
	}
}
