use crate::error::{JobQueueError, Result};
use crate::record::{BatchRecord, JobRecord, JobStatus};
use async_trait::async_trait;
use chrono::Utc;
use redis::{Client, Commands, Connection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
	#[error("redis error: {0}")]
	Redis(#[from] redis::RedisError),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

/// Key-value result store with per-key TTL. The single source of truth for
/// job and batch state. Safe for concurrent multi-reader access; writes are
/// last-write-wins with no compare-and-swap.
#[async_trait]
pub trait ResultStore: Send + Sync {
	async fn put(&self, key: &str, value: String, ttl: Duration) -> std::result::Result<(), StoreError>;

	async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError>;

	async fn delete(&self, key: &str) -> std::result::Result<(), StoreError>;
}

/// Redis-backed result store. Records are stored as JSON blobs under their
/// own key with a fixed expiry set on every write.
pub struct RedisStore {
	conn: Arc<tokio::sync::Mutex<Connection>>,
}

impl RedisStore {
	///
	/// # Errors
	/// Returns an error if the Redis connection cannot be established.
	pub fn connect(redis_url: &str) -> std::result::Result<Self, StoreError> {
		let client = Client::open(redis_url)?;
		let conn = client.get_connection()?;

		Ok(Self {
			conn: Arc::new(tokio::sync::Mutex::new(conn)),
		})
	}
}

#[async_trait]
impl ResultStore for RedisStore {
	async fn put(&self, key: &str, value: String, ttl: Duration) -> std::result::Result<(), StoreError> {
		let mut conn = self.conn.lock().await;
		let _: () = conn.set_ex(key, value, ttl.as_secs())?;
		drop(conn);
		Ok(())
	}

	async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
		let mut conn = self.conn.lock().await;
		let value: Option<String> = conn.get(key)?;
		drop(conn);
		Ok(value)
	}

	async fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
		let mut conn = self.conn.lock().await;
		let _: usize = conn.del(key)?;
		drop(conn);
		Ok(())
	}
}

/// In-process result store with lazy TTL expiry, for tests and local runs.
#[derive(Default)]
pub struct MemoryStore {
	entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Number of live (non-expired) entries.
	#[must_use]
	pub fn len(&self) -> usize {
		let now = Instant::now();
		let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
		entries.retain(|_, (_, expires_at)| *expires_at > now);
		entries.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[async_trait]
impl ResultStore for MemoryStore {
	async fn put(&self, key: &str, value: String, ttl: Duration) -> std::result::Result<(), StoreError> {
		let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
		entries.insert(key.to_string(), (value, Instant::now() + ttl));
		Ok(())
	}

	async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
		let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
		match entries.get(key) {
			Some((_, expires_at)) if *expires_at <= Instant::now() => {
				entries.remove(key);
				Ok(None)
			}
			Some((value, _)) => Ok(Some(value.clone())),
			None => Ok(None),
		}
	}

	async fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
		let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
		entries.remove(key);
		Ok(())
	}
}

fn revoke_key(job_id: &str) -> String {
	format!("revoke:{job_id}")
}

/// Typed access to job/batch records over the raw key-value port.
///
/// Every write refreshes the record's TTL; the retention window counts from
/// the last write, reads never extend it.
#[derive(Clone)]
pub struct JobStore {
	store: Arc<dyn ResultStore>,
	ttl: Duration,
}

impl JobStore {
	#[must_use]
	pub fn new(store: Arc<dyn ResultStore>, ttl: Duration) -> Self {
		Self { store, ttl }
	}

	pub async fn save_job(&self, record: &JobRecord) -> Result<()> {
		let serialized = serde_json::to_string(record)?;
		self.store.put(&JobRecord::key(&record.job_id), serialized, self.ttl).await?;
		Ok(())
	}

	pub async fn load_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
		let Some(serialized) = self.store.get(&JobRecord::key(job_id)).await? else {
			return Ok(None);
		};
		Ok(Some(serde_json::from_str(&serialized)?))
	}

	/// Load a job record, failing fast with `NotFound` when the store has no
	/// entry. Post-TTL expiry is indistinguishable from never-existed.
	pub async fn require_job(&self, job_id: &str) -> Result<JobRecord> {
		self.load_job(job_id).await?.ok_or_else(|| JobQueueError::NotFound(format!("job {job_id}")))
	}

	pub async fn save_batch(&self, record: &BatchRecord) -> Result<()> {
		let serialized = serde_json::to_string(record)?;
		self.store.put(&BatchRecord::key(&record.batch_id), serialized, self.ttl).await?;
		Ok(())
	}

	pub async fn require_batch(&self, batch_id: &str) -> Result<BatchRecord> {
		let Some(serialized) = self.store.get(&BatchRecord::key(batch_id)).await? else {
			return Err(JobQueueError::NotFound(format!("batch {batch_id}")));
		};
		Ok(serde_json::from_str(&serialized)?)
	}

	/// Set the out-of-band revocation flag for a job.
	pub async fn mark_revoked(&self, job_id: &str) -> Result<()> {
		self.store.put(&revoke_key(job_id), "1".to_string(), self.ttl).await?;
		Ok(())
	}

	pub async fn is_revoked(&self, job_id: &str) -> Result<bool> {
		Ok(self.store.get(&revoke_key(job_id)).await?.is_some())
	}

	/// Write a terminal record, unless the job was revoked in the meantime.
	///
	/// The store is last-write-wins, so a revocation racing with an executor
	/// write cannot be excluded entirely; re-reading the stored status plus
	/// the revocation flag here closes the window for any executor that has
	/// not yet issued its final write. A zombie execution that lost the race
	/// earlier finds the flag set and drops its result.
	pub async fn finalize(&self, mut record: JobRecord) -> Result<JobRecord> {
		if self.is_revoked(&record.job_id).await? {
			return self.require_job(&record.job_id).await;
		}

		if let Some(stored) = self.load_job(&record.job_id).await? {
			if stored.status == JobStatus::Revoked {
				return Ok(stored);
			}
		}

		record.completed_at = Some(Utc::now());
		self.save_job(&record).await?;
		Ok(record)
	}
}
