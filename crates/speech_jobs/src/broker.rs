use crate::record::ProcessingOptions;
use async_trait::async_trait;
use redis::{cmd, Client, Commands, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
	#[error("redis error: {0}")]
	Redis(#[from] redis::RedisError),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

/// The unit of work travelling through the broker. Carries the raw audio
/// payload so workers need nothing beyond the delivery itself to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
	pub job_id: String,
	pub filename: String,
	pub audio: Vec<u8>,
	pub options: ProcessingOptions,
	/// Set by the broker when this delivery was recovered from a lost
	/// worker. Redelivery counts against the job's retry budget exactly
	/// like an execution failure.
	#[serde(default)]
	pub redelivered: bool,
}

/// One in-flight delivery. Must be acknowledged once the job has settled;
/// unacknowledged deliveries are redelivered once their claim outlives the
/// broker's visibility timeout.
#[derive(Debug, Clone)]
pub struct Delivery {
	pub queue: String,
	pub envelope: Envelope,
	token: String,
}

/// Durable multi-queue transport with at-least-once delivery. The broker
/// service itself is an external dependency; these are client bindings.
#[async_trait]
pub trait Broker: Send + Sync {
	async fn enqueue(&self, queue: &str, envelope: &Envelope) -> Result<(), BrokerError>;

	/// Enqueue an envelope that becomes visible to `dequeue` only after
	/// `delay` has elapsed. The entry is persisted immediately; no in-process
	/// timer is involved.
	async fn enqueue_delayed(&self, queue: &str, envelope: &Envelope, delay: Duration) -> Result<(), BrokerError>;

	/// Blocking pop across all configured queues. Returns `None` on timeout.
	async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

	async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

	/// Maintenance sweep: promote delayed entries whose time has come, and
	/// requeue deliveries whose claim outlived the visibility timeout,
	/// flagged as redelivered. Deliveries still inside their visibility
	/// window are left with their worker. Returns the number of deliveries
	/// requeued as lost.
	async fn reclaim(&self) -> Result<usize, BrokerError>;

	async fn queue_depths(&self) -> Result<Vec<(String, usize)>, BrokerError>;
}

fn processing_key(queue: &str) -> String {
	format!("{queue}:processing")
}

fn claims_key(queue: &str) -> String {
	format!("{queue}:claims")
}

fn delayed_key(queue: &str) -> String {
	format!("{queue}:delayed")
}

fn epoch_secs() -> f64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map_or(0.0, |d| d.as_secs_f64())
}

/// Redis list-backed broker client. Jobs are RPUSHed as JSON; dequeue uses
/// BLMOVE into a per-queue processing list and stamps a claim time in a
/// companion ZSET, so `reclaim` only touches deliveries whose claim has
/// outlived the visibility timeout. Delayed entries live in a second ZSET
/// scored by ready time and are promoted on dequeue and on reclaim.
pub struct RedisBroker {
	conn: Arc<tokio::sync::Mutex<Connection>>,
	queues: Vec<String>,
	visibility_timeout: Duration,
}

impl RedisBroker {
	///
	/// # Errors
	/// Returns an error if the Redis connection cannot be established.
	pub fn connect(redis_url: &str, queues: Vec<String>, visibility_timeout: Duration) -> Result<Self, BrokerError> {
		let client = Client::open(redis_url)?;
		let conn = client.get_connection()?;

		Ok(Self {
			conn: Arc::new(tokio::sync::Mutex::new(conn)),
			queues,
			visibility_timeout,
		})
	}

	fn promote_due(conn: &mut Connection, queue: &str) -> Result<(), BrokerError> {
		let due: Vec<String> = conn.zrangebyscore(delayed_key(queue), "-inf", epoch_secs())?;

		for serialized in due {
			let removed: usize = conn.zrem(delayed_key(queue), &serialized)?;
			// Another consumer may have promoted it between the range read
			// and the removal; only the one that removed it pushes.
			if removed == 1 {
				let _: usize = conn.rpush(queue, &serialized)?;
			}
		}

		Ok(())
	}
}

#[async_trait]
impl Broker for RedisBroker {
	async fn enqueue(&self, queue: &str, envelope: &Envelope) -> Result<(), BrokerError> {
		let serialized = serde_json::to_string(envelope)?;
		let mut conn = self.conn.lock().await;
		let _: usize = conn.rpush(queue, serialized)?;
		drop(conn);
		Ok(())
	}

	async fn enqueue_delayed(&self, queue: &str, envelope: &Envelope, delay: Duration) -> Result<(), BrokerError> {
		let serialized = serde_json::to_string(envelope)?;
		let ready_at = epoch_secs() + delay.as_secs_f64();
		let mut conn = self.conn.lock().await;
		let _: usize = conn.zadd(delayed_key(queue), serialized, ready_at)?;
		drop(conn);
		Ok(())
	}

	async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
		// BLMOVE takes one source key, so the wait is split across queues.
		let per_queue = (timeout.as_secs_f64() / self.queues.len() as f64).max(0.1);
		let mut conn = self.conn.lock().await;

		for queue in &self.queues {
			Self::promote_due(&mut conn, queue)?;

			let moved: Option<String> = cmd("BLMOVE")
				.arg(queue)
				.arg(processing_key(queue))
				.arg("LEFT")
				.arg("RIGHT")
				.arg(per_queue)
				.query(&mut *conn)?;

			if let Some(serialized) = moved {
				let _: usize = conn.zadd(claims_key(queue), &serialized, epoch_secs())?;
				let envelope: Envelope = serde_json::from_str(&serialized)?;
				drop(conn);
				return Ok(Some(Delivery {
					queue: queue.clone(),
					envelope,
					token: serialized,
				}));
			}
		}

		drop(conn);
		Ok(None)
	}

	async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
		let mut conn = self.conn.lock().await;
		let _: usize = conn.lrem(processing_key(&delivery.queue), 1, &delivery.token)?;
		let _: usize = conn.zrem(claims_key(&delivery.queue), &delivery.token)?;
		drop(conn);
		Ok(())
	}

	async fn reclaim(&self) -> Result<usize, BrokerError> {
		let mut recovered = 0;
		let expired_before = epoch_secs() - self.visibility_timeout.as_secs_f64();
		let mut conn = self.conn.lock().await;

		for queue in &self.queues {
			Self::promote_due(&mut conn, queue)?;

			let expired: Vec<String> = conn.zrangebyscore(claims_key(queue), "-inf", expired_before)?;

			for serialized in expired {
				let _: usize = conn.zrem(claims_key(queue), &serialized)?;
				let removed: usize = conn.lrem(processing_key(queue), 1, &serialized)?;
				// A stale claim whose processing entry is already gone was
				// acked concurrently; nothing to requeue.
				if removed == 1 {
					let mut envelope: Envelope = serde_json::from_str(&serialized)?;
					envelope.redelivered = true;
					let reserialized = serde_json::to_string(&envelope)?;
					let _: usize = conn.rpush(queue, reserialized)?;
					recovered += 1;
				}
			}
		}

		drop(conn);
		Ok(recovered)
	}

	async fn queue_depths(&self) -> Result<Vec<(String, usize)>, BrokerError> {
		let mut depths = Vec::with_capacity(self.queues.len());
		let mut conn = self.conn.lock().await;

		for queue in &self.queues {
			let len: usize = conn.llen(queue)?;
			depths.push((queue.clone(), len));
		}

		drop(conn);
		Ok(depths)
	}
}

struct InflightEntry {
	queue: String,
	envelope: Envelope,
	claimed_at: Instant,
}

struct DelayedEntry {
	queue: String,
	envelope: Envelope,
	ready_at: Instant,
}

#[derive(Default)]
struct MemoryState {
	ready: HashMap<String, VecDeque<Envelope>>,
	inflight: HashMap<String, InflightEntry>,
	delayed: Vec<DelayedEntry>,
}

/// In-process broker for tests and local runs. Mirrors the at-least-once
/// contract: dequeued envelopes stay in-flight until acked, `reclaim`
/// requeues only those whose claim outlived the visibility timeout, and
/// delayed entries are promoted once their ready time passes.
pub struct MemoryBroker {
	queues: Vec<String>,
	visibility_timeout: Duration,
	state: Mutex<MemoryState>,
	next_token: AtomicU64,
}

impl MemoryBroker {
	#[must_use]
	pub fn new(queues: Vec<String>, visibility_timeout: Duration) -> Self {
		Self {
			queues,
			visibility_timeout,
			state: Mutex::new(MemoryState::default()),
			next_token: AtomicU64::new(0),
		}
	}

	fn promote_due(state: &mut MemoryState) {
		let now = Instant::now();
		let mut remaining = Vec::with_capacity(state.delayed.len());

		for entry in state.delayed.drain(..) {
			if entry.ready_at <= now {
				state.ready.entry(entry.queue).or_default().push_back(entry.envelope);
			} else {
				remaining.push(entry);
			}
		}

		state.delayed = remaining;
	}

	fn try_pop(&self) -> Option<Delivery> {
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		Self::promote_due(&mut state);

		for queue in &self.queues {
			if let Some(envelope) = state.ready.get_mut(queue).and_then(VecDeque::pop_front) {
				let token = self.next_token.fetch_add(1, Ordering::Relaxed).to_string();
				state.inflight.insert(
					token.clone(),
					InflightEntry {
						queue: queue.clone(),
						envelope: envelope.clone(),
						claimed_at: Instant::now(),
					},
				);
				return Some(Delivery {
					queue: queue.clone(),
					envelope,
					token,
				});
			}
		}

		None
	}
}

#[async_trait]
impl Broker for MemoryBroker {
	async fn enqueue(&self, queue: &str, envelope: &Envelope) -> Result<(), BrokerError> {
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		state.ready.entry(queue.to_string()).or_default().push_back(envelope.clone());
		Ok(())
	}

	async fn enqueue_delayed(&self, queue: &str, envelope: &Envelope, delay: Duration) -> Result<(), BrokerError> {
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		state.delayed.push(DelayedEntry {
			queue: queue.to_string(),
			envelope: envelope.clone(),
			ready_at: Instant::now() + delay,
		});
		Ok(())
	}

	async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
		let deadline = Instant::now() + timeout;

		loop {
			if let Some(delivery) = self.try_pop() {
				return Ok(Some(delivery));
			}

			if Instant::now() >= deadline {
				return Ok(None);
			}

			// Small delay to prevent tight polling
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	}

	async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		state.inflight.remove(&delivery.token);
		Ok(())
	}

	async fn reclaim(&self) -> Result<usize, BrokerError> {
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		Self::promote_due(&mut state);

		let now = Instant::now();
		let visibility = self.visibility_timeout;
		let expired: Vec<String> = state
			.inflight
			.iter()
			.filter(|(_, entry)| now.duration_since(entry.claimed_at) >= visibility)
			.map(|(token, _)| token.clone())
			.collect();
		let recovered = expired.len();

		for token in expired {
			if let Some(mut entry) = state.inflight.remove(&token) {
				entry.envelope.redelivered = true;
				state.ready.entry(entry.queue).or_default().push_back(entry.envelope);
			}
		}

		Ok(recovered)
	}

	async fn queue_depths(&self) -> Result<Vec<(String, usize)>, BrokerError> {
		let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		Ok(
			self
				.queues
				.iter()
				.map(|queue| (queue.clone(), state.ready.get(queue).map_or(0, VecDeque::len)))
				.collect(),
		)
	}
}
