mod engine;

use anyhow::Result;
use clap::Parser;
use engine::CliEngineFactory;
use prometheus::Registry;
use speech_jobs::broker::RedisBroker;
use speech_jobs::engine::EngineRegistry;
use speech_jobs::store::RedisStore;
use speech_jobs::worker::{ActiveJobs, WorkerMetrics, WorkerPool};
use speech_jobs::{Broker, Config, JobExecutor, JobStore, ResultStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const REDIS_MAX_RETRIES: u32 = 5;
const REDIS_INITIAL_BACKOFF_MS: u64 = 500;
const SHUTDOWN_GRACE_PERIOD_MS: u64 = 200;

#[derive(Parser, Clone, Debug)]
#[command(name = "speech-worker")]
#[command(about = "Worker daemon for audio analysis jobs", long_about = None)]
struct AppConfig {
	#[command(flatten)]
	core: Config,

	#[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379", help = "Redis connection URL for store and broker")]
	redis_url: String,

	#[arg(long, env = "ENGINE_COMMAND", default_value = "whisper-cli", help = "Transcriber binary invoked per audio file")]
	engine_command: String,

	#[arg(
		long,
		env = "ENGINE_VARIANTS",
		default_value = "tiny,base,small,medium",
		value_delimiter = ',',
		help = "Model variants this worker accepts"
	)]
	engine_variants: Vec<String>,

	#[arg(long, env = "RECLAIM_INTERVAL_SECS", default_value = "30", help = "Seconds between lost-delivery reclaim sweeps")]
	reclaim_interval_secs: u64,
}

impl AppConfig {
	fn validate(&self) -> Result<(), String> {
		self.core.validate()?;

		if self.engine_command.is_empty() {
			return Err("engine_command must not be empty".to_string());
		}

		if self.engine_variants.is_empty() {
			return Err("engine_variants must name at least one variant".to_string());
		}

		if self.reclaim_interval_secs == 0 {
			return Err("reclaim_interval_secs must be greater than 0".to_string());
		}

		Ok(())
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	dotenvy::dotenv().ok();

	let config = AppConfig::parse();
	config.validate().map_err(|e| anyhow::anyhow!(e))?;

	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
		.init();

	info!(
		queue = %config.core.queue_key,
		num_workers = config.core.num_workers,
		engine = %config.engine_command,
		"starting speech worker"
	);

	let store_backend = connect_with_retry("result store", || RedisStore::connect(&config.redis_url)).await?;
	let broker = connect_with_retry("broker", || {
		RedisBroker::connect(&config.redis_url, vec![config.core.queue_key.clone()], config.core.visibility_timeout)
	})
	.await?;
	let broker: Arc<dyn Broker> = Arc::new(broker);

	let store = JobStore::new(Arc::new(store_backend) as Arc<dyn ResultStore>, config.core.result_ttl);
	let engines = Arc::new(EngineRegistry::new(Arc::new(CliEngineFactory::new(
		config.engine_command.clone(),
		config.engine_variants.clone(),
	))));
	let executor = Arc::new(JobExecutor::new(store, Arc::clone(&broker), engines, config.core.retry_base_delay));

	let registry = Registry::new();
	let metrics = WorkerMetrics::new(&registry)?;
	let pool = WorkerPool::new(Arc::clone(&executor), Arc::clone(&broker), metrics, ActiveJobs::new(), config.core.dequeue_timeout);

	let cancellation_token = CancellationToken::new();
	let handles = pool.spawn(config.core.num_workers, cancellation_token.clone());

	run_with_shutdown(broker, Duration::from_secs(config.reclaim_interval_secs), handles, cancellation_token).await
}

/// Run the reclaim supervisor until a shutdown signal arrives, then stop
/// the workers and give in-flight jobs a moment to settle.
async fn run_with_shutdown(
	broker: Arc<dyn Broker>,
	reclaim_interval: Duration,
	handles: Vec<tokio::task::JoinHandle<()>>,
	cancellation_token: CancellationToken,
) -> Result<()> {
	tokio::select! {
		() = reclaim_loop(broker, reclaim_interval) => {
			error!("reclaim loop exited unexpectedly");
			Ok(())
		}
		() = wait_for_shutdown_signal() => {
			info!("shutdown signal received");
			cancellation_token.cancel();

			tokio::time::sleep(Duration::from_millis(SHUTDOWN_GRACE_PERIOD_MS)).await;

			for handle in handles {
				if let Err(e) = handle.await {
					warn!(error = %e, "worker task did not shut down cleanly");
				}
			}

			info!("all workers stopped");
			Ok(())
		}
	}
}

/// Periodic maintenance sweep: promotes retry entries whose backoff has
/// elapsed and requeues deliveries whose claim outlived the visibility
/// timeout. Deliveries held by live workers are left untouched.
async fn reclaim_loop(broker: Arc<dyn Broker>, interval: Duration) {
	let mut ticker = tokio::time::interval(interval);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

	loop {
		ticker.tick().await;
		match broker.reclaim().await {
			Ok(0) => {}
			Ok(recovered) => info!(recovered, "requeued lost deliveries"),
			Err(e) => warn!(error = %e, "reclaim sweep failed"),
		}
	}
}

async fn wait_for_shutdown_signal() {
	let ctrl_c = async {
		signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
	};

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
}

async fn connect_with_retry<T, E, F>(what: &str, mut connect: F) -> Result<T>
where
	F: FnMut() -> std::result::Result<T, E>,
	E: std::error::Error + Send + Sync + 'static,
{
	for attempt in 1..=REDIS_MAX_RETRIES {
		match connect() {
			Ok(connected) => {
				info!(what, "connected to redis");
				return Ok(connected);
			}
			Err(e) => {
				if attempt == REDIS_MAX_RETRIES {
					error!(what, error = %e, "failed to connect after {} attempts", REDIS_MAX_RETRIES);
					return Err(e.into());
				}

				let backoff = REDIS_INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
				warn!(what, attempt, backoff_ms = backoff, error = %e, "redis connection failed, retrying");
				tokio::time::sleep(Duration::from_millis(backoff)).await;
			}
		}
	}

	unreachable!()
}
