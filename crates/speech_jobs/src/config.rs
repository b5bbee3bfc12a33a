use clap::Parser;
use std::time::Duration;

#[derive(Parser, Clone, Debug)]
#[command(name = "speech-jobs")]
#[command(about = "Audio analysis job orchestration", long_about = None)]
pub struct Config {
	#[arg(long, env = "JOB_QUEUE_KEY", default_value = "speech:jobs", help = "Broker queue key for audio processing jobs")]
	pub queue_key: String,

	#[arg(long, env = "MAX_RETRIES", default_value = "3", help = "Retry budget for single-job submissions")]
	pub max_retries: u32,

	#[arg(long, env = "BATCH_MAX_RETRIES", default_value = "2", help = "Retry budget for batch member jobs")]
	pub batch_max_retries: u32,

	#[arg(
		long = "retry-base-delay-secs",
		env = "RETRY_BASE_DELAY_SECS",
		default_value = "60",
		value_parser = parse_duration,
		help = "Base delay for exponential retry backoff in seconds"
	)]
	pub retry_base_delay: Duration,

	#[arg(
		long = "result-ttl-secs",
		env = "RESULT_TTL_SECS",
		default_value = "3600",
		value_parser = parse_duration,
		help = "Retention window for job and batch records in seconds"
	)]
	pub result_ttl: Duration,

	#[arg(long, env = "MAX_BATCH_SIZE", default_value = "50", help = "Hard cap on batch submission size")]
	pub max_batch_size: usize,

	#[arg(
		long,
		env = "DEQUEUE_TIMEOUT_SECS",
		default_value = "5",
		value_parser = parse_duration,
		help = "Blocking dequeue timeout per worker poll in seconds"
	)]
	pub dequeue_timeout: Duration,

	#[arg(long, env = "NUM_WORKERS", default_value = "4", help = "Number of concurrent workers in the pool")]
	pub num_workers: usize,

	#[arg(
		long,
		env = "VISIBILITY_TIMEOUT_SECS",
		default_value = "3600",
		value_parser = parse_duration,
		help = "How long a dequeued delivery stays claimed before reclaim may requeue it"
	)]
	pub visibility_timeout: Duration,
}

impl Config {
	/// Validate configuration values
	pub fn validate(&self) -> Result<(), String> {
		if self.queue_key.is_empty() {
			return Err("queue_key must not be empty".to_string());
		}

		if self.result_ttl.is_zero() {
			return Err("result_ttl must be greater than 0".to_string());
		}

		if self.max_batch_size == 0 {
			return Err("max_batch_size must be greater than 0".to_string());
		}

		if self.num_workers == 0 {
			return Err("num_workers must be at least 1".to_string());
		}

		if self.visibility_timeout.is_zero() {
			return Err("visibility_timeout must be greater than 0".to_string());
		}

		Ok(())
	}

	#[must_use]
	pub fn test() -> Self {
		Self {
			queue_key: "speech:jobs:test".to_string(),
			max_retries: 2,
			batch_max_retries: 1,
			retry_base_delay: Duration::from_millis(20),
			result_ttl: Duration::from_secs(60),
			max_batch_size: 50,
			dequeue_timeout: Duration::from_millis(50),
			num_workers: 2,
			visibility_timeout: Duration::from_millis(200),
		}
	}
}

fn parse_duration(s: &str) -> Result<Duration, std::num::ParseIntError> {
	s.parse::<u64>().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_duration() {
		assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
		assert!(parse_duration("invalid").is_err());
	}

	#[test]
	fn test_config_parser() {
		let args = vec![
			"program",
			"--queue-key",
			"speech:custom",
			"--max-retries",
			"5",
			"--batch-max-retries",
			"1",
			"--retry-base-delay-secs",
			"120",
			"--result-ttl-secs",
			"7200",
			"--max-batch-size",
			"20",
		];

		let config = Config::try_parse_from(args).unwrap();
		assert_eq!(config.queue_key, "speech:custom");
		assert_eq!(config.max_retries, 5);
		assert_eq!(config.batch_max_retries, 1);
		assert_eq!(config.retry_base_delay, Duration::from_secs(120));
		assert_eq!(config.result_ttl, Duration::from_secs(7200));
		assert_eq!(config.max_batch_size, 20);
	}

	#[test]
	fn test_validate_rejects_zero_workers() {
		let mut config = Config::test();
		config.num_workers = 0;
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_validate_rejects_zero_visibility_timeout() {
		let mut config = Config::test();
		config.visibility_timeout = Duration::ZERO;
		assert!(config.validate().is_err());
	}
}
