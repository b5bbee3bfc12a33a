use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
	#[error("unsupported model variant: {0}")]
	UnsupportedVariant(String),

	#[error("malformed audio: {0}")]
	MalformedAudio(String),

	#[error("inference failed: {0}")]
	Inference(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
	pub start: f64,
	pub end: f64,
	pub text: String,
	pub avg_logprob: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptOutput {
	pub text: String,
	pub language: String,
	pub segments: Vec<Segment>,
}

/// The speech-to-text capability. Synchronous and blocking from the
/// caller's perspective; the executor moves the call onto a blocking
/// thread. Implementations are shared read-mostly across workers and must
/// not mutate per-job state.
pub trait SpeechEngine: Send + Sync {
	///
	/// # Errors
	/// Fails with `EngineError` on malformed audio or inference failure.
	fn transcribe(&self, audio: &Path) -> Result<TranscriptOutput, EngineError>;
}

/// Loads an engine instance for a model variant. Called at most once per
/// variant by the registry.
pub trait EngineFactory: Send + Sync {
	///
	/// # Errors
	/// Fails with `UnsupportedVariant` for unknown variants, or with the
	/// loader's own error if the model cannot be brought up.
	fn load(&self, variant: &str) -> Result<Arc<dyn SpeechEngine>, EngineError>;
}

/// Lazily-populated engine cache keyed by model variant: load once, reuse
/// many. Each variant has its own init cell so loading one model never
/// blocks resolution of an already-loaded one.
pub struct EngineRegistry {
	factory: Arc<dyn EngineFactory>,
	cells: Mutex<HashMap<String, Arc<OnceCell<Arc<dyn SpeechEngine>>>>>,
}

impl EngineRegistry {
	#[must_use]
	pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
		Self {
			factory,
			cells: Mutex::new(HashMap::new()),
		}
	}

	///
	/// # Errors
	/// Propagates the factory error; a failed load leaves the cell empty so
	/// a later attempt can retry.
	pub fn resolve(&self, variant: &str) -> Result<Arc<dyn SpeechEngine>, EngineError> {
		let cell = {
			let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
			Arc::clone(cells.entry(variant.to_string()).or_default())
		};

		cell.get_or_try_init(|| self.factory.load(variant)).cloned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	struct NullEngine;

	impl SpeechEngine for NullEngine {
		fn transcribe(&self, _audio: &Path) -> Result<TranscriptOutput, EngineError> {
			Ok(TranscriptOutput {
				text: String::new(),
				language: "en".to_string(),
				segments: Vec::new(),
			})
		}
	}

	#[derive(Default)]
	struct CountingFactory {
		loads: AtomicU32,
	}

	impl EngineFactory for CountingFactory {
		fn load(&self, variant: &str) -> Result<Arc<dyn SpeechEngine>, EngineError> {
			if variant == "bogus" {
				return Err(EngineError::UnsupportedVariant(variant.to_string()));
			}
			self.loads.fetch_add(1, Ordering::Relaxed);
			Ok(Arc::new(NullEngine))
		}
	}

	#[test]
	fn test_registry_loads_each_variant_once() {
		let factory = Arc::new(CountingFactory::default());
		let registry = EngineRegistry::new(Arc::clone(&factory) as Arc<dyn EngineFactory>);

		registry.resolve("base").unwrap();
		registry.resolve("base").unwrap();
		registry.resolve("small").unwrap();

		assert_eq!(factory.loads.load(Ordering::Relaxed), 2);
	}

	#[test]
	fn test_registry_surfaces_unsupported_variant() {
		let registry = EngineRegistry::new(Arc::new(CountingFactory::default()));

		assert!(matches!(registry.resolve("bogus"), Err(EngineError::UnsupportedVariant(_))));
	}
}
