use serde::Deserialize;
use speech_jobs::engine::{EngineError, EngineFactory, Segment, SpeechEngine, TranscriptOutput};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info};

/// Stdout shape of the transcriber CLI in `--output-format json` mode.
#[derive(Debug, Deserialize)]
struct CliTranscript {
	text: String,
	#[serde(default = "default_language")]
	language: String,
	#[serde(default)]
	segments: Vec<CliSegment>,
}

#[derive(Debug, Deserialize)]
struct CliSegment {
	start: f64,
	end: f64,
	text: String,
	#[serde(default)]
	avg_logprob: f64,
}

fn default_language() -> String {
	"en".to_string()
}

/// Engine backed by an external transcriber binary invoked per file.
pub struct CliEngine {
	command: String,
	variant: String,
}

impl SpeechEngine for CliEngine {
	fn transcribe(&self, audio: &Path) -> Result<TranscriptOutput, EngineError> {
		debug!(command = %self.command, variant = %self.variant, path = %audio.display(), "invoking transcriber");

		let output = Command::new(&self.command)
			.arg("--model")
			.arg(&self.variant)
			.arg("--output-format")
			.arg("json")
			.arg(audio)
			.output()
			.map_err(|e| EngineError::Inference(format!("failed to launch {}: {e}", self.command)))?;

		if !output.status.success() {
			let stderr = String::from_utf8_lossy(&output.stderr);
			return Err(EngineError::Inference(format!("transcriber exited with {}: {}", output.status, stderr.trim())));
		}

		let transcript: CliTranscript = serde_json::from_slice(&output.stdout).map_err(|e| EngineError::Inference(format!("unparseable transcriber output: {e}")))?;

		Ok(TranscriptOutput {
			text: transcript.text,
			language: transcript.language,
			segments: transcript
				.segments
				.into_iter()
				.map(|s| Segment {
					start: s.start,
					end: s.end,
					text: s.text,
					avg_logprob: s.avg_logprob,
				})
				.collect(),
		})
	}
}

/// Builds one [`CliEngine`] per allowed model variant. The registry caches
/// the result, so each variant is constructed at most once per process.
pub struct CliEngineFactory {
	command: String,
	allowed_variants: Vec<String>,
}

impl CliEngineFactory {
	#[must_use]
	pub const fn new(command: String, allowed_variants: Vec<String>) -> Self {
		Self { command, allowed_variants }
	}
}

impl EngineFactory for CliEngineFactory {
	fn load(&self, variant: &str) -> Result<Arc<dyn SpeechEngine>, EngineError> {
		if !self.allowed_variants.iter().any(|v| v == variant) {
			return Err(EngineError::UnsupportedVariant(variant.to_string()));
		}

		info!(variant, command = %self.command, "engine variant ready");
		Ok(Arc::new(CliEngine {
			command: self.command.clone(),
			variant: variant.to_string(),
		}))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_factory_rejects_unknown_variant() {
		let factory = CliEngineFactory::new("transcriber".to_string(), vec!["base".to_string(), "small".to_string()]);
		assert!(matches!(factory.load("large-v3"), Err(EngineError::UnsupportedVariant(_))));
		assert!(factory.load("base").is_ok());
	}

	#[test]
	fn test_cli_transcript_parses_minimal_output() {
		let raw = r#"{"text": "hello there", "segments": [{"start": 0.0, "end": 1.5, "text": "hello there"}]}"#;
		let transcript: CliTranscript = serde_json::from_str(raw).unwrap();
		assert_eq!(transcript.text, "hello there");
		assert_eq!(transcript.language, "en");
		assert_eq!(transcript.segments.len(), 1);
		assert!((transcript.segments[0].avg_logprob - 0.0).abs() < f64::EPSILON);
	}
}
