//! Pure speech metrics over transcript segments: reading speed, pauses,
//! fluency, and transcript-vs-expected similarity. No state, no
//! concurrency; everything here is deterministic over its inputs.

use crate::engine::Segment;

/// Inter-segment gap above which a pause is counted.
pub const PAUSE_THRESHOLD_SECS: f64 = 0.5;

const WPM_WEIGHT: f64 = 0.7;
const PAUSE_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeechMetrics {
	pub word_count: u32,
	pub duration: f64,
	pub pause_count: u32,
	pub words_per_minute: f64,
	pub fluency_score: f64,
}

/// Derive reading metrics from transcript segments.
///
/// Duration is the max of all segment end times; a pause is any gap between
/// consecutive segments exceeding [`PAUSE_THRESHOLD_SECS`]. Every division
/// is guarded against a zero denominator.
#[must_use]
pub fn analyze_segments(segments: &[Segment], expected_wpm: f64) -> SpeechMetrics {
	let mut word_count: u32 = 0;
	let mut duration: f64 = 0.0;
	let mut pause_count: u32 = 0;

	for (i, segment) in segments.iter().enumerate() {
		word_count += segment.text.split_whitespace().count() as u32;
		duration = duration.max(segment.end);

		if i > 0 && segment.start - segments[i - 1].end > PAUSE_THRESHOLD_SECS {
			pause_count += 1;
		}
	}

	let words_per_minute = if duration > 0.0 { f64::from(word_count) / duration * 60.0 } else { 0.0 };

	let wpm_score = if expected_wpm > 0.0 { (words_per_minute / expected_wpm).min(1.0) } else { 0.0 };
	let pause_penalty = if word_count > 0 {
		(1.0 - f64::from(pause_count) / f64::from(word_count) * 10.0).max(0.0)
	} else {
		0.0
	};
	let fluency_score = (wpm_score * WPM_WEIGHT + pause_penalty * PAUSE_WEIGHT) * 100.0;

	SpeechMetrics {
		word_count,
		duration,
		pause_count,
		words_per_minute: round1(words_per_minute),
		fluency_score: round1(fluency_score),
	}
}

/// Mean avg_logprob across segments, 0 when there are none.
#[must_use]
pub fn mean_confidence(segments: &[Segment]) -> f64 {
	if segments.is_empty() {
		return 0.0;
	}
	segments.iter().map(|s| s.avg_logprob).sum::<f64>() / segments.len() as f64
}

/// Similarity of the transcript against an expected reference, 0–100 with
/// one decimal. Both texts are lower-cased and trimmed before matching.
#[must_use]
pub fn accuracy_score(transcribed: &str, expected: &str) -> f64 {
	let transcribed = transcribed.to_lowercase();
	let expected = expected.to_lowercase();
	round1(similarity_ratio(transcribed.trim(), expected.trim()) * 100.0)
}

/// Longest-matching-subsequence similarity ratio in [0, 1]: twice the total
/// matched character count over the combined length. Matches are found by
/// recursively splitting around the longest common substring.
#[must_use]
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
	let a: Vec<char> = a.chars().collect();
	let b: Vec<char> = b.chars().collect();
	let total = a.len() + b.len();

	if total == 0 {
		return 1.0;
	}

	let matches = matching_chars(&a, &b);
	2.0 * matches as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
	let (i, j, len) = longest_common_run(a, b);
	if len == 0 {
		return 0;
	}

	len + matching_chars(&a[..i], &b[..j]) + matching_chars(&a[i + len..], &b[j + len..])
}

/// Longest common substring of `a` and `b` as (start_a, start_b, length),
/// using a rolling DP row.
fn longest_common_run(a: &[char], b: &[char]) -> (usize, usize, usize) {
	let mut best = (0, 0, 0);
	let mut prev = vec![0usize; b.len() + 1];

	for (i, ca) in a.iter().enumerate() {
		let mut row = vec![0usize; b.len() + 1];
		for (j, cb) in b.iter().enumerate() {
			if ca == cb {
				let run = prev[j] + 1;
				row[j + 1] = run;
				if run > best.2 {
					best = (i + 1 - run, j + 1 - run, run);
				}
			}
		}
		prev = row;
	}

	best
}

/// Round to one decimal place, the precision every score is reported at.
#[must_use]
pub fn round1(value: f64) -> f64 {
	(value * 10.0).round() / 10.0
}
