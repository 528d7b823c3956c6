//! Silence-based utterance segmentation
//!
//! The recognizer only ever reports "the transcript so far". An utterance is
//! whatever arrived after the last submission, and it is complete once it has
//! stopped changing for the silence threshold.

use std::time::Duration;

use tokio::time::Instant;

use super::echo::normalize;

/// Default silence that ends an utterance
pub const DEFAULT_SILENCE_THRESHOLD: Duration = Duration::from_millis(1_300);

/// Transcript text accumulating while the user speaks
#[derive(Debug, Clone, Default)]
pub struct UtteranceCandidate {
    text: String,
    last_changed: Option<Instant>,
}

impl UtteranceCandidate {
    /// Replace the accumulated text; returns whether it actually changed
    pub fn update(&mut self, text: &str, now: Instant) -> bool {
        let text = text.trim();
        if text == self.text {
            return false;
        }
        self.text = text.to_string();
        self.last_changed = Some(now);
        true
    }

    /// Current text
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether nothing meaningful has been heard
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Time since the text last changed
    #[must_use]
    pub fn silence_duration(&self, now: Instant) -> Duration {
        self.last_changed
            .map_or(Duration::ZERO, |t| now.saturating_duration_since(t))
    }

    /// When the text last changed
    #[must_use]
    pub const fn last_changed(&self) -> Option<Instant> {
        self.last_changed
    }

    /// Discard everything
    pub fn reset(&mut self) {
        self.text.clear();
        self.last_changed = None;
    }
}

/// Marks how much of the running transcript has already been consumed
#[derive(Debug, Clone, Default)]
pub struct TranscriptBaseline {
    consumed: String,
}

impl TranscriptBaseline {
    /// Treat everything in `transcript` as already handled
    pub fn mark(&mut self, transcript: &str) {
        self.consumed = transcript.to_string();
    }

    /// Forget the baseline (after the recognizer restarts from empty)
    pub fn clear(&mut self) {
        self.consumed.clear();
    }

    /// The part of `transcript` heard after the baseline
    #[must_use]
    pub fn fresh<'a>(&self, transcript: &'a str) -> &'a str {
        if self.consumed.is_empty() {
            return transcript.trim();
        }
        if let Some(rest) = transcript.strip_prefix(self.consumed.as_str()) {
            return rest.trim();
        }
        if self.consumed.starts_with(transcript) {
            // hypothesis shrank while being revised
            return "";
        }

        // Recognizers revise earlier words; tolerate small rewrites of the tail
        let common = common_prefix_len(&self.consumed, transcript);
        if common * 5 >= self.consumed.len() * 4 {
            return transcript[common..].trim();
        }

        // Recognizer restarted from scratch
        transcript.trim()
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .take_while(|((_, ca), cb)| ca == cb)
        .last()
        .map_or(0, |((i, c), _)| i + c.len_utf8())
}

/// Why a candidate was or was not submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitVerdict {
    /// Ready: submit this text
    Submit(String),
    /// Nothing to submit
    Empty,
    /// Still inside the silence window
    TooSoon(Duration),
    /// Same as the previous submission
    Duplicate,
    /// The agent is still talking
    PlaybackActive,
}

/// Decide whether a candidate becomes an utterance
///
/// Submits iff the text is non-empty, has been unchanged for `threshold`,
/// differs from the previous submission, and playback is idle.
#[must_use]
pub fn evaluate_submission(
    candidate: &UtteranceCandidate,
    last_submitted: Option<&str>,
    playback_idle: bool,
    threshold: Duration,
    now: Instant,
) -> SubmitVerdict {
    if candidate.is_empty() {
        return SubmitVerdict::Empty;
    }

    let silence = candidate.silence_duration(now);
    if silence < threshold {
        return SubmitVerdict::TooSoon(threshold - silence);
    }

    if let Some(previous) = last_submitted {
        if normalize(previous) == normalize(candidate.text()) {
            return SubmitVerdict::Duplicate;
        }
    }

    if !playback_idle {
        return SubmitVerdict::PlaybackActive;
    }

    SubmitVerdict::Submit(candidate.text().to_string())
}
