//! Interruptible speech output
//!
//! One utterance at a time: a new `speak` replaces whatever is playing and
//! `stop` cuts the current one off immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::engine::{LevelMeter, SpeechSynthesizer};

/// How long a replaced utterance may take to wind down before we move on
const INTERRUPT_GRACE: Duration = Duration::from_millis(250);

static LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]*\)").expect("valid regex"));

static URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").expect("valid regex"));

static LINE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:#{1,6}\s+|>\s*|[-*+•▪◦‣●]\s+|\d{1,2}[.)]\s+)").expect("valid regex")
});

static EMPHASIS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*|__|~~|`+|\*|\b_|_\b").expect("valid regex"));

static DECORATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\p{Extended_Pictographic}\u{FE0F}\u{200D}\u{2190}-\u{21FF}\u{2500}-\u{25FF}•]")
        .expect("valid regex")
});

static LEAD_IN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:sure|certainly|of course|absolutely|great question|good question|alright|as an ai(?: language model)?)(?:\s+thing)?\s*[!,.:]+\s*",
    )
    .expect("valid regex")
});

static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").expect("valid regex"));

/// Turn model output into plain prose for speaking
///
/// Drops markdown markers, bullets, emoji and decorative glyphs, URLs, and
/// boilerplate lead-ins like "Sure!". Lines become sentences.
#[must_use]
pub fn sanitize_for_speech(text: &str) -> String {
    let mut sentences: Vec<String> = Vec::new();

    for line in text.lines() {
        let line = LINE_MARKER.replace(line, "");
        let line = LINK.replace_all(&line, "$1");
        let line = URL.replace_all(&line, "");
        let line = EMPHASIS.replace_all(&line, "");
        let line = DECORATIVE.replace_all(&line, "");
        let line = SPACES.replace_all(line.trim(), " ");
        if line.is_empty() {
            continue;
        }

        let mut sentence = line.into_owned();
        if !sentence.ends_with(['.', '!', '?', ':', ';', ',']) {
            sentence.push('.');
        }
        sentences.push(sentence);
    }

    let mut spoken = sentences.join(" ");
    // "Sure! Certainly. Here..." can stack
    for _ in 0..3 {
        let stripped = LEAD_IN.replace(&spoken, "");
        if stripped.len() == spoken.len() || stripped.trim().is_empty() {
            break;
        }
        spoken = stripped.into_owned();
    }

    spoken.trim().to_string()
}

/// How an utterance ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechOutcome {
    /// Played to the end
    Completed,
    /// Cut off by `stop` or a newer utterance
    Interrupted,
    /// The synthesizer failed
    Failed,
}

/// A started utterance
#[derive(Debug)]
pub struct SpeechTicket {
    /// Text actually handed to the synthesizer
    pub text: String,
    /// Resolves when the utterance ends
    pub done: oneshot::Receiver<SpeechOutcome>,
}

struct Utterance {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Speech playback controller
pub struct SpeechPlaybackController {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    level: LevelMeter,
    // id of the utterance currently audible, 0 when silent
    speaking: Arc<AtomicU64>,
    next_id: u64,
    current: Option<Utterance>,
}

impl SpeechPlaybackController {
    /// Create an idle controller
    #[must_use]
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        Self {
            synthesizer,
            level: LevelMeter::new(),
            speaking: Arc::new(AtomicU64::new(0)),
            next_id: 1,
            current: None,
        }
    }

    /// Speak `text`, replacing anything already playing
    pub async fn speak(&mut self, text: &str, rate: f32) -> SpeechTicket {
        self.interrupt().await;

        let spoken = sanitize_for_speech(text);
        let (done_tx, done) = oneshot::channel();
        if spoken.is_empty() {
            let _ = done_tx.send(SpeechOutcome::Completed);
            return SpeechTicket { text: spoken, done };
        }

        let id = self.next_id;
        self.next_id += 1;
        self.speaking.store(id, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let synthesizer = Arc::clone(&self.synthesizer);
        let level = self.level.clone();
        let speaking = Arc::clone(&self.speaking);
        let task_cancel = cancel.clone();
        let text = spoken.clone();

        tracing::debug!(id, chars = text.len(), engine = synthesizer.name(), "speaking");
        let handle = tokio::spawn(async move {
            let result = synthesizer
                .speak(&text, rate, &level, task_cancel.clone())
                .await;
            let outcome = if task_cancel.is_cancelled() {
                SpeechOutcome::Interrupted
            } else {
                match result {
                    Ok(()) => SpeechOutcome::Completed,
                    Err(e) => {
                        tracing::warn!(error = %e, "speech synthesis failed");
                        SpeechOutcome::Failed
                    }
                }
            };

            if speaking
                .compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                level.reset();
            }
            tracing::debug!(id, ?outcome, "utterance finished");
            let _ = done_tx.send(outcome);
        });

        self.current = Some(Utterance { cancel, handle });
        SpeechTicket { text: spoken, done }
    }

    /// Halt output immediately
    pub fn stop(&mut self) {
        if let Some(current) = &self.current {
            if !current.cancel.is_cancelled() {
                tracing::debug!("stopping speech");
            }
            current.cancel.cancel();
        }
        self.speaking.store(0, Ordering::SeqCst);
        self.level.reset();
    }

    /// Whether an utterance is audible
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst) != 0
    }

    /// Coarse output level in `0.0..=1.0`
    #[must_use]
    pub fn audio_level(&self) -> f32 {
        if self.is_speaking() {
            self.level.get()
        } else {
            0.0
        }
    }

    async fn interrupt(&mut self) {
        self.stop();
        if let Some(previous) = self.current.take() {
            let abort = previous.handle.abort_handle();
            if tokio::time::timeout(INTERRUPT_GRACE, previous.handle)
                .await
                .is_err()
            {
                tracing::debug!("previous utterance slow to stop, aborting");
                abort.abort();
            }
        }
    }
}

impl Drop for SpeechPlaybackController {
    fn drop(&mut self) {
        if let Some(current) = self.current.take() {
            current.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[test]
    fn strips_markdown_and_bullets() {
        let text = "**Sure!** Here are two options:\n- *Urea* 🌱\n- DAP\n\n1. Check [prices](https://example.com) first";
        assert_eq!(
            sanitize_for_speech(text),
            "Here are two options: Urea. DAP. Check prices first."
        );
    }

    #[test]
    fn strips_stacked_lead_ins() {
        assert_eq!(
            sanitize_for_speech("Certainly! Great question. Wheat needs nitrogen."),
            "Wheat needs nitrogen."
        );
    }

    #[test]
    fn keeps_lead_in_when_it_is_everything() {
        assert_eq!(sanitize_for_speech("Sure!"), "Sure!");
    }

    #[test]
    fn keeps_plain_text_and_identifiers() {
        assert_eq!(sanitize_for_speech("It costs 270 rupees."), "It costs 270 rupees.");
        assert_eq!(sanitize_for_speech("Use snake_case names"), "Use snake_case names.");
        assert_eq!(sanitize_for_speech("### Weather\n> Rain expected ☔"), "Weather. Rain expected.");
    }

    struct SlowSynth;

    #[async_trait]
    impl SpeechSynthesizer for SlowSynth {
        async fn speak(
            &self,
            _text: &str,
            _rate: f32,
            level: &LevelMeter,
            cancel: CancellationToken,
        ) -> crate::Result<()> {
            level.set(0.5);
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(Duration::from_secs(2)) => {}
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_and_goes_idle() {
        let mut controller = SpeechPlaybackController::new(Arc::new(SlowSynth));
        let ticket = controller.speak("Hello **there**", 1.0).await;
        assert_eq!(ticket.text, "Hello there.");
        assert!(controller.is_speaking());

        assert_eq!(ticket.done.await.unwrap(), SpeechOutcome::Completed);
        assert!(!controller.is_speaking());
        assert!(controller.audio_level().abs() < f32::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_immediately() {
        let mut controller = SpeechPlaybackController::new(Arc::new(SlowSynth));
        let ticket = controller.speak("A long answer", 1.0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(controller.audio_level() > 0.0);

        controller.stop();
        assert!(!controller.is_speaking());
        assert_eq!(ticket.done.await.unwrap(), SpeechOutcome::Interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn new_utterance_replaces_old() {
        let mut controller = SpeechPlaybackController::new(Arc::new(SlowSynth));
        let first = controller.speak("first", 1.0).await;
        let second = controller.speak("second", 1.0).await;

        assert_eq!(first.done.await.unwrap(), SpeechOutcome::Interrupted);
        assert!(controller.is_speaking());
        assert_eq!(second.done.await.unwrap(), SpeechOutcome::Completed);
    }

    #[tokio::test]
    async fn empty_text_completes_at_once() {
        let mut controller = SpeechPlaybackController::new(Arc::new(SlowSynth));
        let ticket = controller.speak("🌱 **", 1.0).await;
        assert!(ticket.text.is_empty());
        assert_eq!(ticket.done.await.unwrap(), SpeechOutcome::Completed);
        assert!(!controller.is_speaking());
    }
}
