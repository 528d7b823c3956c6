//! Wake phrase detection
//!
//! Matching of multi-word phrases is tolerant of small mis-transcriptions
//! ("hey parlay" still wakes "hey parley"); a single word must be heard
//! exactly, or every rhyming word would wake the agent. Every detection opens
//! a cooldown window so one utterance cannot trigger twice. When no conversation is running the
//! monitor owns the microphone through its own recognizer; during a
//! conversation it is fed the session transcript instead.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use strsim::levenshtein;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::arbiter::AudioEngineArbiter;
use super::engine::{RecognitionEvent, SpeechRecognizer};
use crate::conversation::normalize;

/// Default window after a detection during which further matches are dropped
pub const DEFAULT_WAKE_COOLDOWN: Duration = Duration::from_secs(3);

const LEASE_OWNER: &str = "wake";

/// A wake phrase found in transcribed text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeMatch {
    /// The configured phrase that matched
    pub phrase: String,
    /// Whether it matched without edits
    pub exact: bool,
    /// Whether the phrase opened the text
    pub leading: bool,
    /// Normalized words following the phrase
    pub remainder: String,
}

/// Approximate wake phrase matcher
#[derive(Debug, Clone)]
pub struct WakePhraseMatcher {
    phrases: Vec<String>,
}

impl WakePhraseMatcher {
    /// Create a matcher for the given phrases
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let phrases = phrases
            .into_iter()
            .map(|p| normalize(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        Self { phrases }
    }

    /// Normalized phrases
    #[must_use]
    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    /// Edit distance tolerated for a phrase
    fn tolerance(phrase: &str) -> usize {
        if !phrase.contains(' ') {
            return 0;
        }
        match phrase.chars().count() {
            0..=4 => 0,
            5..=12 => 1,
            _ => 2,
        }
    }

    /// Find the first wake phrase in `text`
    #[must_use]
    pub fn find(&self, text: &str) -> Option<WakeMatch> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return None;
        }
        let words: Vec<&str> = normalized.split(' ').collect();

        // Exact, word-aligned containment wins over fuzzy matches
        for phrase in &self.phrases {
            let width = phrase.split(' ').count();
            if let Some(start) = (0..=words.len().saturating_sub(width))
                .find(|&i| words.len() >= width && words[i..i + width].join(" ") == *phrase)
            {
                return Some(WakeMatch {
                    phrase: phrase.clone(),
                    exact: true,
                    leading: start == 0,
                    remainder: words[start + width..].join(" "),
                });
            }
        }

        for phrase in &self.phrases {
            let tolerance = Self::tolerance(phrase);
            if tolerance == 0 {
                continue;
            }
            let width = phrase.split(' ').count();
            if words.len() < width {
                continue;
            }
            for start in 0..=words.len() - width {
                let window = words[start..start + width].join(" ");
                if levenshtein(&window, phrase) <= tolerance {
                    tracing::trace!(phrase, heard = %window, "fuzzy wake match");
                    return Some(WakeMatch {
                        phrase: phrase.clone(),
                        exact: false,
                        leading: start == 0,
                        remainder: words[start + width..].join(" "),
                    });
                }
            }
        }

        None
    }
}

/// A qualifying wake phrase was heard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeEvent {
    /// Phrase that matched
    pub phrase: String,
    /// Text it was found in
    pub heard: String,
    /// Detected by the monitor's own recognizer rather than the session transcript
    pub standalone: bool,
}

#[derive(Debug)]
struct Cooldown {
    window: Duration,
    last_detection: Option<Instant>,
}

impl Cooldown {
    fn try_fire(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_detection {
            if now.saturating_duration_since(last) < self.window {
                return false;
            }
        }
        self.last_detection = Some(now);
        true
    }
}

/// Where the standalone listener is inside an utterance
#[derive(Debug, Default)]
struct PendingWake {
    heard: Option<String>,
    settles_at: Option<Instant>,
}

struct Listener {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Always-on wake phrase monitor
pub struct WakePhraseMonitor {
    matcher: Arc<WakePhraseMatcher>,
    cooldown: Arc<Mutex<Cooldown>>,
    silence: Duration,
    armed: bool,
    events: mpsc::UnboundedSender<WakeEvent>,
    recognizer: Option<Arc<dyn SpeechRecognizer>>,
    arbiter: AudioEngineArbiter,
    listener: Option<Listener>,
}

impl WakePhraseMonitor {
    /// Create an armed monitor
    ///
    /// Without a recognizer the monitor only works on transcript text passed
    /// to [`observe`](Self::observe). `silence` is how long a partial
    /// hypothesis must stand before the standalone listener treats it as the
    /// whole utterance.
    #[must_use]
    pub fn new(
        matcher: WakePhraseMatcher,
        cooldown: Duration,
        silence: Duration,
        arbiter: AudioEngineArbiter,
        recognizer: Option<Arc<dyn SpeechRecognizer>>,
    ) -> (Self, mpsc::UnboundedReceiver<WakeEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let monitor = Self {
            matcher: Arc::new(matcher),
            cooldown: Arc::new(Mutex::new(Cooldown {
                window: cooldown,
                last_detection: None,
            })),
            silence,
            armed: true,
            events,
            recognizer,
            arbiter,
            listener: None,
        };
        (monitor, event_rx)
    }

    /// The phrase matcher
    #[must_use]
    pub fn matcher(&self) -> &WakePhraseMatcher {
        &self.matcher
    }

    /// Check session transcript text; emits an event and returns true on detection
    pub fn observe(&self, heard: &str) -> bool {
        if !self.armed {
            return false;
        }
        let Some(found) = self.matcher.find(heard) else {
            return false;
        };
        if !fire(&self.cooldown) {
            tracing::debug!(phrase = %found.phrase, "wake phrase inside cooldown, ignoring");
            return false;
        }

        tracing::info!(phrase = %found.phrase, exact = found.exact, "wake phrase detected");
        let _ = self.events.send(WakeEvent {
            phrase: found.phrase,
            heard: heard.to_string(),
            standalone: false,
        });
        true
    }

    /// Allow detections from the session transcript
    pub fn arm(&mut self) {
        if !self.armed {
            tracing::debug!("wake monitor armed");
        }
        self.armed = true;
    }

    /// Ignore the session transcript until re-armed
    pub fn disarm(&mut self) {
        if self.armed {
            tracing::debug!("wake monitor disarmed");
        }
        self.armed = false;
    }

    /// Whether session-transcript detections are allowed
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.armed
    }

    /// Whether the standalone listener is running
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|listener| !listener.handle.is_finished())
    }

    /// Listen on the microphone while no conversation is running
    ///
    /// Returns false when there is no wake recognizer or it is already running.
    pub fn listen_standalone(&mut self) -> bool {
        let Some(recognizer) = self.recognizer.clone() else {
            return false;
        };
        if self.is_listening() {
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(listen(
            recognizer,
            self.arbiter.clone(),
            Arc::clone(&self.matcher),
            Arc::clone(&self.cooldown),
            self.silence,
            self.events.clone(),
            cancel.clone(),
        ));
        self.listener = Some(Listener { cancel, handle });
        true
    }

    /// Stop the standalone listener and wait until it has released the microphone
    pub async fn stop_standalone(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.cancel.cancel();
            if let Err(e) = listener.handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "wake listener panicked");
                }
            }
        }
    }
}

impl Drop for WakePhraseMonitor {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.cancel.cancel();
        }
    }
}

fn fire(cooldown: &Mutex<Cooldown>) -> bool {
    cooldown
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .try_fire(Instant::now())
}

/// Emit a standalone detection for a settled utterance; returns whether it fired
fn announce(
    matcher: &WakePhraseMatcher,
    cooldown: &Mutex<Cooldown>,
    events: &mpsc::UnboundedSender<WakeEvent>,
    heard: String,
) -> bool {
    let Some(found) = matcher.find(&heard) else {
        return false;
    };
    if !fire(cooldown) {
        return false;
    }
    tracing::info!(phrase = %found.phrase, heard = %heard, "wake phrase detected");
    let _ = events.send(WakeEvent {
        phrase: found.phrase,
        heard,
        standalone: true,
    });
    true
}

async fn listen(
    recognizer: Arc<dyn SpeechRecognizer>,
    arbiter: AudioEngineArbiter,
    matcher: Arc<WakePhraseMatcher>,
    cooldown: Arc<Mutex<Cooldown>>,
    silence: Duration,
    events: mpsc::UnboundedSender<WakeEvent>,
    cancel: CancellationToken,
) {
    let _lease = tokio::select! {
        () = cancel.cancelled() => return,
        lease = arbiter.acquire(LEASE_OWNER) => lease,
    };

    let mut rx = match recognizer.start().await {
        Ok(rx) => rx,
        Err(e) => {
            tracing::warn!(error = %e, engine = recognizer.name(), "wake listener could not start");
            return;
        }
    };
    tracing::info!(phrases = ?matcher.phrases(), "listening for wake phrase");

    // A partial match may be the start of a request, so the event waits for
    // the segment to settle or for the speaker to go quiet
    let mut pending = PendingWake::default();
    loop {
        let settles_at = pending.settles_at;
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            () = sleep_until_some(settles_at), if settles_at.is_some() => {
                pending.settles_at = None;
                pending.heard.take().map(RecognitionEvent::Final)
            }
            event = rx.recv() => event,
        };

        match event {
            Some(RecognitionEvent::Partial(text)) => {
                if matcher.find(&text).is_some() {
                    pending.heard = Some(text);
                    pending.settles_at = Some(Instant::now() + silence);
                } else {
                    pending = PendingWake::default();
                }
            }
            Some(RecognitionEvent::Final(text)) => {
                pending = PendingWake::default();
                if announce(&matcher, &cooldown, &events, text) {
                    break;
                }
            }
            Some(RecognitionEvent::Fault(e)) if e.is_cancellation() => {}
            Some(RecognitionEvent::Fault(e)) => {
                tracing::warn!(error = %e, "wake listener failed");
                break;
            }
            None => break,
        }
    }

    recognizer.stop().await;
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> WakePhraseMatcher {
        WakePhraseMatcher::new(["Hey Parley", "parley"])
    }

    #[test]
    fn exact_match_with_remainder() {
        let found = matcher().find("Hey Parley, what's the price of urea?").unwrap();
        assert_eq!(found.phrase, "hey parley");
        assert!(found.exact);
        assert!(found.leading);
        assert_eq!(found.remainder, "whats the price of urea");
    }

    #[test]
    fn phrase_inside_a_sentence_is_not_leading() {
        let found = matcher().find("tell me more about parley please").unwrap();
        assert_eq!(found.phrase, "parley");
        assert!(!found.leading);
        assert_eq!(found.remainder, "please");
    }

    #[test]
    fn exact_match_is_word_aligned() {
        let matcher = WakePhraseMatcher::new(["hey parley"]);
        assert!(matcher.find("they parleyed").is_none());
    }

    #[test]
    fn small_mistranscription_still_matches() {
        let found = matcher().find("hey parlay").unwrap();
        assert_eq!(found.phrase, "hey parley");
        assert!(!found.exact);
        assert!(found.remainder.is_empty());
    }

    #[test]
    fn single_word_phrase_needs_exact_match() {
        assert!(matcher().find("barley prices today").is_none());
        assert!(matcher().find("parlay").is_none());
        assert!(matcher().find("harley davidson").is_none());

        let found = matcher().find("parley prices today").unwrap();
        assert!(found.exact);
        assert_eq!(found.remainder, "prices today");
    }

    #[test]
    fn unrelated_text_does_not_match() {
        assert!(matcher().find("what is the weather today").is_none());
        assert!(matcher().find("").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_blocks_retrigger() {
        let (monitor, mut events) = WakePhraseMonitor::new(
            matcher(),
            Duration::from_secs(3),
            Duration::from_millis(1_300),
            AudioEngineArbiter::default(),
            None,
        );

        assert!(monitor.observe("hey parley"));
        assert!(!monitor.observe("hey parley"));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(monitor.observe("hey parley"));

        let first = events.recv().await.unwrap();
        assert!(!first.standalone);
        assert_eq!(first.phrase, "hey parley");
        assert!(events.recv().await.is_some());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_monitor_ignores_text() {
        let (mut monitor, _events) = WakePhraseMonitor::new(
            matcher(),
            Duration::from_secs(3),
            Duration::from_millis(1_300),
            AudioEngineArbiter::default(),
            None,
        );
        monitor.disarm();
        assert!(!monitor.observe("hey parley"));
        monitor.arm();
        assert!(monitor.observe("hey parley"));
    }

    /// Recognizer that only ever produces one partial hypothesis
    struct HangingPartial(Mutex<Option<mpsc::Sender<RecognitionEvent>>>);

    #[async_trait::async_trait]
    impl SpeechRecognizer for HangingPartial {
        async fn start(&self) -> crate::Result<mpsc::Receiver<RecognitionEvent>> {
            let (tx, rx) = mpsc::channel(4);
            tx.try_send(RecognitionEvent::Partial("hey parley".to_string()))
                .unwrap();
            *self.0.lock().unwrap() = Some(tx);
            Ok(rx)
        }

        async fn pause(&self) -> crate::Result<()> {
            Ok(())
        }

        async fn resume(&self) -> crate::Result<()> {
            Ok(())
        }

        async fn stop(&self) {
            self.0.lock().unwrap().take();
        }

        fn name(&self) -> &'static str {
            "hanging"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn standalone_listener_waits_for_the_whole_request() {
        let (mic, recognizer) = crate::voice::console_microphone(Duration::from_millis(10));
        let (mut monitor, mut events) = WakePhraseMonitor::new(
            matcher(),
            Duration::from_secs(3),
            Duration::from_millis(1_300),
            AudioEngineArbiter::new(Duration::ZERO),
            Some(Arc::new(recognizer)),
        );
        assert!(monitor.listen_standalone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        mic.say("hey parley what is the price of urea").unwrap();
        let event = events.recv().await.unwrap();
        assert!(event.standalone);
        assert_eq!(event.phrase, "hey parley");
        assert_eq!(event.heard, "hey parley what is the price of urea");
        monitor.stop_standalone().await;
    }

    #[tokio::test(start_paused = true)]
    async fn standalone_partial_counts_after_silence() {
        let (mut monitor, mut events) = WakePhraseMonitor::new(
            matcher(),
            Duration::from_secs(3),
            Duration::from_millis(1_300),
            AudioEngineArbiter::new(Duration::ZERO),
            Some(Arc::new(HangingPartial(Mutex::new(None)))),
        );
        let started = Instant::now();
        assert!(monitor.listen_standalone());

        let event = events.recv().await.unwrap();
        assert_eq!(event.heard, "hey parley");
        assert!(started.elapsed() >= Duration::from_millis(1_300));
        monitor.stop_standalone().await;
    }

    #[tokio::test]
    async fn standalone_requires_recognizer() {
        let (mut monitor, _events) = WakePhraseMonitor::new(
            matcher(),
            Duration::from_secs(3),
            Duration::from_millis(1_300),
            AudioEngineArbiter::default(),
            None,
        );
        assert!(!monitor.listen_standalone());
        assert!(!monitor.is_listening());
        monitor.stop_standalone().await;
    }
}
