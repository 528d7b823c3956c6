//! Terminal stand-ins for the microphone and speaker
//!
//! Typed lines play the role of speech: each line is revealed word by word as
//! partial hypotheses and then settled, just like a streaming recognizer.
//! Speech output is printed and takes time proportional to its length so
//! barge-in can be exercised from a keyboard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::engine::{LevelMeter, RecognitionEvent, SpeechRecognizer, SpeechSynthesizer};
use crate::{Error, Result};

/// Default delay between revealed words
pub const DEFAULT_WORD_DELAY: Duration = Duration::from_millis(120);

/// Simulated speaking time per character at rate 1.0
const SPEECH_MS_PER_CHAR: f32 = 45.0;

/// Feeds typed lines to a [`ConsoleRecognizer`]
#[derive(Debug, Clone)]
pub struct ConsoleMicrophone {
    lines: mpsc::UnboundedSender<String>,
}

impl ConsoleMicrophone {
    /// "Say" a line
    ///
    /// # Errors
    ///
    /// Returns error if the recognizer has been dropped
    pub fn say(&self, line: &str) -> Result<()> {
        self.lines
            .send(line.to_string())
            .map_err(|_| Error::SessionClosed)
    }
}

struct Running {
    cancel: CancellationToken,
    muted: Arc<AtomicBool>,
}

/// Recognizer that hears typed lines
pub struct ConsoleRecognizer {
    lines: Arc<AsyncMutex<mpsc::UnboundedReceiver<String>>>,
    word_delay: Duration,
    running: Mutex<Option<Running>>,
}

/// Create a connected microphone/recognizer pair
#[must_use]
pub fn console_microphone(word_delay: Duration) -> (ConsoleMicrophone, ConsoleRecognizer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ConsoleMicrophone { lines: tx },
        ConsoleRecognizer {
            lines: Arc::new(AsyncMutex::new(rx)),
            word_delay,
            running: Mutex::new(None),
        },
    )
}

impl ConsoleRecognizer {
    fn muted_flag(&self) -> Option<Arc<AtomicBool>> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| Arc::clone(&r.muted))
    }
}

#[async_trait]
impl SpeechRecognizer for ConsoleRecognizer {
    async fn start(&self) -> Result<mpsc::Receiver<RecognitionEvent>> {
        self.stop().await;

        let (events_tx, events_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let muted = Arc::new(AtomicBool::new(false));

        let lines = Arc::clone(&self.lines);
        let word_delay = self.word_delay;
        let task_cancel = cancel.clone();
        let task_muted = Arc::clone(&muted);
        tokio::spawn(async move {
            let mut lines = tokio::select! {
                () = task_cancel.cancelled() => return,
                lines = lines.lock_owned() => lines,
            };

            loop {
                let line = tokio::select! {
                    () = task_cancel.cancelled() => return,
                    line = lines.recv() => line,
                };
                let Some(line) = line else {
                    return;
                };
                if task_muted.load(Ordering::Relaxed) {
                    tracing::debug!("microphone paused, dropping typed line");
                    continue;
                }

                let words: Vec<&str> = line.split_whitespace().collect();
                for i in 1..=words.len() {
                    let partial = words[..i].join(" ");
                    if events_tx.send(RecognitionEvent::Partial(partial)).await.is_err() {
                        return;
                    }
                    tokio::select! {
                        () = task_cancel.cancelled() => return,
                        () = tokio::time::sleep(word_delay) => {}
                    }
                }
                if events_tx
                    .send(RecognitionEvent::Final(words.join(" ")))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(Running { cancel, muted });
        Ok(events_rx)
    }

    async fn pause(&self) -> Result<()> {
        let muted = self
            .muted_flag()
            .ok_or_else(|| Error::EngineUnavailable("recognizer not running".to_string()))?;
        muted.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        let muted = self.muted_flag().ok_or(Error::ResumeUnsupported)?;
        muted.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.cancel.cancel();
        }
    }

    fn name(&self) -> &'static str {
        "console"
    }
}

/// Prints speech instead of playing it
#[derive(Debug, Default)]
pub struct ConsoleSynthesizer;

impl ConsoleSynthesizer {
    /// Simulated duration of `text` at `rate`
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn duration_for(text: &str, rate: f32) -> Duration {
        let rate = if rate.is_finite() && rate > 0.0 { rate } else { 1.0 };
        let ms = text.chars().count() as f32 * SPEECH_MS_PER_CHAR / rate;
        Duration::from_millis(ms as u64)
    }
}

#[async_trait]
impl SpeechSynthesizer for ConsoleSynthesizer {
    async fn speak(
        &self,
        text: &str,
        rate: f32,
        level: &LevelMeter,
        cancel: CancellationToken,
    ) -> Result<()> {
        println!("parley: {text}");

        let deadline = tokio::time::Instant::now() + Self::duration_for(text, rate);
        let mut tick = tokio::time::interval(Duration::from_millis(80));
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    println!("parley: [interrupted]");
                    break;
                }
                () = tokio::time::sleep_until(deadline) => break,
                _ = tick.tick() => {
                    // Synthetic level, good enough for a meter
                    level.set(rand::thread_rng().gen_range(0.2..0.8));
                }
            }
        }
        level.reset();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "console"
    }
}
