//! Continuous transcription
//!
//! Wraps a [`SpeechRecognizer`] and folds its partial/final events into one
//! evolving transcript that the orchestrator observes through a watch
//! channel. Pausing keeps the recognition session alive so resuming is cheap;
//! engines that cannot do that fall back to a full restart.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::arbiter::{AudioEngineArbiter, EngineLease};
use super::engine::{RecognitionEvent, SpeechRecognizer};
use crate::{Error, Result};

/// Delay before the single automatic retry of a transient engine failure
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

const LEASE_OWNER: &str = "transcription";

/// Observable transcript state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptSnapshot {
    /// Everything heard since the last `clear`
    pub text: String,
    /// Bumped on every text change
    pub revision: u64,
    /// Capture session is open
    pub running: bool,
    /// Audio delivery is suspended
    pub paused: bool,
}

/// Joins settled segments with the live hypothesis
#[derive(Debug, Default)]
struct Composer {
    committed: String,
    partial: String,
    // Hypothesis text consumed by `clear` that the engine may still repeat
    stale: Option<String>,
}

impl Composer {
    fn strip_stale(&mut self, text: &str, settles: bool) -> String {
        let text = text.trim();
        if let Some(stale) = self.stale.as_deref() {
            if let Some(rest) = text.strip_prefix(stale) {
                let rest = rest.trim().to_string();
                if settles {
                    self.stale = None;
                }
                return rest;
            }
            if stale.starts_with(text) {
                if settles {
                    self.stale = None;
                }
                return String::new();
            }
            self.stale = None;
        }
        text.to_string()
    }

    fn partial(&mut self, text: &str) {
        self.partial = self.strip_stale(text, false);
    }

    fn finalize(&mut self, text: &str) {
        let segment = self.strip_stale(text, true);
        self.partial.clear();
        if segment.is_empty() {
            return;
        }
        if !self.committed.is_empty() {
            self.committed.push(' ');
        }
        self.committed.push_str(&segment);
    }

    fn clear(&mut self) {
        if !self.partial.is_empty() {
            self.stale = Some(std::mem::take(&mut self.partial));
        }
        self.committed.clear();
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn text(&self) -> String {
        match (self.committed.is_empty(), self.partial.is_empty()) {
            (true, _) => self.partial.clone(),
            (false, true) => self.committed.clone(),
            (false, false) => format!("{} {}", self.committed, self.partial),
        }
    }
}

#[derive(Debug)]
struct Shared {
    composer: Mutex<Composer>,
    snapshot: watch::Sender<TranscriptSnapshot>,
}

impl Shared {
    fn apply(&self, f: impl FnOnce(&mut Composer)) {
        let text = {
            let mut composer = self.composer.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut composer);
            composer.text()
        };
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.text == text {
                return false;
            }
            snapshot.text = text;
            snapshot.revision += 1;
            true
        });
    }

    fn set_flags(&self, running: bool, paused: bool) {
        self.snapshot.send_if_modified(|snapshot| {
            let changed = snapshot.running != running || snapshot.paused != paused;
            snapshot.running = running;
            snapshot.paused = paused;
            changed
        });
    }
}

struct Pump {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Continuous transcription stream
pub struct TranscriptionStream {
    recognizer: Arc<dyn SpeechRecognizer>,
    arbiter: AudioEngineArbiter,
    retry_delay: Duration,
    shared: Arc<Shared>,
    faults: mpsc::UnboundedSender<Error>,
    lease: Option<EngineLease>,
    pump: Option<Pump>,
    paused: bool,
}

impl TranscriptionStream {
    /// Create a stopped stream; the receiver yields faults that survived the retry
    #[must_use]
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        arbiter: AudioEngineArbiter,
        retry_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Error>) {
        let (faults, fault_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(TranscriptSnapshot::default());
        let stream = Self {
            recognizer,
            arbiter,
            retry_delay,
            shared: Arc::new(Shared {
                composer: Mutex::new(Composer::default()),
                snapshot,
            }),
            faults,
            lease: None,
            pump: None,
            paused: false,
        };
        (stream, fault_rx)
    }

    /// Begin continuous capture
    ///
    /// A transient engine failure is retried once after a short delay.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` without consent, `EngineUnavailable` if the device
    /// still cannot be opened after the retry
    pub async fn start(&mut self) -> Result<()> {
        if self.lease.is_some() {
            return Ok(());
        }

        let lease = self.arbiter.acquire(LEASE_OWNER).await;
        let events = open_with_retry(self.recognizer.as_ref(), self.retry_delay).await?;
        self.lease = Some(lease);
        self.spawn_pump(events);
        self.paused = false;
        self.shared.set_flags(true, false);

        tracing::info!(engine = self.recognizer.name(), "transcription started");
        Ok(())
    }

    /// Suspend audio delivery without releasing the session
    ///
    /// # Errors
    ///
    /// Returns error if the engine fails to pause or to shut down
    pub async fn pause(&mut self) -> Result<()> {
        if self.lease.is_none() || self.paused {
            return Ok(());
        }

        match self.recognizer.pause().await {
            Ok(()) => {}
            Err(Error::ResumeUnsupported) => {
                // Hold on to the lease so nobody else grabs the microphone
                tracing::debug!("engine cannot pause in place, stopping until resume");
                self.halt_pump().await;
                self.recognizer.stop().await;
            }
            Err(e) => return Err(e),
        }

        self.paused = true;
        self.shared.set_flags(true, true);
        tracing::debug!("transcription paused");
        Ok(())
    }

    /// Restart audio delivery, falling back to stop+restart when needed
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be restarted
    pub async fn resume(&mut self) -> Result<()> {
        if self.lease.is_none() || !self.paused {
            return Ok(());
        }

        let resumed_in_place = self.pump.is_some() && self.recognizer.resume().await.is_ok();
        if !resumed_in_place {
            tracing::debug!("restarting recognizer to resume");
            self.halt_pump().await;
            self.recognizer.stop().await;
            let events = open_with_retry(self.recognizer.as_ref(), self.retry_delay).await?;
            self.spawn_pump(events);
        }

        self.paused = false;
        self.shared.set_flags(true, false);
        tracing::debug!(resumed_in_place, "transcription resumed");
        Ok(())
    }

    /// Release every resource
    pub async fn stop(&mut self) {
        if self.lease.is_none() {
            return;
        }

        self.halt_pump().await;
        self.recognizer.stop().await;
        self.lease = None;
        self.paused = false;
        self.shared.apply(Composer::reset);
        self.shared.set_flags(false, false);
        tracing::info!("transcription stopped");
    }

    /// Forget everything heard so far
    pub fn clear(&self) {
        self.shared.apply(Composer::clear);
    }

    /// Observe the transcript
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TranscriptSnapshot> {
        self.shared.snapshot.subscribe()
    }

    /// Current transcript text
    #[must_use]
    pub fn text(&self) -> String {
        self.shared.snapshot.borrow().text.clone()
    }

    /// Whether a capture session is open
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.lease.is_some()
    }

    /// Whether audio delivery is suspended
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    fn spawn_pump(&mut self, events: mpsc::Receiver<RecognitionEvent>) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pump(
            Arc::clone(&self.recognizer),
            Arc::clone(&self.shared),
            self.faults.clone(),
            cancel.clone(),
            events,
            self.retry_delay,
        ));
        self.pump = Some(Pump { cancel, handle });
    }

    async fn halt_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.cancel.cancel();
            if let Err(e) = pump.handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "transcription pump panicked");
                }
            }
        }
    }
}

impl Drop for TranscriptionStream {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.cancel.cancel();
        }
    }
}

async fn open_with_retry(
    recognizer: &dyn SpeechRecognizer,
    retry_delay: Duration,
) -> Result<mpsc::Receiver<RecognitionEvent>> {
    match recognizer.start().await {
        Ok(events) => Ok(events),
        Err(e) if e.is_transient() => {
            tracing::warn!(error = %e, engine = recognizer.name(), "recognizer failed to start, retrying once");
            tokio::time::sleep(retry_delay).await;
            recognizer.start().await
        }
        Err(e) => Err(e),
    }
}

async fn pump(
    recognizer: Arc<dyn SpeechRecognizer>,
    shared: Arc<Shared>,
    faults: mpsc::UnboundedSender<Error>,
    cancel: CancellationToken,
    mut events: mpsc::Receiver<RecognitionEvent>,
    retry_delay: Duration,
) {
    let mut retried = false;

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = events.recv() => event,
        };

        let fault = match event {
            Some(RecognitionEvent::Partial(text)) => {
                retried = false;
                shared.apply(|c| c.partial(&text));
                continue;
            }
            Some(RecognitionEvent::Final(text)) => {
                retried = false;
                shared.apply(|c| c.finalize(&text));
                continue;
            }
            Some(RecognitionEvent::Fault(e)) if e.is_cancellation() => {
                tracing::debug!(error = %e, "ignoring recognizer cancellation");
                continue;
            }
            Some(RecognitionEvent::Fault(e)) => e,
            None => Error::EngineUnavailable("recognizer stream ended".to_string()),
        };

        if fault.is_transient() && !retried {
            retried = true;
            tracing::warn!(error = %fault, "transcription interrupted, restarting once");
            recognizer.stop().await;
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(retry_delay) => {}
            }
            match recognizer.start().await {
                Ok(restarted) => {
                    events = restarted;
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "transcription restart failed");
                    let _ = faults.send(e);
                    break;
                }
            }
        }

        tracing::error!(error = %fault, "transcription failed");
        let _ = faults.send(fault);
        break;
    }

    shared.set_flags(false, false);
}
