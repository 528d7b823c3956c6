//! Speech capability interfaces
//!
//! Recognition and synthesis are external capabilities. The conversation core
//! only needs these narrow seams; concrete adapters live in `cloud` and
//! `console`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Output of a running recognizer
#[derive(Debug)]
pub enum RecognitionEvent {
    /// Current hypothesis for the segment being spoken
    Partial(String),
    /// The segment is settled; later partials start a new one
    Final(String),
    /// The engine failed mid-stream
    Fault(Error),
}

/// Continuous audio-to-text capability
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Begin capture and return the event stream
    ///
    /// # Errors
    ///
    /// `PermissionDenied` without consent, `EngineUnavailable` if the device
    /// cannot be opened
    async fn start(&self) -> Result<mpsc::Receiver<RecognitionEvent>>;

    /// Stop feeding audio without tearing the session down
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects the request
    async fn pause(&self) -> Result<()>;

    /// Feed audio again after `pause`
    ///
    /// # Errors
    ///
    /// `ResumeUnsupported` if the engine needs a full restart instead
    async fn resume(&self) -> Result<()>;

    /// Release every resource; the event stream ends
    async fn stop(&self);

    /// Engine name for logging
    fn name(&self) -> &'static str;
}

/// Text-to-audio capability
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Speak `text` at `rate` (1.0 is normal) until done or `cancel` fires
    ///
    /// Implementations publish a coarse output level to `level` while
    /// talking and return promptly once `cancel` is triggered.
    ///
    /// # Errors
    ///
    /// Returns error if synthesis or output fails
    async fn speak(
        &self,
        text: &str,
        rate: f32,
        level: &LevelMeter,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Engine name for logging
    fn name(&self) -> &'static str;
}

/// Lock-free, best-effort output level in `0.0..=1.0`
#[derive(Debug, Clone, Default)]
pub struct LevelMeter {
    bits: Arc<AtomicU32>,
}

impl LevelMeter {
    /// Create a meter reading zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new level (clamped)
    pub fn set(&self, level: f32) {
        let level = if level.is_finite() {
            level.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.bits.store(level.to_bits(), Ordering::Relaxed);
    }

    /// Latest published level
    #[must_use]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Back to silence
    pub fn reset(&self) {
        self.set(0.0);
    }
}

/// Calculate RMS energy of audio samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
