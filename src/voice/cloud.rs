//! Microphone/speaker adapters backed by cloud STT and TTS
//!
//! Recognition: cpal capture on a dedicated thread, energy-based speech
//! segmentation, and one STT request per segment. Each transcribed segment
//! arrives as a `Final` event.
//!
//! Synthesis: TTS to MP3, decoded and played on a blocking task that stops
//! within one poll of cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::capture::{AudioCapture, SAMPLE_RATE, samples_to_wav};
use super::engine::{LevelMeter, RecognitionEvent, SpeechRecognizer, SpeechSynthesizer, rms_energy};
use super::playback::{AudioPlayback, decode_mp3};
use super::stt::SpeechToText;
use super::tts::TextToSpeech;
use crate::{Error, Result};

/// Minimum audio energy threshold to consider speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum duration of speech worth transcribing (0.3 s at 16kHz)
const MIN_SPEECH_SAMPLES: usize = 4800;

/// Silence that closes a segment (0.5 s at 16kHz)
const SILENCE_SAMPLES: usize = 8000;

/// Longest segment before it is flushed regardless (15 s at 16kHz)
const MAX_SEGMENT_SAMPLES: usize = SAMPLE_RATE as usize * 15;

/// Splits a sample stream into speech segments by RMS energy
#[derive(Debug, Default)]
pub struct VoiceActivitySegmenter {
    buffer: Vec<f32>,
    silence_counter: usize,
    in_speech: bool,
}

impl VoiceActivitySegmenter {
    /// Feed samples; returns a finished segment once speech is followed by silence
    pub fn push(&mut self, samples: &[f32]) -> Option<Vec<f32>> {
        let energy = rms_energy(samples);
        let is_speech = energy > ENERGY_THRESHOLD;

        if !self.in_speech {
            if is_speech {
                self.in_speech = true;
                self.buffer.clear();
                self.buffer.extend_from_slice(samples);
                self.silence_counter = 0;
                tracing::trace!(energy, "speech detected");
            }
            return None;
        }

        self.buffer.extend_from_slice(samples);
        if is_speech {
            self.silence_counter = 0;
        } else {
            self.silence_counter += samples.len();
        }

        let closed = self.silence_counter > SILENCE_SAMPLES;
        if (closed && self.buffer.len() > MIN_SPEECH_SAMPLES + self.silence_counter)
            || self.buffer.len() >= MAX_SEGMENT_SAMPLES
        {
            tracing::debug!(samples = self.buffer.len(), "speech segment complete");
            self.in_speech = false;
            self.silence_counter = 0;
            return Some(std::mem::take(&mut self.buffer));
        }

        if closed {
            // Too short to be words: a click or a cough
            tracing::trace!("segment too short, discarding");
            self.reset();
        }
        None
    }

    /// Drop any partial segment
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.silence_counter = 0;
        self.in_speech = false;
    }
}

struct Running {
    stop: Arc<AtomicBool>,
    muted: Arc<AtomicBool>,
    cancel: CancellationToken,
    capture_thread: std::thread::JoinHandle<()>,
    task: JoinHandle<()>,
}

/// Microphone recognizer using a cloud STT service
pub struct CloudRecognizer {
    stt: Arc<SpeechToText>,
    running: Mutex<Option<Running>>,
}

impl CloudRecognizer {
    /// Create a stopped recognizer
    #[must_use]
    pub fn new(stt: SpeechToText) -> Self {
        Self {
            stt: Arc::new(stt),
            running: Mutex::new(None),
        }
    }

    fn take_running(&self) -> Option<Running> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn muted_flag(&self) -> Option<Arc<AtomicBool>> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| Arc::clone(&r.muted))
    }
}

#[async_trait]
impl SpeechRecognizer for CloudRecognizer {
    async fn start(&self) -> Result<mpsc::Receiver<RecognitionEvent>> {
        self.stop().await;

        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<f32>>(64);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<Arc<AtomicBool>>>();
        let stop = Arc::new(AtomicBool::new(false));

        let thread_stop = Arc::clone(&stop);
        let capture_thread = std::thread::Builder::new()
            .name("parley-capture".to_string())
            .spawn(move || {
                let mut capture = match AudioCapture::new() {
                    Ok(capture) => capture,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = capture.start(chunk_tx) {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
                let _ = ready_tx.send(Ok(capture.mute_handle()));

                while !thread_stop.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(50));
                }
                capture.stop();
            })?;

        let muted = ready_rx
            .await
            .map_err(|_| Error::EngineUnavailable("capture thread exited".to_string()))??;

        let (events_tx, events_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(segment_and_transcribe(
            Arc::clone(&self.stt),
            chunk_rx,
            events_tx,
            Arc::clone(&muted),
            cancel.clone(),
        ));

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(Running {
            stop,
            muted,
            cancel,
            capture_thread,
            task,
        });

        tracing::debug!("cloud recognizer started");
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
        let Some(running) = self.take_running() else {
            return;
        };
        running.cancel.cancel();
        running.stop.store(true, Ordering::Relaxed);
        running.task.abort();

        let joined = tokio::task::spawn_blocking(move || running.capture_thread.join()).await;
        if !matches!(joined, Ok(Ok(()))) {
            tracing::warn!("capture thread did not shut down cleanly");
        }
        tracing::debug!("cloud recognizer stopped");
    }

    fn name(&self) -> &'static str {
        "cloud"
    }
}

async fn segment_and_transcribe(
    stt: Arc<SpeechToText>,
    mut chunks: mpsc::Receiver<Vec<f32>>,
    events: mpsc::Sender<RecognitionEvent>,
    muted: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut segmenter = VoiceActivitySegmenter::default();

    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => return,
            chunk = chunks.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            let _ = events
                .send(RecognitionEvent::Fault(Error::EngineUnavailable(
                    "capture stream closed".to_string(),
                )))
                .await;
            return;
        };

        if muted.load(Ordering::Relaxed) {
            segmenter.reset();
            continue;
        }

        let Some(segment) = segmenter.push(&chunk) else {
            continue;
        };

        let wav = match samples_to_wav(&segment, SAMPLE_RATE) {
            Ok(wav) => wav,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode segment");
                continue;
            }
        };

        match stt.transcribe(&wav).await {
            Ok(text) if text.is_empty() => {}
            Ok(text) => {
                if events.send(RecognitionEvent::Final(text)).await.is_err() {
                    return;
                }
            }
            Err(e @ Error::PermissionDenied(_)) => {
                let _ = events.send(RecognitionEvent::Fault(e)).await;
                return;
            }
            Err(e) => {
                // One lost segment is not worth tearing the stream down
                tracing::warn!(error = %e, "segment transcription failed");
            }
        }
    }
}

/// Speaker output using a cloud TTS service
pub struct CloudSynthesizer {
    tts: TextToSpeech,
}

impl CloudSynthesizer {
    /// Create a synthesizer
    #[must_use]
    pub const fn new(tts: TextToSpeech) -> Self {
        Self { tts }
    }
}

#[async_trait]
impl SpeechSynthesizer for CloudSynthesizer {
    async fn speak(
        &self,
        text: &str,
        rate: f32,
        level: &LevelMeter,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mp3 = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            mp3 = self.tts.synthesize(text, rate) => mp3?,
        };
        let audio = decode_mp3(&mp3)?;

        let stop = Arc::new(AtomicBool::new(false));
        let player_stop = Arc::clone(&stop);
        let player_level = level.clone();
        let mut player = tokio::task::spawn_blocking(move || {
            let playback = AudioPlayback::new()?;
            playback.play_blocking(audio, &player_stop, &player_level)
        });

        let played = tokio::select! {
            () = cancel.cancelled() => {
                stop.store(true, Ordering::Relaxed);
                let _ = player.await;
                return Ok(());
            }
            played = &mut player => played,
        };

        played
            .map_err(|e| Error::Audio(format!("playback task failed: {e}")))?
            .map(|_| ())
    }

    fn name(&self) -> &'static str {
        "cloud"
    }
}
