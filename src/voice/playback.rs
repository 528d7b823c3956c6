//! Audio playback to speakers

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use super::engine::{LevelMeter, rms_energy};
use crate::{Error, Result};

/// Sample rate of common TTS output
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// RMS of normal speech sits well below 1.0; scale it up for display
const LEVEL_GAIN: f32 = 3.0;

/// Decoded mono audio
#[derive(Debug, Clone, Default)]
pub struct DecodedAudio {
    /// Samples in `-1.0..=1.0`
    pub samples: Vec<f32>,
    /// Samples per second
    pub sample_rate: u32,
}

/// Plays audio to the default output device
pub struct AudioPlayback {
    device: cpal::Device,
}

impl AudioPlayback {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if there is no output device
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        tracing::debug!(device = device.name().unwrap_or_default(), "audio playback initialized");
        Ok(Self { device })
    }

    fn config_for(&self, sample_rate: u32) -> Result<StreamConfig> {
        let rate = SampleRate(sample_rate);
        let fits = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
        };

        let supported = self
            .device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| fits(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                self.device.supported_output_configs().ok()?.find(|c| fits(c, 2))
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        Ok(supported.with_sample_rate(rate).config())
    }

    /// Play samples until done or `stop` is raised, publishing the level
    ///
    /// Blocks the calling thread; run it on a blocking task. Returns whether
    /// playback ran to the end.
    ///
    /// # Errors
    ///
    /// Returns error if the output stream fails
    pub fn play_blocking(
        &self,
        audio: DecodedAudio,
        stop: &AtomicBool,
        level: &LevelMeter,
    ) -> Result<bool> {
        if audio.samples.is_empty() {
            return Ok(true);
        }

        let config = self.config_for(audio.sample_rate)?;
        let channels = usize::from(config.channels);
        let total = audio.samples.len();

        let samples = Arc::new(audio.samples);
        let position = Arc::new(AtomicUsize::new(0));
        let halted = Arc::new(AtomicBool::new(false));
        let latest_level = Arc::new(Mutex::new(0.0f32));

        let stream = {
            let samples = Arc::clone(&samples);
            let position = Arc::clone(&position);
            let halted = Arc::clone(&halted);
            let latest_level = Arc::clone(&latest_level);
            self.device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let start = position.load(Ordering::Relaxed);
                        let mut pos = start;
                        let halt = halted.load(Ordering::Relaxed);
                        for frame in data.chunks_mut(channels) {
                            let sample = if !halt && pos < samples.len() {
                                pos += 1;
                                samples[pos - 1]
                            } else {
                                0.0
                            };
                            frame.fill(sample);
                        }
                        position.store(pos, Ordering::Relaxed);

                        let energy = rms_energy(&samples[start.min(samples.len())..pos]);
                        *latest_level.lock().unwrap_or_else(PoisonError::into_inner) = energy;
                    },
                    |err| {
                        tracing::error!(error = %err, "audio playback error");
                    },
                    None,
                )
                .map_err(|e| Error::Audio(e.to_string()))?
        };

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let duration_ms = (total as u64 * 1000) / u64::from(audio.sample_rate.max(1));
        let deadline = Instant::now() + Duration::from_millis(duration_ms + 500);

        let mut completed = false;
        while Instant::now() < deadline {
            if stop.load(Ordering::Relaxed) {
                halted.store(true, Ordering::Relaxed);
                break;
            }
            if position.load(Ordering::Relaxed) >= total {
                completed = true;
                break;
            }
            let energy = *latest_level.lock().unwrap_or_else(PoisonError::into_inner);
            level.set(energy * LEVEL_GAIN);
            std::thread::sleep(Duration::from_millis(20));
        }

        if completed {
            // Let the device drain its last buffer
            std::thread::sleep(Duration::from_millis(100));
        }

        drop(stream);
        level.reset();
        tracing::debug!(samples = total, completed, "playback finished");

        Ok(completed)
    }
}

/// Decode MP3 bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if the data is not valid MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut audio = DecodedAudio {
        samples: Vec::new(),
        sample_rate: PLAYBACK_SAMPLE_RATE,
    };

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if let Ok(rate) = u32::try_from(frame.sample_rate) {
                    audio.sample_rate = rate;
                }

                if frame.channels == 2 {
                    // Stereo: average channels
                    audio.samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    audio
                        .samples
                        .extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(audio)
}

/// A plain sine tone, for speaker checks
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn sine_tone(frequency: f32, duration: Duration, sample_rate: u32) -> DecodedAudio {
    let count = (duration.as_secs_f32() * sample_rate as f32) as usize;
    let samples = (0..count)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (t * frequency * std::f32::consts::TAU).sin() * 0.3
        })
        .collect();
    DecodedAudio {
        samples,
        sample_rate,
    }
}
