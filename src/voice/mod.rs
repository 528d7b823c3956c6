//! Voice I/O
//!
//! Engine-agnostic collaborators (transcription stream, wake monitor, speech
//! playback) plus the concrete engines behind them: cpal capture/playback with
//! cloud STT/TTS, and a terminal stand-in for running without audio hardware.

mod arbiter;
mod capture;
mod cloud;
mod console;
mod engine;
mod playback;
mod speech;
mod stt;
mod transcription;
mod tts;
mod wake;

pub use arbiter::{AudioEngineArbiter, DEFAULT_SETTLE_DELAY, EngineLease};
pub use capture::{AudioCapture, SAMPLE_RATE, samples_to_wav};
pub use cloud::{CloudRecognizer, CloudSynthesizer, VoiceActivitySegmenter};
pub use console::{
    ConsoleMicrophone, ConsoleRecognizer, ConsoleSynthesizer, DEFAULT_WORD_DELAY,
    console_microphone,
};
pub use engine::{LevelMeter, RecognitionEvent, SpeechRecognizer, SpeechSynthesizer, rms_energy};
pub use playback::{AudioPlayback, DecodedAudio, PLAYBACK_SAMPLE_RATE, decode_mp3, sine_tone};
pub use speech::{SpeechOutcome, SpeechPlaybackController, SpeechTicket, sanitize_for_speech};
pub use stt::{SpeechToText, SttProvider};
pub use transcription::{DEFAULT_RETRY_DELAY, TranscriptSnapshot, TranscriptionStream};
pub use tts::{TextToSpeech, TtsProvider};
pub use wake::{
    DEFAULT_WAKE_COOLDOWN, WakeEvent, WakeMatch, WakePhraseMatcher, WakePhraseMonitor,
};
