//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use parley::Error;
use parley::voice::{
    AudioEngineArbiter, ConsoleSynthesizer, RecognitionEvent, SAMPLE_RATE, SpeechOutcome,
    SpeechPlaybackController, TranscriptionStream, VoiceActivitySegmenter, WakePhraseMatcher,
    WakePhraseMonitor, console_microphone, rms_energy, samples_to_wav, sanitize_for_speech,
};

mod common;

use common::{Opening, ScriptedRecognizer};

const RETRY_DELAY: Duration = Duration::from_millis(500);

fn scripted_stream(
    recognizer: &Arc<ScriptedRecognizer>,
) -> (TranscriptionStream, tokio::sync::mpsc::UnboundedReceiver<Error>) {
    TranscriptionStream::new(recognizer.clone(), AudioEngineArbiter::new(Duration::ZERO), RETRY_DELAY)
}

fn device_lost() -> Error {
    Error::EngineUnavailable("device lost".to_string())
}

/// Generate sine wave audio samples
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn generate_silence(duration_secs: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    vec![0.0; num_samples]
}

/// Feed audio in 100 ms chunks, returning the first finished segment
fn feed(segmenter: &mut VoiceActivitySegmenter, samples: &[f32]) -> Option<Vec<f32>> {
    samples
        .chunks(1600)
        .find_map(|chunk| segmenter.push(chunk))
}

#[test]
fn test_speech_then_pause_makes_a_segment() {
    let mut segmenter = VoiceActivitySegmenter::default();

    assert!(feed(&mut segmenter, &generate_silence(0.3)).is_none());
    assert!(feed(&mut segmenter, &generate_sine_samples(440.0, 0.5, 0.3)).is_none());

    let segment = feed(&mut segmenter, &generate_silence(0.6)).expect("segment after pause");
    assert!(segment.len() >= 8000);

    // Nothing left over
    assert!(feed(&mut segmenter, &generate_silence(0.6)).is_none());
}

#[test]
fn test_quiet_hum_is_not_speech() {
    let mut segmenter = VoiceActivitySegmenter::default();
    let hum = generate_sine_samples(60.0, 2.0, 0.01);
    assert!(rms_energy(&hum) < 0.03);
    assert!(feed(&mut segmenter, &hum).is_none());
    assert!(feed(&mut segmenter, &generate_silence(1.0)).is_none());
}

#[test]
fn test_samples_to_wav() {
    let samples = generate_sine_samples(440.0, 0.1, 0.5);
    let wav_data = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

    // Check WAV header magic
    assert_eq!(&wav_data[0..4], b"RIFF");
    assert_eq!(&wav_data[8..12], b"WAVE");

    // WAV should have reasonable size
    assert!(wav_data.len() > 44); // WAV header is 44 bytes
}

#[test]
fn test_wav_roundtrip() {
    let original_samples: Vec<f32> = vec![0.0, 0.5, -0.5, 1.0, -1.0, 0.25];
    let wav_data = samples_to_wav(&original_samples, SAMPLE_RATE).unwrap();

    // Read WAV back
    let cursor = Cursor::new(wav_data);
    let mut reader = hound::WavReader::new(cursor).unwrap();

    let spec = reader.spec();
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);

    // Read samples back
    let read_samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read_samples.len(), original_samples.len());
}

#[test]
fn test_wake_phrase_normalization() {
    let matcher = WakePhraseMatcher::new(["  Hey PARLEY  ", "PARLEY"]);
    assert_eq!(matcher.phrases(), &["hey parley", "parley"]);

    let found = matcher.find("HEY, Parley! Weather?").unwrap();
    assert_eq!(found.phrase, "hey parley");
    assert_eq!(found.remainder, "weather");
}

#[tokio::test(start_paused = true)]
async fn test_wake_monitor_respects_arming_and_cooldown() {
    let (mut monitor, mut events) = WakePhraseMonitor::new(
        WakePhraseMatcher::new(["parley"]),
        Duration::from_secs(3),
        Duration::from_millis(1_300),
        AudioEngineArbiter::default(),
        None,
    );

    monitor.disarm();
    assert!(!monitor.observe("parley"));

    monitor.arm();
    assert!(monitor.observe("parley"));
    assert!(!monitor.observe("parley"));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(monitor.observe("parley are you there"));

    let first = events.recv().await.unwrap();
    assert!(!first.standalone);
    let second = events.recv().await.unwrap();
    assert_eq!(second.heard, "parley are you there");

    // No recognizer, nothing to listen with
    assert!(!monitor.listen_standalone());
}

#[test]
fn test_markdown_is_not_read_aloud() {
    let spoken = sanitize_for_speech(
        "Sure! Here are options:\n- **Urea** at [the co-op](https://example.com)\n- DAP 🌾",
    );
    assert_eq!(spoken, "Here are options: Urea at the co-op. DAP.");
}

#[tokio::test(start_paused = true)]
async fn test_console_speech_plays_out() {
    let mut controller = SpeechPlaybackController::new(Arc::new(ConsoleSynthesizer));
    let ticket = controller.speak("All done.", 1.0).await;
    assert_eq!(ticket.text, "All done.");
    assert!(controller.is_speaking());

    assert_eq!(ticket.done.await.unwrap(), SpeechOutcome::Completed);
    assert!(!controller.is_speaking());
    assert!(controller.audio_level().abs() < f32::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_console_speech_is_interruptible() {
    let mut controller = SpeechPlaybackController::new(Arc::new(ConsoleSynthesizer));
    let ticket = controller
        .speak(&"a fairly long sentence ".repeat(20), 1.0)
        .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.stop();
    assert!(!controller.is_speaking());
    assert_eq!(ticket.done.await.unwrap(), SpeechOutcome::Interrupted);
}

#[tokio::test(start_paused = true)]
async fn test_transcription_follows_typed_speech() {
    let (mic, recognizer) = console_microphone(common::WORD_DELAY);
    let (mut stream, _faults) =
        TranscriptionStream::new(Arc::new(recognizer), AudioEngineArbiter::default(), Duration::from_millis(10));
    let mut transcript = stream.subscribe();

    stream.start().await.unwrap();
    assert!(stream.is_running());

    mic.say("price of urea").unwrap();
    transcript
        .wait_for(|t| t.text == "price of urea")
        .await
        .unwrap();

    mic.say("in pune").unwrap();
    transcript
        .wait_for(|t| t.text == "price of urea in pune")
        .await
        .unwrap();

    stream.clear();
    assert!(stream.text().is_empty());

    // Paused input is dropped; resumed input is heard
    stream.pause().await.unwrap();
    assert!(stream.is_paused());
    mic.say("ignored").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(stream.text().is_empty());

    stream.resume().await.unwrap();
    mic.say("heard").unwrap();
    transcript.wait_for(|t| t.text == "heard").await.unwrap();

    stream.stop().await;
    assert!(!stream.is_running());
}

#[test]
fn test_sound_alike_words_do_not_wake() {
    let matcher = WakePhraseMatcher::new(["hey parley", "parley"]);
    assert!(matcher.find("barley prices today").is_none());
    assert!(matcher.find("hey parlay").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_transient_start_failure_is_retried_once() {
    let recognizer = ScriptedRecognizer::new([Opening::Refuse(device_lost())]);
    let (mut stream, _faults) = scripted_stream(&recognizer);

    let started = Instant::now();
    stream.start().await.unwrap();
    assert!(started.elapsed() >= RETRY_DELAY);
    assert_eq!(recognizer.starts(), 2);
    assert!(stream.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_denied_start_is_not_retried() {
    let recognizer = ScriptedRecognizer::new([Opening::Refuse(Error::PermissionDenied(
        "no consent".to_string(),
    ))]);
    let (mut stream, _faults) = scripted_stream(&recognizer);

    assert!(matches!(stream.start().await, Err(Error::PermissionDenied(_))));
    assert_eq!(recognizer.starts(), 1);
    assert!(!stream.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_stream_fault_restarts_once() {
    let recognizer = ScriptedRecognizer::new([
        Opening::Emit(vec![
            RecognitionEvent::Partial("price of".to_string()),
            RecognitionEvent::Fault(device_lost()),
        ]),
        Opening::Emit(vec![RecognitionEvent::Partial("price of urea".to_string())]),
    ]);
    let (mut stream, mut faults) = scripted_stream(&recognizer);
    let mut transcript = stream.subscribe();

    stream.start().await.unwrap();
    transcript
        .wait_for(|t| t.text == "price of urea")
        .await
        .unwrap();
    assert_eq!(recognizer.starts(), 2);
    assert!(faults.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_second_stream_fault_is_reported() {
    let recognizer = ScriptedRecognizer::new([
        Opening::Emit(vec![RecognitionEvent::Fault(device_lost())]),
        Opening::Emit(vec![RecognitionEvent::Fault(device_lost())]),
    ]);
    let (mut stream, mut faults) = scripted_stream(&recognizer);

    stream.start().await.unwrap();
    let fault = faults.recv().await.unwrap();
    assert!(matches!(fault, Error::EngineUnavailable(_)));
    assert_eq!(recognizer.starts(), 2);
    assert!(!stream.subscribe().borrow().running);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_faults_are_ignored() {
    let recognizer = ScriptedRecognizer::new([Opening::Emit(vec![
        RecognitionEvent::Fault(Error::EngineCancelled),
        RecognitionEvent::Partial("still here".to_string()),
    ])]);
    let (mut stream, mut faults) = scripted_stream(&recognizer);
    let mut transcript = stream.subscribe();

    stream.start().await.unwrap();
    transcript.wait_for(|t| t.text == "still here").await.unwrap();
    assert_eq!(recognizer.starts(), 1);
    assert!(faults.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_resume_falls_back_to_restart() {
    let recognizer = ScriptedRecognizer::restart_only([]);
    let (mut stream, _faults) = scripted_stream(&recognizer);
    let mut transcript = stream.subscribe();

    stream.start().await.unwrap();
    stream.pause().await.unwrap();
    assert!(stream.is_paused());

    stream.resume().await.unwrap();
    assert!(!stream.is_paused());
    assert!(stream.is_running());
    assert_eq!(recognizer.starts(), 2);
    assert_eq!(recognizer.stops(), 1);

    // The restarted session is the one being heard
    assert!(recognizer.emit(RecognitionEvent::Partial("back again".to_string())));
    transcript.wait_for(|t| t.text == "back again").await.unwrap();
}
