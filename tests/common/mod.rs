//! Shared test utilities
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use parley::voice::{
    ConsoleMicrophone, LevelMeter, RecognitionEvent, SpeechRecognizer, SpeechSynthesizer,
    console_microphone,
};
use parley::{
    BackendError, BackendResult, ConversationOrchestrator, ConversationState, ConversationTurn,
    Frame, FrameKind, FrameProducers, FrameSource, LanguageModelClient, OrchestratorSettings,
    SearchCollaborator, SearchResult, SessionHandle,
};

/// Delay between words revealed by the test microphone
pub const WORD_DELAY: Duration = Duration::from_millis(10);

/// One request seen by [`ScriptedBackend`]
#[derive(Debug, Clone)]
pub struct BackendCall {
    pub prompt: String,
    pub with_image: Option<FrameKind>,
    pub history_len: usize,
    pub at: Instant,
}

/// Language model that answers from a queue
///
/// When the queue is empty it answers "Noted."
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<BackendResult<String>>>,
    calls: Mutex<Vec<BackendCall>>,
    delay: Duration,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_replies(replies: impl IntoIterator<Item = BackendResult<String>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    async fn answer(
        &self,
        prompt: &str,
        image: Option<FrameKind>,
        history: &[ConversationTurn],
    ) -> BackendResult<String> {
        self.calls.lock().unwrap().push(BackendCall {
            prompt: prompt.to_string(),
            with_image: image,
            history_len: history.len(),
            at: Instant::now(),
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("Noted.".to_string()))
    }
}

#[async_trait]
impl LanguageModelClient for ScriptedBackend {
    async fn submit(&self, prompt: &str, history: &[ConversationTurn]) -> BackendResult<String> {
        self.answer(prompt, None, history).await
    }

    async fn submit_with_image(
        &self,
        prompt: &str,
        image: &Frame,
        history: &[ConversationTurn],
    ) -> BackendResult<String> {
        self.answer(prompt, Some(image.kind), history).await
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Shorthand for a rate-limit failure
pub fn rate_limited() -> BackendResult<String> {
    Err(BackendError::RateLimitExceeded)
}

/// One utterance handed to [`RecordingSynthesizer`]
#[derive(Debug, Clone)]
pub struct Spoken {
    pub text: String,
    pub at: Instant,
    pub interrupted: bool,
}

/// Speaker that records what it was asked to say
pub struct RecordingSynthesizer {
    spoken: Mutex<Vec<Spoken>>,
    duration: Duration,
}

impl RecordingSynthesizer {
    pub fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            spoken: Mutex::new(Vec::new()),
            duration,
        })
    }

    pub fn spoken(&self) -> Vec<Spoken> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.spoken().into_iter().map(|s| s.text).collect()
    }
}

#[async_trait]
impl SpeechSynthesizer for RecordingSynthesizer {
    async fn speak(
        &self,
        text: &str,
        _rate: f32,
        level: &LevelMeter,
        cancel: CancellationToken,
    ) -> parley::Result<()> {
        let index = {
            let mut spoken = self.spoken.lock().unwrap();
            spoken.push(Spoken {
                text: text.to_string(),
                at: Instant::now(),
                interrupted: false,
            });
            spoken.len() - 1
        };
        level.set(0.5);

        tokio::select! {
            () = cancel.cancelled() => {
                self.spoken.lock().unwrap()[index].interrupted = true;
            }
            () = tokio::time::sleep(self.duration) => {}
        }
        level.reset();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Recognizer whose engine refuses to open
pub struct DeniedRecognizer;

#[async_trait]
impl SpeechRecognizer for DeniedRecognizer {
    async fn start(&self) -> parley::Result<mpsc::Receiver<RecognitionEvent>> {
        Err(parley::Error::PermissionDenied("microphone access denied".to_string()))
    }

    async fn pause(&self) -> parley::Result<()> {
        Ok(())
    }

    async fn resume(&self) -> parley::Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    fn name(&self) -> &'static str {
        "denied"
    }
}

/// What one `start` of a [`ScriptedRecognizer`] does
pub enum Opening {
    /// Fail to open
    Refuse(parley::Error),
    /// Open and deliver these events, then stay quiet
    Emit(Vec<RecognitionEvent>),
}

/// Recognizer driven by a script of openings
///
/// Once the script runs out every start opens a quiet stream. Events can be
/// pushed into the live stream with [`emit`](Self::emit).
pub struct ScriptedRecognizer {
    openings: Mutex<VecDeque<Opening>>,
    live: Mutex<Option<mpsc::Sender<RecognitionEvent>>>,
    resume_in_place: bool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl ScriptedRecognizer {
    pub fn new(openings: impl IntoIterator<Item = Opening>) -> Arc<Self> {
        Arc::new(Self::build(openings, true))
    }

    /// A recognizer that can only resume by restarting
    pub fn restart_only(openings: impl IntoIterator<Item = Opening>) -> Arc<Self> {
        Arc::new(Self::build(openings, false))
    }

    fn build(openings: impl IntoIterator<Item = Opening>, resume_in_place: bool) -> Self {
        Self {
            openings: Mutex::new(openings.into_iter().collect()),
            live: Mutex::new(None),
            resume_in_place,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    /// Push an event into the open stream; false when nothing is open
    pub fn emit(&self, event: RecognitionEvent) -> bool {
        self.live
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| tx.try_send(event).is_ok())
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn start(&self) -> parley::Result<mpsc::Receiver<RecognitionEvent>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let opening = self.openings.lock().unwrap().pop_front();
        let events = match opening {
            Some(Opening::Refuse(e)) => return Err(e),
            Some(Opening::Emit(events)) => events,
            None => Vec::new(),
        };

        let (tx, rx) = mpsc::channel(32);
        for event in events {
            tx.try_send(event).unwrap();
        }
        *self.live.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn pause(&self) -> parley::Result<()> {
        Ok(())
    }

    async fn resume(&self) -> parley::Result<()> {
        if self.resume_in_place {
            Ok(())
        } else {
            Err(parley::Error::ResumeUnsupported)
        }
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().take();
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Search collaborator with canned results
#[derive(Default)]
pub struct CannedSearch {
    results: Vec<SearchResult>,
    queries: Mutex<Vec<String>>,
}

impl CannedSearch {
    pub fn new(results: Vec<SearchResult>) -> Arc<Self> {
        Arc::new(Self {
            results,
            queries: Mutex::new(Vec::new()),
        })
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchCollaborator for CannedSearch {
    async fn search(&self, query: &str, limit: usize) -> parley::Result<Vec<SearchResult>> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok(self.results.iter().take(limit).cloned().collect())
    }
}

/// Frame source that always has a tiny PNG
pub struct StillFrame(pub FrameKind);

#[async_trait]
impl FrameSource for StillFrame {
    fn kind(&self) -> FrameKind {
        self.0
    }

    async fn capture(&self) -> parley::Result<Frame> {
        Ok(Frame {
            kind: self.0,
            data: vec![0x89, b'P', b'N', b'G'],
            mime_type: "image/png".to_string(),
            captured_at: Utc::now(),
        })
    }
}

/// Settings for tests: no standalone wake listener, defaults otherwise
pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        wake_enabled: false,
        ..OrchestratorSettings::default()
    }
}

/// A running orchestrator wired to a typed microphone
pub struct Harness {
    pub session: SessionHandle,
    pub mic: ConsoleMicrophone,
    pub backend: Arc<ScriptedBackend>,
    pub speaker: Arc<RecordingSynthesizer>,
}

impl Harness {
    pub fn spawn(backend: Arc<ScriptedBackend>, speech: Duration) -> Self {
        Self::spawn_with(backend, speech, |builder| builder)
    }

    pub fn spawn_with(
        backend: Arc<ScriptedBackend>,
        speech: Duration,
        configure: impl FnOnce(parley::conversation::OrchestratorBuilder) -> parley::conversation::OrchestratorBuilder,
    ) -> Self {
        let (mic, recognizer) = console_microphone(WORD_DELAY);
        let speaker = RecordingSynthesizer::new(speech);
        let builder = ConversationOrchestrator::builder(
            backend.clone(),
            Arc::new(recognizer),
            speaker.clone(),
        )
        .settings(test_settings());
        let session = configure(builder).spawn();
        Self {
            session,
            mic,
            backend,
            speaker,
        }
    }

    /// Start a session and wait for standby
    pub async fn start(&self) {
        self.session.start().await.unwrap();
        self.wait_state(ConversationState::Standby).await;
    }

    pub fn say(&self, line: &str) {
        self.mic.say(line).unwrap();
    }

    pub async fn wait_state(&self, state: ConversationState) {
        self.session.wait_for(|s| s.state == state).await.unwrap();
    }

    /// Say something and wait until the exchange is over
    pub async fn exchange(&self, line: &str) {
        let before = self.backend.calls().len();
        self.say(line);
        self.session
            .wait_for(|s| s.state == ConversationState::Responding)
            .await
            .unwrap();
        self.wait_state(ConversationState::Standby).await;
        assert_eq!(self.backend.calls().len(), before + 1, "one request per exchange");
    }
}

/// Frame producers with a camera
pub fn camera() -> FrameProducers {
    FrameProducers::default().with_source(Arc::new(StillFrame(FrameKind::Camera)))
}
