//! Conversation orchestrator
//!
//! A single actor task owns the session, the turn history and the rate-limit
//! bookkeeping. Everything that happens concurrently (transcript changes,
//! silence timers, backend replies, finished utterances, wake detections)
//! reaches it as a message, so turn-taking decisions are made one at a time
//! against a consistent view of the world.
//!
//! ```text
//!   SessionHandle ──commands──┐
//!   watchers ─────signals─────┤
//!   WakePhraseMonitor ─events─┼──► Orchestrator ──► watch<SessionSnapshot>
//!   TranscriptionStream ─faults┘        │
//!                                       ├──► SpeechPlaybackController
//!                                       └──► LanguageModelClient
//! ```

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use super::backoff::{BackoffPolicy, RateLimitState};
use super::echo::{DEFAULT_ECHO_WINDOW, DEFAULT_FILLER_PHRASES, EchoFilter, normalize};
use super::history::{ConversationTurn, DEFAULT_HISTORY_LIMIT, TurnHistory};
use super::intent::{detect_search_intent, detect_visual_query, enrich_prompt};
use super::segmenter::{
    DEFAULT_SILENCE_THRESHOLD, SubmitVerdict, TranscriptBaseline, UtteranceCandidate,
    evaluate_submission,
};
use super::state::{ConversationState, Session, SessionSnapshot};
use super::watchers::{WatcherKind, Watchers};
use crate::frames::FrameProducers;
use crate::llm::{BackendError, BackendResult, LanguageModelClient};
use crate::search::{DEFAULT_RESULT_LIMIT, SearchCollaborator};
use crate::voice::{
    AudioEngineArbiter, DEFAULT_RETRY_DELAY, DEFAULT_SETTLE_DELAY, DEFAULT_WAKE_COOLDOWN,
    SpeechOutcome, SpeechPlaybackController, SpeechRecognizer, SpeechSynthesizer, SpeechTicket,
    TranscriptionStream, WakeEvent, WakePhraseMatcher, WakePhraseMonitor,
};
use crate::{Error, Result};

/// Default wait for a backend answer
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default quiet stretch in `Standby` before the idle hook fires
pub const DEFAULT_STANDBY_IDLE: Duration = Duration::from_secs(10);

/// Default re-check interval while waiting on playback
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default number of new characters that count as barge-in
pub const DEFAULT_BARGE_IN_MIN_CHARS: usize = 3;

/// Default activation phrases
pub const DEFAULT_WAKE_PHRASES: &[&str] = &["hey parley", "parley"];

/// Default replies to a bare wake phrase
pub const DEFAULT_ACKNOWLEDGEMENTS: &[&str] = &["I'm listening.", "Yes?", "Go ahead."];

const TIMEOUT_APOLOGY: &str = "Sorry, that took too long. Please say it again.";
const CREDENTIAL_APOLOGY: &str =
    "Sorry, the assistant service rejected my credentials. Please check the configuration.";
const UNAVAILABLE_APOLOGY: &str = "Sorry, the assistant service is unavailable right now.";
const GENERIC_APOLOGY: &str = "Sorry, something went wrong. Please try again.";
const MICROPHONE_APOLOGY: &str = "Sorry, I can't hear you. Microphone access was denied.";
const RECOGNITION_APOLOGY: &str = "Sorry, I stopped being able to hear you.";

/// How often the published level is refreshed while speaking
const LEVEL_REFRESH: Duration = Duration::from_millis(100);

/// Tunables for turn-taking
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Unchanged-transcript time that ends an utterance
    pub silence_threshold: Duration,
    /// Wait for a backend answer before apologizing
    pub response_timeout: Duration,
    /// Quiet time in `Standby` before the idle hook
    pub standby_idle: Duration,
    /// Re-check interval while playback blocks a submission
    pub poll_interval: Duration,
    /// Window during which a repeated wake phrase is dropped
    pub wake_cooldown: Duration,
    /// Pause between microphone hand-offs
    pub engine_settle: Duration,
    /// Delay before retrying a transient engine failure
    pub retry_delay: Duration,
    /// Retained conversation turns
    pub history_limit: usize,
    /// New characters needed to interrupt the agent
    pub barge_in_min_chars: usize,
    /// Leading characters of agent speech used for echo checks
    pub echo_window: usize,
    /// Speaking rate handed to the synthesizer
    pub speech_rate: f32,
    /// Keep the microphone open during replies so the user can interrupt
    pub listen_while_speaking: bool,
    /// Rate-limit backoff
    pub backoff: BackoffPolicy,
    /// Listen for the wake phrase while no session is running
    pub wake_enabled: bool,
    /// Activation phrases
    pub wake_phrases: Vec<String>,
    /// Replies to a bare wake phrase
    pub acknowledgements: Vec<String>,
    /// Search results used to enrich a prompt
    pub search_limit: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            standby_idle: DEFAULT_STANDBY_IDLE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            wake_cooldown: DEFAULT_WAKE_COOLDOWN,
            engine_settle: DEFAULT_SETTLE_DELAY,
            retry_delay: DEFAULT_RETRY_DELAY,
            history_limit: DEFAULT_HISTORY_LIMIT,
            barge_in_min_chars: DEFAULT_BARGE_IN_MIN_CHARS,
            echo_window: DEFAULT_ECHO_WINDOW,
            speech_rate: 1.0,
            listen_while_speaking: true,
            backoff: BackoffPolicy::default(),
            wake_enabled: true,
            wake_phrases: DEFAULT_WAKE_PHRASES.iter().map(ToString::to_string).collect(),
            acknowledgements: DEFAULT_ACKNOWLEDGEMENTS
                .iter()
                .map(ToString::to_string)
                .collect(),
            search_limit: DEFAULT_RESULT_LIMIT,
        }
    }
}

#[derive(Debug)]
enum Command {
    Start(oneshot::Sender<Result<()>>),
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<Result<()>>),
    End(oneshot::Sender<()>),
    ToggleSubtitles(oneshot::Sender<bool>),
    History(oneshot::Sender<Vec<ConversationTurn>>),
    Shutdown(oneshot::Sender<()>),
}

/// What to do once a system notice has been spoken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterNotice {
    /// Exchange is over
    Standby,
    /// A wake phrase was acknowledged; the next utterance belongs to it
    AwaitUtterance,
    /// A rate-limited request goes out again once the wait is over
    RetryPending,
    /// Input is gone; the session waits in `Paused` until resumed
    Suspend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpeechPurpose {
    Response,
    Notice(AfterNotice),
}

#[derive(Debug)]
enum Signal {
    TranscriptChanged {
        generation: u64,
        text: String,
    },
    AutoSubmitDue {
        generation: u64,
    },
    ResponseTimedOut {
        generation: u64,
    },
    StandbyIdle {
        generation: u64,
    },
    BackendReply {
        generation: u64,
        user_input: String,
        result: BackendResult<String>,
    },
    SpeechFinished {
        generation: u64,
        purpose: SpeechPurpose,
        outcome: SpeechOutcome,
    },
}

/// Assembles an orchestrator and spawns it
pub struct OrchestratorBuilder {
    settings: OrchestratorSettings,
    backend: Arc<dyn LanguageModelClient>,
    recognizer: Arc<dyn SpeechRecognizer>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    wake_recognizer: Option<Arc<dyn SpeechRecognizer>>,
    search: Option<Arc<dyn SearchCollaborator>>,
    frames: FrameProducers,
    arbiter: Option<AudioEngineArbiter>,
}

impl OrchestratorBuilder {
    /// Replace the default tunables
    #[must_use]
    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Recognizer used for wake detection while no session runs
    #[must_use]
    pub fn wake_recognizer(mut self, recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        self.wake_recognizer = Some(recognizer);
        self
    }

    /// Enable search-based prompt enrichment
    #[must_use]
    pub fn search(mut self, search: Arc<dyn SearchCollaborator>) -> Self {
        self.search = Some(search);
        self
    }

    /// Camera/screen frame producers for visual queries
    #[must_use]
    pub fn frames(mut self, frames: FrameProducers) -> Self {
        self.frames = frames;
        self
    }

    /// Share an arbiter with other microphone users
    #[must_use]
    pub fn arbiter(mut self, arbiter: AudioEngineArbiter) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    /// Spawn the orchestrator on the current runtime
    #[must_use]
    pub fn spawn(self) -> SessionHandle {
        let settings = self.settings;
        let arbiter = self
            .arbiter
            .unwrap_or_else(|| AudioEngineArbiter::new(settings.engine_settle));

        let (transcription, faults) =
            TranscriptionStream::new(self.recognizer, arbiter.clone(), settings.retry_delay);
        let (wake, wake_events) = WakePhraseMonitor::new(
            WakePhraseMatcher::new(&settings.wake_phrases),
            settings.wake_cooldown,
            settings.silence_threshold,
            arbiter,
            self.wake_recognizer,
        );

        let mut echo = EchoFilter::new(DEFAULT_FILLER_PHRASES.iter().copied(), settings.echo_window);
        echo.extend_wake_phrases(&settings.wake_phrases);
        echo.extend_phrases(&settings.acknowledgements);

        let (commands_tx, commands) = mpsc::channel(16);
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let orchestrator = Orchestrator {
            history: TurnHistory::new(settings.history_limit),
            settings,
            session: Session::default(),
            rate_limit: RateLimitState::default(),
            candidate: UtteranceCandidate::default(),
            baseline: TranscriptBaseline::default(),
            held: String::new(),
            strip_leading_echo: false,
            last_submitted: None,
            speaking: None,
            subtitle: String::new(),
            echo,
            transcription,
            wake,
            speech: SpeechPlaybackController::new(self.synthesizer),
            backend: self.backend,
            search: self.search,
            frames: self.frames,
            watchers: Watchers::default(),
            signals_tx,
            snapshot,
        };

        tokio::spawn(orchestrator.run(commands, signals, wake_events, faults));
        SessionHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        }
    }
}

/// Control surface of a running orchestrator
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

/// Entry point for building an orchestrator
pub struct ConversationOrchestrator;

impl ConversationOrchestrator {
    /// Start assembling an orchestrator from its required collaborators
    #[must_use]
    pub fn builder(
        backend: Arc<dyn LanguageModelClient>,
        recognizer: Arc<dyn SpeechRecognizer>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            settings: OrchestratorSettings::default(),
            backend,
            recognizer,
            synthesizer,
            wake_recognizer: None,
            search: None,
            frames: FrameProducers::default(),
            arbiter: None,
        }
    }
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Start a session; a no-op while one is active
    ///
    /// # Errors
    ///
    /// Returns error if transcription cannot start or the orchestrator is gone
    pub async fn start(&self) -> Result<()> {
        self.request(Command::Start).await?
    }

    /// Suspend the session; a no-op when inactive or already paused
    ///
    /// # Errors
    ///
    /// Returns error if the orchestrator is gone
    pub async fn pause(&self) -> Result<()> {
        self.request(Command::Pause).await
    }

    /// Resume a paused session; a no-op when not paused
    ///
    /// # Errors
    ///
    /// Returns error if transcription cannot restart or the orchestrator is gone
    pub async fn resume(&self) -> Result<()> {
        self.request(Command::Resume).await?
    }

    /// End the session, stopping every stream and clearing history
    ///
    /// # Errors
    ///
    /// Returns error if the orchestrator is gone
    pub async fn end(&self) -> Result<()> {
        self.request(Command::End).await
    }

    /// Flip subtitles; returns the new setting
    ///
    /// # Errors
    ///
    /// Returns error if the orchestrator is gone
    pub async fn toggle_subtitles(&self) -> Result<bool> {
        self.request(Command::ToggleSubtitles).await
    }

    /// Retained conversation turns, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if the orchestrator is gone
    pub async fn history(&self) -> Result<Vec<ConversationTurn>> {
        self.request(Command::History).await
    }

    /// End any session and stop the orchestrator
    ///
    /// # Errors
    ///
    /// Returns error if the orchestrator is already gone
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    /// Latest published state
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Current turn-taking state
    #[must_use]
    pub fn current_state(&self) -> ConversationState {
        self.snapshot.borrow().state
    }

    /// Observe state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the published state satisfies `predicate`
    ///
    /// # Errors
    ///
    /// Returns error if the orchestrator stops first
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| Error::SessionClosed)?;
        Ok(snapshot.clone())
    }
}

struct Orchestrator {
    settings: OrchestratorSettings,
    session: Session,
    history: TurnHistory,
    rate_limit: RateLimitState,
    candidate: UtteranceCandidate,
    baseline: TranscriptBaseline,
    // Candidate text accumulated before the current transcript baseline
    held: String,
    // Set by barge-in: the transcript still opens with our own voice
    strip_leading_echo: bool,
    last_submitted: Option<String>,
    speaking: Option<SpeechPurpose>,
    subtitle: String,
    echo: EchoFilter,
    transcription: TranscriptionStream,
    wake: WakePhraseMonitor,
    speech: SpeechPlaybackController,
    backend: Arc<dyn LanguageModelClient>,
    search: Option<Arc<dyn SearchCollaborator>>,
    frames: FrameProducers,
    watchers: Watchers,
    signals_tx: mpsc::UnboundedSender<Signal>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl Orchestrator {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
        mut wake_events: mpsc::UnboundedReceiver<WakeEvent>,
        mut faults: mpsc::UnboundedReceiver<Error>,
    ) {
        if self.settings.wake_enabled {
            self.wake.listen_standalone();
        }

        let mut level_refresh = tokio::time::interval(LEVEL_REFRESH);
        level_refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.end().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(signal) = signals.recv() => self.handle_signal(signal).await,
                Some(event) = wake_events.recv() => self.on_wake(event).await,
                Some(fault) = faults.recv() => self.on_fault(fault).await,
                _ = level_refresh.tick(), if self.speaking.is_some() || self.snapshot.borrow().is_speaking => {}
            }
            self.publish();
        }

        self.end().await;
        self.wake.stop_standalone().await;
        tracing::debug!("orchestrator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Command::Pause(reply) => {
                self.pause().await;
                let _ = reply.send(());
            }
            Command::Resume(reply) => {
                let result = self.resume().await;
                let _ = reply.send(result);
            }
            Command::End(reply) => {
                self.end().await;
                let _ = reply.send(());
            }
            Command::ToggleSubtitles(reply) => {
                self.session.subtitles_enabled = !self.session.subtitles_enabled;
                tracing::debug!(enabled = self.session.subtitles_enabled, "subtitles toggled");
                let _ = reply.send(self.session.subtitles_enabled);
            }
            Command::History(reply) => {
                let _ = reply.send(self.history.to_vec());
            }
            Command::Shutdown(reply) => {
                // Handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    async fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::TranscriptChanged { generation, text } => {
                if self.watchers.is_current(WatcherKind::TranscriptChange, generation) {
                    self.on_transcript(&text).await;
                }
            }
            Signal::AutoSubmitDue { generation } => {
                if self.watchers.retire(WatcherKind::AutoSubmit, generation) {
                    self.on_auto_submit_due().await;
                }
            }
            Signal::ResponseTimedOut { generation } => {
                if self.watchers.retire(WatcherKind::ResponseTimeout, generation) {
                    self.on_response_timeout().await;
                }
            }
            Signal::StandbyIdle { generation } => {
                if self.watchers.retire(WatcherKind::StandbyIdle, generation) {
                    self.on_standby_idle();
                }
            }
            Signal::BackendReply {
                generation,
                user_input,
                result,
            } => {
                if self.watchers.retire(WatcherKind::Backend, generation) {
                    self.on_backend_reply(user_input, result).await;
                } else {
                    tracing::debug!("dropping reply to an abandoned request");
                }
            }
            Signal::SpeechFinished {
                generation,
                purpose,
                outcome,
            } => {
                if self.watchers.retire(WatcherKind::Speech, generation) {
                    self.on_speech_finished(purpose, outcome).await;
                }
            }
        }
    }

    // -- control surface --

    async fn start(&mut self) -> Result<()> {
        if self.session.active {
            return Ok(());
        }

        self.wake.stop_standalone().await;
        if let Err(e) = self.transcription.start().await {
            tracing::error!(error = %e, "could not start transcription");
            self.session.last_error = Some(e.to_string());
            if self.settings.wake_enabled {
                self.wake.listen_standalone();
            }
            return Err(e);
        }

        let id = self.session.begin();
        tracing::info!(session_id = %id, "session started");
        self.reset_turn();
        self.last_submitted = None;
        self.wake.arm();
        self.arm_transcript_watcher();
        self.transition(ConversationState::Standby, "session started");
        Ok(())
    }

    async fn pause(&mut self) {
        if !self.session.active || self.session.paused {
            return;
        }

        if self.watchers.is_armed(WatcherKind::Backend) {
            // The request is abandoned, so asking again must not look like a repeat
            self.last_submitted = None;
        }
        tracing::info!("session paused");
        self.suspend("pause requested").await;
    }

    async fn suspend(&mut self, reason: &'static str) {
        self.watchers.cancel_all();
        self.speech.stop();
        self.speaking = None;
        self.subtitle.clear();
        self.transcription.stop().await;
        self.reset_turn();
        self.session.paused = true;
        self.transition(ConversationState::Paused, reason);
    }

    async fn resume(&mut self) -> Result<()> {
        if !self.session.active || !self.session.paused {
            return Ok(());
        }

        if let Err(e) = self.transcription.start().await {
            tracing::error!(error = %e, "could not restart transcription");
            self.session.last_error = Some(e.to_string());
            return Err(e);
        }

        self.session.paused = false;
        tracing::info!("session resumed");
        self.wake.arm();
        self.arm_transcript_watcher();
        self.transition(ConversationState::Standby, "resume requested");
        Ok(())
    }

    async fn end(&mut self) {
        if !self.session.active {
            return;
        }

        self.watchers.cancel_all();
        self.speech.stop();
        self.speaking = None;
        self.subtitle.clear();
        self.transcription.stop().await;
        self.reset_turn();
        self.last_submitted = None;
        self.history.clear();
        self.echo.forget_spoken();
        self.session.finish();
        tracing::info!("session ended");
        self.publish();

        if self.settings.wake_enabled {
            self.wake.arm();
            self.wake.listen_standalone();
        }
    }

    // -- transcript handling --

    async fn on_transcript(&mut self, transcript: &str) {
        if !self.session.active || self.session.paused {
            return;
        }

        let fresh = self.baseline.fresh(transcript).trim().to_string();
        if fresh.is_empty() {
            return;
        }

        match self.session.state {
            ConversationState::Standby | ConversationState::Listening => {
                self.on_user_speech(&fresh);
            }
            ConversationState::Thinking => self.on_speech_while_thinking(&fresh),
            ConversationState::Responding => self.on_speech_while_responding(&fresh).await,
            ConversationState::Paused => {}
        }
    }

    fn on_user_speech(&mut self, fresh: &str) {
        if self.strip_leading_echo {
            let stripped = self.echo.strip_echo(fresh);
            if !stripped.is_empty() && self.accumulate(&stripped) {
                self.arm_auto_submit(self.settings.silence_threshold);
            }
            return;
        }

        if self.echo.is_echo(fresh) {
            tracing::trace!(heard = %fresh, "ignoring echo");
            return;
        }

        // A leading wake phrase stays in the candidate; silence decides
        // whether it was said alone or ahead of a request
        let request = match self.wake.matcher().find(fresh) {
            Some(found) if found.leading => found.remainder,
            _ => fresh.to_string(),
        };
        if !request.is_empty() && self.echo.should_ignore(&request) {
            tracing::trace!(heard = %request, "ignoring echo or filler");
            return;
        }
        if !self.accumulate(fresh) {
            return;
        }

        if !request.is_empty() && self.session.state == ConversationState::Standby {
            self.transition(ConversationState::Listening, "speech detected");
        }
        self.arm_auto_submit(self.settings.silence_threshold);
    }

    fn on_speech_while_thinking(&mut self, fresh: &str) {
        if self.echo.should_ignore(fresh) {
            return;
        }
        // Held until the current exchange is over
        if self.accumulate(fresh) {
            tracing::debug!(heard = %self.candidate.text(), "holding speech heard while thinking");
        }
    }

    async fn on_speech_while_responding(&mut self, fresh: &str) {
        if self.speaking != Some(SpeechPurpose::Response) || self.echo.should_ignore(fresh) {
            return;
        }

        let heard = self.echo.strip_echo(fresh);
        let heard = match self.wake.matcher().find(&heard) {
            Some(found) if found.leading => found.remainder,
            _ => heard,
        };
        if self.echo.should_ignore(&heard)
            || normalize(&heard).chars().count() < self.settings.barge_in_min_chars
        {
            return;
        }

        tracing::info!(heard = %heard, "barge-in, interrupting reply");
        self.speech.stop();
        self.speaking = None;
        self.subtitle.clear();
        self.watchers.cancel(WatcherKind::Speech);
        self.watchers.cancel(WatcherKind::Backend);
        self.watchers.cancel(WatcherKind::ResponseTimeout);

        self.strip_leading_echo = true;
        self.accumulate(&heard);
        self.transition(ConversationState::Listening, "barge-in");
        self.arm_auto_submit(self.settings.silence_threshold);
    }

    /// Set the candidate to held text plus `heard`; returns whether it changed
    fn accumulate(&mut self, heard: &str) -> bool {
        let text = join_utterance(&self.held, heard);
        self.candidate.update(&text, Instant::now())
    }

    fn reset_turn(&mut self) {
        self.candidate.reset();
        self.baseline.clear();
        self.held.clear();
        self.strip_leading_echo = false;
        self.transcription.clear();
    }

    // -- submission --

    async fn on_auto_submit_due(&mut self) {
        // A bare wake phrase waits in the candidate without leaving Standby
        let pending_wake =
            self.session.state == ConversationState::Standby && !self.candidate.is_empty();
        if !self.session.active
            || self.session.paused
            || (self.session.state != ConversationState::Listening && !pending_wake)
        {
            return;
        }

        let now = Instant::now();
        let backoff = self.rate_limit.check(&self.settings.backoff, now);
        if backoff.should_wait {
            tracing::debug!(remaining_ms = backoff.remaining.as_millis(), "holding submission for rate limit");
            self.arm_auto_submit(backoff.remaining);
            return;
        }

        let verdict = evaluate_submission(
            &self.candidate,
            self.last_submitted.as_deref(),
            !self.speech.is_speaking(),
            self.settings.silence_threshold,
            now,
        );
        match verdict {
            SubmitVerdict::Submit(utterance) => self.settle_utterance(utterance),
            SubmitVerdict::TooSoon(remaining) => self.arm_auto_submit(remaining),
            SubmitVerdict::PlaybackActive => self.arm_auto_submit(self.settings.poll_interval),
            SubmitVerdict::Empty => {
                self.transition(ConversationState::Standby, "nothing to submit");
            }
            SubmitVerdict::Duplicate => {
                tracing::debug!(utterance = %self.candidate.text(), "dropping repeated utterance");
                self.reset_turn();
                self.transition(ConversationState::Standby, "duplicate utterance");
            }
        }
    }

    /// Strip a leading wake phrase; a bare one goes to the wake monitor
    fn settle_utterance(&mut self, utterance: String) {
        match self.wake.matcher().find(&utterance) {
            Some(found) if found.leading && found.remainder.is_empty() => {
                self.reset_turn();
                self.transition(ConversationState::Standby, "bare wake phrase");
                if !self.wake.observe(&utterance) {
                    tracing::debug!(heard = %utterance, "wake phrase not acknowledged");
                }
            }
            Some(found) if found.leading => {
                tracing::debug!(phrase = %found.phrase, "wake phrase ahead of request");
                self.submit(found.remainder);
            }
            _ => self.submit(utterance),
        }
    }

    fn submit(&mut self, utterance: String) {
        tracing::info!(utterance = %utterance, "submitting utterance");
        self.last_submitted = Some(utterance.clone());
        self.reset_turn();
        self.transition(ConversationState::Thinking, "utterance complete");
        self.arm_response_timeout();
        self.arm_backend(utterance);
    }

    async fn on_backend_reply(&mut self, user_input: String, result: BackendResult<String>) {
        // Never let the timeout race a real answer
        self.watchers.cancel(WatcherKind::ResponseTimeout);
        if self.session.state != ConversationState::Thinking {
            return;
        }

        match result {
            Ok(response) => {
                tracing::info!(chars = response.len(), "response received");
                self.history
                    .push(ConversationTurn::new(user_input, response.clone()));
                self.session.last_response.clone_from(&response);
                self.speak(&response, SpeechPurpose::Response).await;
            }
            Err(BackendError::RateLimitExceeded) => {
                let now = Instant::now();
                let wait = self.rate_limit.record_failure(&self.settings.backoff, now);
                tracing::warn!(
                    failures = self.rate_limit.consecutive_failures,
                    wait_secs = wait.as_secs(),
                    "backend rate limited"
                );

                // Requeue the request ahead of anything said since
                self.last_submitted = None;
                let text = join_utterance(&user_input, self.candidate.text());
                self.candidate.update(&text, now);

                let backoff = self.rate_limit.check(&self.settings.backoff, now);
                let notice = format!(
                    "I'm getting too many requests. I'll try again in {} seconds.",
                    backoff.remaining_secs().max(1)
                );
                self.speak(&notice, SpeechPurpose::Notice(AfterNotice::RetryPending))
                    .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "backend request failed");
                self.last_submitted = None;
                self.speak(apology_for(&e), SpeechPurpose::Notice(AfterNotice::Standby))
                    .await;
            }
        }
    }

    async fn on_response_timeout(&mut self) {
        if self.session.state != ConversationState::Thinking {
            return;
        }

        tracing::warn!(
            timeout_secs = self.settings.response_timeout.as_secs(),
            "backend did not answer in time"
        );
        self.watchers.cancel(WatcherKind::Backend);
        self.last_submitted = None;
        self.speak(TIMEOUT_APOLOGY, SpeechPurpose::Notice(AfterNotice::Standby))
            .await;
    }

    // -- speech --

    async fn speak(&mut self, text: &str, purpose: SpeechPurpose) {
        let pause_input = match purpose {
            SpeechPurpose::Response => !self.settings.listen_while_speaking,
            SpeechPurpose::Notice(_) => true,
        };
        // Input pauses strictly before output starts
        if pause_input {
            if let Err(e) = self.transcription.pause().await {
                tracing::warn!(error = %e, "could not pause transcription");
            }
        }

        let SpeechTicket { text: spoken, done } =
            self.speech.speak(text, self.settings.speech_rate).await;
        self.echo.remember_spoken(&spoken);
        self.subtitle = spoken;
        self.speaking = Some(purpose);
        self.baseline.mark(&self.transcription.text());
        self.held = self.candidate.text().to_string();
        self.watchers.cancel(WatcherKind::AutoSubmit);

        let signals = self.signals_tx.clone();
        self.watchers.arm(WatcherKind::Speech, move |generation| async move {
            let outcome = done.await.unwrap_or(SpeechOutcome::Interrupted);
            let _ = signals.send(Signal::SpeechFinished {
                generation,
                purpose,
                outcome,
            });
        });

        let reason = match purpose {
            SpeechPurpose::Response => "speaking response",
            SpeechPurpose::Notice(_) => "speaking notice",
        };
        self.transition(ConversationState::Responding, reason);
    }

    async fn on_speech_finished(&mut self, purpose: SpeechPurpose, outcome: SpeechOutcome) {
        tracing::debug!(?purpose, ?outcome, "speech finished");
        self.speaking = None;
        self.subtitle.clear();

        let resume_input = match purpose {
            SpeechPurpose::Response => !self.settings.listen_while_speaking,
            SpeechPurpose::Notice(_) => true,
        };
        // Output confirmed finished before input resumes
        if resume_input {
            if let Err(e) = self.transcription.resume().await {
                tracing::error!(error = %e, "could not resume transcription");
                self.session.last_error = Some(e.to_string());
            }
        }
        // Whatever the microphone caught of our own voice is spent
        self.baseline.mark(&self.transcription.text());

        match purpose {
            SpeechPurpose::Response | SpeechPurpose::Notice(AfterNotice::Standby) => {
                self.wake.arm();
                self.settle_after_exchange();
            }
            SpeechPurpose::Notice(AfterNotice::AwaitUtterance) => {
                self.transition(ConversationState::Standby, "awaiting utterance");
            }
            SpeechPurpose::Notice(AfterNotice::RetryPending) => {
                let backoff = self.rate_limit.check(&self.settings.backoff, Instant::now());
                self.transition(ConversationState::Listening, "retry pending");
                self.arm_auto_submit(backoff.remaining.max(self.settings.poll_interval));
            }
            SpeechPurpose::Notice(AfterNotice::Suspend) => {
                tracing::info!("session paused until resumed");
                self.suspend("transcription lost").await;
            }
        }
    }

    fn settle_after_exchange(&mut self) {
        if self.candidate.is_empty() {
            self.transition(ConversationState::Standby, "exchange complete");
        } else {
            self.transition(ConversationState::Listening, "speech held during exchange");
            self.arm_auto_submit(self.settings.poll_interval);
        }
    }

    // -- wake and faults --

    async fn on_wake(&mut self, event: WakeEvent) {
        if !self.session.active {
            tracing::info!(phrase = %event.phrase, "wake phrase starts a session");
            if self.start().await.is_err() {
                return;
            }

            let request = self
                .wake
                .matcher()
                .find(&event.heard)
                .map(|found| found.remainder)
                .unwrap_or_default();
            self.wake.disarm();
            if request.is_empty() {
                self.acknowledge().await;
            } else {
                self.accumulate(&request);
                self.transition(ConversationState::Listening, "wake phrase with request");
                self.arm_auto_submit(self.settings.silence_threshold);
            }
            return;
        }

        if self.session.paused || self.session.state != ConversationState::Standby {
            tracing::debug!(state = %self.session.state, "ignoring wake phrase");
            return;
        }
        self.wake.disarm();
        self.acknowledge().await;
    }

    async fn acknowledge(&mut self) {
        let phrase = self.pick_acknowledgement();
        self.speak(&phrase, SpeechPurpose::Notice(AfterNotice::AwaitUtterance))
            .await;
    }

    fn pick_acknowledgement(&self) -> String {
        self.settings
            .acknowledgements
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| "Yes?".to_string())
    }

    async fn on_fault(&mut self, fault: Error) {
        if fault.is_cancellation() {
            tracing::debug!(error = %fault, "recognition cancelled");
            return;
        }
        if !self.session.active || self.session.paused {
            return;
        }

        tracing::error!(error = %fault, "transcription failed");
        self.session.last_error = Some(fault.to_string());
        if self.watchers.is_armed(WatcherKind::Backend) {
            self.last_submitted = None;
        }
        self.watchers.cancel_all();
        self.transcription.stop().await;

        // Nothing is captured any more; resume() reopens the stream
        let notice = if matches!(fault, Error::PermissionDenied(_)) {
            MICROPHONE_APOLOGY
        } else {
            RECOGNITION_APOLOGY
        };
        self.speak(notice, SpeechPurpose::Notice(AfterNotice::Suspend))
            .await;
    }

    fn on_standby_idle(&mut self) {
        if self.session.state != ConversationState::Standby {
            return;
        }
        tracing::debug!("standby idle");
        // A wake acknowledgement nobody followed up on has run its course
        self.wake.arm();
    }

    // -- watchers --

    fn arm_transcript_watcher(&mut self) {
        let mut rx = self.transcription.subscribe();
        let signals = self.signals_tx.clone();
        self.watchers
            .arm(WatcherKind::TranscriptChange, move |generation| async move {
                let mut last = rx.borrow_and_update().text.clone();
                while rx.changed().await.is_ok() {
                    let text = rx.borrow_and_update().text.clone();
                    if text == last {
                        continue;
                    }
                    last.clone_from(&text);
                    if signals
                        .send(Signal::TranscriptChanged { generation, text })
                        .is_err()
                    {
                        break;
                    }
                }
            });
    }

    fn arm_auto_submit(&mut self, after: Duration) {
        let signals = self.signals_tx.clone();
        self.watchers
            .arm(WatcherKind::AutoSubmit, move |generation| async move {
                tokio::time::sleep(after).await;
                let _ = signals.send(Signal::AutoSubmitDue { generation });
            });
    }

    fn arm_response_timeout(&mut self) {
        let timeout = self.settings.response_timeout;
        let signals = self.signals_tx.clone();
        self.watchers
            .arm(WatcherKind::ResponseTimeout, move |generation| async move {
                tokio::time::sleep(timeout).await;
                let _ = signals.send(Signal::ResponseTimedOut { generation });
            });
    }

    fn arm_standby_idle(&mut self) {
        let idle = self.settings.standby_idle;
        let signals = self.signals_tx.clone();
        self.watchers
            .arm(WatcherKind::StandbyIdle, move |generation| async move {
                tokio::time::sleep(idle).await;
                let _ = signals.send(Signal::StandbyIdle { generation });
            });
    }

    fn arm_backend(&mut self, utterance: String) {
        let backend = Arc::clone(&self.backend);
        let search = self.search.clone();
        let frames = self.frames.clone();
        let history = self.history.to_vec();
        let limit = self.settings.search_limit;
        let signals = self.signals_tx.clone();
        self.watchers
            .arm(WatcherKind::Backend, move |generation| async move {
                let result = request_response(
                    backend.as_ref(),
                    search.as_deref(),
                    &frames,
                    &utterance,
                    &history,
                    limit,
                )
                .await;
                let _ = signals.send(Signal::BackendReply {
                    generation,
                    user_input: utterance,
                    result,
                });
            });
    }

    // -- state --

    fn transition(&mut self, to: ConversationState, reason: &'static str) {
        let from = self.session.state;
        if from != to {
            tracing::debug!(%from, %to, reason, "state transition");
        }
        self.session.state = to;

        if to == ConversationState::Standby && self.session.active && !self.session.paused {
            self.arm_standby_idle();
        } else {
            self.watchers.cancel(WatcherKind::StandbyIdle);
        }
        self.publish();
    }

    fn publish(&self) {
        let next = SessionSnapshot::from_session(
            &self.session,
            &self.subtitle,
            self.speech.is_speaking(),
            self.speech.audio_level(),
        );
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Enrich, attach a frame when asked to look, and call the backend
async fn request_response(
    backend: &dyn LanguageModelClient,
    search: Option<&dyn SearchCollaborator>,
    frames: &FrameProducers,
    utterance: &str,
    history: &[ConversationTurn],
    limit: usize,
) -> BackendResult<String> {
    let mut prompt = utterance.to_string();

    if let (Some(search), Some(intent)) = (search, detect_search_intent(utterance)) {
        match search.search(utterance, limit).await {
            Ok(results) => {
                tracing::info!(intent = intent.as_str(), results = results.len(), "enriching prompt");
                prompt = enrich_prompt(utterance, intent, &results);
            }
            Err(e) => {
                tracing::warn!(error = %e, "search failed, sending plain prompt");
            }
        }
    }

    if let Some(kind) = detect_visual_query(utterance) {
        if let Some(frame) = frames.capture(kind).await {
            tracing::info!(source = kind.as_str(), bytes = frame.data.len(), "attaching frame");
            return backend.submit_with_image(&prompt, &frame, history).await;
        }
        tracing::debug!(source = kind.as_str(), "no frame available, sending text only");
    }

    backend.submit(&prompt, history).await
}

const fn apology_for(error: &BackendError) -> &'static str {
    match error {
        BackendError::Timeout => TIMEOUT_APOLOGY,
        BackendError::InvalidCredential => CREDENTIAL_APOLOGY,
        BackendError::ServiceUnavailable => UNAVAILABLE_APOLOGY,
        BackendError::RateLimitExceeded | BackendError::Other(_) => GENERIC_APOLOGY,
    }
}

fn join_utterance(head: &str, tail: &str) -> String {
    match (head.trim(), tail.trim()) {
        ("", tail) => tail.to_string(),
        (head, "") => head.to_string(),
        (head, tail) => format!("{head} {tail}"),
    }
}
