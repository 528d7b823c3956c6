//! Turn-taking core
//!
//! The orchestrator and the pure building blocks it decides with: session
//! state, bounded history, rate-limit backoff, silence segmentation, echo
//! suppression and intent detection.

mod backoff;
mod echo;
mod history;
mod intent;
mod orchestrator;
mod segmenter;
mod state;
mod watchers;

pub use backoff::{
    BackoffDecision, BackoffPolicy, DEFAULT_BACKOFF_CAP, DEFAULT_BACKOFF_RESET,
    DEFAULT_MAX_FAILURES, RateLimitState,
};
pub use echo::{DEFAULT_ECHO_WINDOW, DEFAULT_FILLER_PHRASES, EchoFilter, normalize};
pub use history::{ConversationTurn, DEFAULT_HISTORY_LIMIT, TurnHistory};
pub use intent::{SearchIntent, detect_search_intent, detect_visual_query, enrich_prompt};
pub use orchestrator::{
    ConversationOrchestrator, DEFAULT_ACKNOWLEDGEMENTS, DEFAULT_BARGE_IN_MIN_CHARS,
    DEFAULT_POLL_INTERVAL, DEFAULT_RESPONSE_TIMEOUT, DEFAULT_STANDBY_IDLE, DEFAULT_WAKE_PHRASES,
    OrchestratorBuilder, OrchestratorSettings, SessionHandle,
};
pub use segmenter::{
    DEFAULT_SILENCE_THRESHOLD, SubmitVerdict, TranscriptBaseline, UtteranceCandidate,
    evaluate_submission,
};
pub use state::{ConversationState, Session, SessionSnapshot};
pub use watchers::{WatcherKind, Watchers};
