//! Error types for Parley

use thiserror::Error;

use crate::llm::BackendError;

/// Result type alias for Parley operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Parley
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Microphone or recognition consent was not granted
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Capture device or recognition engine could not be opened
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Recognition was cancelled by a normal stop/restart sequence
    #[error("recognition cancelled")]
    EngineCancelled,

    /// Engine cannot resume cheaply and needs a full restart
    #[error("engine cannot resume in place")]
    ResumeUnsupported,

    /// Language model backend error
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Search collaborator error
    #[error("search error: {0}")]
    Search(String),

    /// Frame producer error
    #[error("frame error: {0}")]
    Frame(String),

    /// The conversation actor is gone
    #[error("session closed")]
    SessionClosed,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether a stream failure is worth one automatic retry
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::EngineUnavailable(_) | Self::Audio(_))
    }

    /// Whether this is platform noise from a normal stop/restart
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::EngineCancelled)
    }
}
