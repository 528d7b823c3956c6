//! Parley - hands-free, interruptible conversational voice agent
//!
//! This library provides:
//! - A turn-taking orchestrator (listen, think, respond, barge-in)
//! - Wake phrase detection between sessions
//! - Cloud STT/TTS adapters and terminal stand-ins
//! - An OpenAI-compatible language model client with search and image enrichment
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  SessionHandle                       │
//! │  start │ pause │ resume │ end │ subtitles │ snapshot │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │              Conversation orchestrator               │
//! │  Transcription │ Wake phrase │ Playback │ Backoff    │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                   Collaborators                      │
//! │   Language model  │  Web search  │  Camera/screen    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod conversation;
pub mod error;
pub mod frames;
pub mod llm;
pub mod search;
pub mod voice;

pub use config::Config;
pub use conversation::{
    ConversationOrchestrator, ConversationState, ConversationTurn, OrchestratorSettings,
    SessionHandle, SessionSnapshot,
};
pub use error::{Error, Result};
pub use frames::{Frame, FrameKind, FrameProducers, FrameSource, ImageFileSource};
pub use llm::{BackendError, BackendResult, ChatCompletionsClient, LanguageModelClient};
pub use search::{SearchCollaborator, SearchProvider, SearchResult, WebSearch};
