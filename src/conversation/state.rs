//! Session and turn-taking state

use serde::Serialize;
use uuid::Uuid;

/// Turn-taking state of an active session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// Idle, listening for the user
    #[default]
    Standby,
    /// The user is speaking
    Listening,
    /// An utterance was submitted and the backend has not answered yet
    Thinking,
    /// The agent is speaking
    Responding,
    /// Suspended by an explicit pause
    Paused,
}

impl ConversationState {
    /// Short label for logs and status lines
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Standby => "standby",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Responding => "responding",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level unit of activity, owned by the orchestrator
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Unique id, regenerated on every start
    pub id: Option<Uuid>,
    /// A conversation is running
    pub active: bool,
    /// Suspended by the user
    pub paused: bool,
    /// Turn-taking state
    pub state: ConversationState,
    /// Whether spoken replies are mirrored as subtitles
    pub subtitles_enabled: bool,
    /// Most recent language-model response
    pub last_response: String,
    /// Last fault surfaced to the user, cleared on start
    pub last_error: Option<String>,
}

impl Session {
    /// Begin a new session in `Standby`
    pub fn begin(&mut self) -> Uuid {
        let id = Uuid::new_v4();
        self.id = Some(id);
        self.active = true;
        self.paused = false;
        self.state = ConversationState::Standby;
        self.last_response.clear();
        self.last_error = None;
        id
    }

    /// Tear the session down; subtitle preference survives
    pub fn finish(&mut self) {
        self.id = None;
        self.active = false;
        self.paused = false;
        self.state = ConversationState::Standby;
        self.last_response.clear();
    }
}

/// Read-only view published to the control surface
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    /// Session id while active
    pub session_id: Option<Uuid>,
    /// A conversation is running
    pub active: bool,
    /// Suspended by the user
    pub paused: bool,
    /// Turn-taking state
    pub state: ConversationState,
    /// Subtitles are on
    pub subtitles_enabled: bool,
    /// Most recent language-model response
    pub last_response: String,
    /// Text to show as a subtitle (empty when subtitles are off)
    pub subtitle_text: String,
    /// The agent is currently talking
    pub is_speaking: bool,
    /// Coarse output level in `0.0..=1.0`
    pub audio_level: f32,
    /// Last fault surfaced to the user
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    /// Build the published view of a session
    #[must_use]
    pub fn from_session(
        session: &Session,
        subtitle_text: &str,
        is_speaking: bool,
        audio_level: f32,
    ) -> Self {
        Self {
            session_id: session.id,
            active: session.active,
            paused: session.paused,
            state: session.state,
            subtitles_enabled: session.subtitles_enabled,
            last_response: session.last_response.clone(),
            subtitle_text: if session.subtitles_enabled {
                subtitle_text.to_string()
            } else {
                String::new()
            },
            is_speaking,
            audio_level,
            last_error: session.last_error.clone(),
        }
    }
}
