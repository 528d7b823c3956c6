//! Short-term conversation memory
//!
//! The most recent exchanges are replayed to the backend with every request.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of retained turns
pub const DEFAULT_HISTORY_LIMIT: usize = 5;

/// One completed exchange between the user and the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// What the user said
    pub user_input: String,
    /// What the agent answered
    pub agent_response: String,
    /// When the answer arrived
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    /// Record an exchange stamped with the current time
    #[must_use]
    pub fn new(user_input: impl Into<String>, agent_response: impl Into<String>) -> Self {
        Self {
            user_input: user_input.into(),
            agent_response: agent_response.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Bounded FIFO of recent turns, oldest first
#[derive(Debug, Clone)]
pub struct TurnHistory {
    turns: VecDeque<ConversationTurn>,
    limit: usize,
}

impl Default for TurnHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl TurnHistory {
    /// Create a history that keeps at most `limit` turns
    #[must_use]
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            turns: VecDeque::with_capacity(limit + 1),
            limit,
        }
    }

    /// Append a turn, evicting the oldest once the bound is exceeded
    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.limit {
            self.turns.pop_front();
        }
    }

    /// Copy of the retained turns, oldest first
    #[must_use]
    pub fn to_vec(&self) -> Vec<ConversationTurn> {
        self.turns.iter().cloned().collect()
    }

    /// Iterate oldest first
    pub fn iter(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    /// Number of retained turns
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether nothing has been retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Configured bound
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.turns.clear();
    }
}
