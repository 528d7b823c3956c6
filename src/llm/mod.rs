//! Language model backend
//!
//! The conversation core treats the model as a request/response boundary:
//! a prompt plus recent turns in, response text or a classified failure out.

mod chat;

pub use chat::{ChatCompletionsClient, DEFAULT_BASE_URL};

use async_trait::async_trait;
use thiserror::Error;

use crate::conversation::ConversationTurn;
use crate::frames::Frame;

/// Result type for backend calls
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Classified backend failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The request took too long
    #[error("request timed out")]
    Timeout,

    /// The backend is throttling us
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Key missing, wrong, or revoked
    #[error("invalid credential")]
    InvalidCredential,

    /// The backend is down or overloaded
    #[error("service unavailable")]
    ServiceUnavailable,

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Map an HTTP status to the taxonomy
    #[must_use]
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            429 => Self::RateLimitExceeded,
            401 | 403 => Self::InvalidCredential,
            408 | 504 => Self::Timeout,
            500..=599 => Self::ServiceUnavailable,
            _ => Self::Other(format!("HTTP {status}: {}", truncate(body, 200))),
        }
    }

    /// Map a transport error to the taxonomy
    #[must_use]
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::ServiceUnavailable
        } else {
            Self::Other(err.to_string())
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Remote language-understanding backend
#[async_trait]
pub trait LanguageModelClient: Send + Sync {
    /// Answer a prompt given the recent turns, oldest first
    ///
    /// # Errors
    ///
    /// Returns a classified [`BackendError`] if the request fails
    async fn submit(&self, prompt: &str, history: &[ConversationTurn]) -> BackendResult<String>;

    /// Answer a prompt about an image
    ///
    /// # Errors
    ///
    /// Returns a classified [`BackendError`] if the request fails
    async fn submit_with_image(
        &self,
        prompt: &str,
        image: &Frame,
        history: &[ConversationTurn],
    ) -> BackendResult<String>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn status_classification() {
        assert_eq!(
            BackendError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            BackendError::RateLimitExceeded
        );
        assert_eq!(
            BackendError::from_status(StatusCode::UNAUTHORIZED, ""),
            BackendError::InvalidCredential
        );
        assert_eq!(
            BackendError::from_status(StatusCode::FORBIDDEN, ""),
            BackendError::InvalidCredential
        );
        assert_eq!(
            BackendError::from_status(StatusCode::BAD_GATEWAY, ""),
            BackendError::ServiceUnavailable
        );
        assert_eq!(
            BackendError::from_status(StatusCode::GATEWAY_TIMEOUT, ""),
            BackendError::Timeout
        );
        assert!(matches!(
            BackendError::from_status(StatusCode::BAD_REQUEST, "bad model"),
            BackendError::Other(msg) if msg.contains("bad model")
        ));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
