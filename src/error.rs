use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Discriminant surfaced to consumers as `code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No market data available. Recoverable on a later poll.
    EdgeNotFound,
    /// Malformed or unrecognised game identifier. Caller must stop tracking.
    InvalidGame,
    /// Upstream throttling. Retry with backoff.
    RateLimited,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::EdgeNotFound => "EDGE_NOT_FOUND",
            ErrorCode::InvalidGame => "INVALID_GAME",
            ErrorCode::RateLimited => "RATE_LIMITED",
        }
    }

    pub fn is_retriable(&self) -> bool {
        !matches!(self, ErrorCode::InvalidGame)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error value handed to consumers. Never a panic, always data.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct EdgeError {
    pub code: ErrorCode,
    pub message: String,
}

impl EdgeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        EdgeError {
            code,
            message: message.into(),
        }
    }

    pub fn edge_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::EdgeNotFound, message)
    }

    pub fn invalid_game(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidGame, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimited, message)
    }
}

/// Failure reported by an upstream feed (game state, odds, projections).
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("rate limited by {source_name}")]
    RateLimited {
        source_name: String,
        retry_after: Option<Duration>,
    },

    #[error("unknown game: {0}")]
    UnknownGame(String),

    /// The feed answered for a different game than the one asked for.
    #[error("asked for game {requested}, got {received}")]
    WrongGame { requested: String, received: String },

    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("malformed upstream payload: {0}")]
    Malformed(String),
}

impl FeedError {
    /// Upstream hint for how long to wait, when one was given.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FeedError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<FeedError> for EdgeError {
    fn from(err: FeedError) -> Self {
        let message = err.to_string();
        match err {
            FeedError::RateLimited { .. } => EdgeError::rate_limited(message),
            FeedError::UnknownGame(_) | FeedError::WrongGame { .. } => {
                EdgeError::invalid_game(message)
            }
            // A bad payload says nothing about the game id; the next poll may be fine.
            FeedError::Unavailable(_) | FeedError::Malformed(_) => {
                EdgeError::edge_not_found(message)
            }
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FeedError::Malformed(err.to_string())
        } else {
            FeedError::Unavailable(err.to_string())
        }
    }
}
