pub mod backoff;
pub mod consumer;
pub mod coordinator;
pub mod settings;
pub mod subscription;

pub use coordinator::RefreshCoordinator;
pub use settings::RefreshSettings;
pub use subscription::{GameUpdate, Subscription};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EdgeError;

/// Per-game refresh lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefreshState {
    Idle,
    Fetching,
    Ready,
    Stale,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    Stale,
}

/// A cached value handed to a consumer, with how much to trust it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Served<T> {
    pub data: T,
    pub freshness: Freshness,
    pub fetched_at: Option<DateTime<Utc>>,
    /// Most recent refresh error, if the last attempt failed.
    pub last_error: Option<EdgeError>,
}

impl<T> Served<T> {
    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }
}

/// Diagnostics row for one tracked game.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStatusView {
    pub game_id: String,
    pub state: RefreshState,
    pub subscribers: usize,
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub last_error: Option<EdgeError>,
    pub fetched_at: Option<DateTime<Utc>>,
}
