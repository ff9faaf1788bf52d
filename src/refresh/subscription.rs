use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use super::coordinator::Inner;
use super::RefreshState;
use crate::db::models::{EdgeSet, GameMomentum};
use crate::error::EdgeError;

/// Pushed to subscribers whenever a game's cache entry changes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameUpdate {
    pub game_id: String,
    pub state: RefreshState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub momentum: Option<Arc<GameMomentum>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edges: Option<Arc<EdgeSet>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EdgeError>,
}

/// Reference-counted interest in one game. Polling for the game stops once
/// every subscription has been dropped.
pub struct Subscription {
    game_id: String,
    initial: Option<GameUpdate>,
    rx: broadcast::Receiver<GameUpdate>,
    inner: Arc<Inner>,
}

impl Subscription {
    pub(super) fn new(
        game_id: String,
        initial: Option<GameUpdate>,
        rx: broadcast::Receiver<GameUpdate>,
        inner: Arc<Inner>,
    ) -> Self {
        Subscription {
            game_id,
            initial,
            rx,
            inner,
        }
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    /// Next update: first the cached state at subscribe time (if any), then
    /// every change. `None` once the game is evicted from the cache.
    pub async fn next(&mut self) -> Option<GameUpdate> {
        if let Some(update) = self.initial.take() {
            return Some(update);
        }
        loop {
            match self.rx.recv().await {
                Ok(update) => return Some(update),
                Err(RecvError::Lagged(n)) => {
                    warn!("Subscriber for {} lagged, skipped {} update(s)", self.game_id, n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.release_interest(&self.game_id);
    }
}
