use async_trait::async_trait;

use crate::db::models::GameSnapshot;
use crate::error::FeedError;

/// Trait that every live game-state provider must implement.
#[async_trait]
pub trait GameStateSource: Send + Sync {
    /// Return the latest normalised snapshot for one game.
    async fn fetch_snapshot(&self, game_id: &str) -> Result<GameSnapshot, FeedError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
