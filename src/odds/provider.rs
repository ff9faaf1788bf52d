use async_trait::async_trait;

use crate::db::models::{BookmakerLine, ModelProjection};
use crate::error::FeedError;

/// Source of bookmaker quotes for a game's player markets.
#[async_trait]
pub trait OddsSource: Send + Sync {
    /// Every quote currently offered for the game. An empty list is a valid
    /// answer (no markets posted yet), not an error.
    async fn fetch_lines(&self, game_id: &str) -> Result<Vec<BookmakerLine>, FeedError>;

    fn name(&self) -> &str;
}

/// Source of model projections (mean / std-dev per player + market).
#[async_trait]
pub trait ProjectionSource: Send + Sync {
    async fn fetch_projections(&self, game_id: &str) -> Result<Vec<ModelProjection>, FeedError>;

    fn name(&self) -> &str;
}
