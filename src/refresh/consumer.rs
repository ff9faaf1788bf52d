//! Read side of the coordinator. Reads only look at the cache; a refresh
//! they ask for runs in the background and is never awaited here.

use std::sync::Arc;
use std::time::Duration;

use super::coordinator::{GameEntry, Part};
use super::{Freshness, RefreshCoordinator, RefreshState, Served};
use crate::db::models::{EdgeSet, GameMomentum};
use crate::error::EdgeError;

impl RefreshCoordinator {
    /// Latest momentum for a game. Stale data beats an error.
    pub fn get_momentum(&self, game_id: &str) -> Result<Served<Arc<GameMomentum>>, EdgeError> {
        self.read(game_id, "momentum", |entry| &entry.momentum)
    }

    /// Latest edge set for a game. Markets without odds are listed in
    /// `unavailable` instead of failing the whole read.
    pub fn get_edges(&self, game_id: &str) -> Result<Served<Arc<EdgeSet>>, EdgeError> {
        self.read(game_id, "edges", |entry| &entry.edges)
    }

    fn read<T>(
        &self,
        game_id: &str,
        what: &str,
        part: impl Fn(&GameEntry) -> &Part<T>,
    ) -> Result<Served<Arc<T>>, EdgeError> {
        if game_id.trim().is_empty() {
            return Err(EdgeError::invalid_game("empty game id"));
        }
        let stale_after = self.inner.settings.stale_after;
        let mut entries = self.inner.lock();
        let entry = entries
            .entry(game_id.to_string())
            .or_insert_with(GameEntry::new);
        self.inner.ensure_fresh(entry, game_id);

        let entry: &GameEntry = entry;
        let cached = part(entry);
        let last_error = cached.error.clone().or_else(|| entry.last_error.clone());
        match &cached.value {
            Some(value) => Ok(Served {
                data: Arc::clone(value),
                freshness: freshness(entry, cached, stale_after),
                fetched_at: cached.fetched_at_utc,
                last_error,
            }),
            None => Err(last_error.unwrap_or_else(|| {
                EdgeError::edge_not_found(format!("no {} yet for game {}", what, game_id))
            })),
        }
    }
}

fn freshness<T>(entry: &GameEntry, part: &Part<T>, stale_after: Duration) -> Freshness {
    if part.error.is_some() {
        return Freshness::Stale;
    }
    match entry.state {
        RefreshState::Closed if !entry.is_halted() => Freshness::Fresh,
        RefreshState::Ready | RefreshState::Fetching
            if entry.last_error.is_none()
                && part.fetched_at.is_some_and(|t| t.elapsed() < stale_after) =>
        {
            Freshness::Fresh
        }
        _ => Freshness::Stale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_only_within_window_without_errors() {
        let mut entry = GameEntry::new();
        let mut part: Part<u32> = Part::default();
        part.set(Arc::new(1));

        entry.state = RefreshState::Ready;
        assert_eq!(freshness(&entry, &part, Duration::from_secs(5)), Freshness::Fresh);
        assert_eq!(freshness(&entry, &part, Duration::ZERO), Freshness::Stale);

        entry.state = RefreshState::Stale;
        assert_eq!(freshness(&entry, &part, Duration::from_secs(5)), Freshness::Stale);

        entry.state = RefreshState::Ready;
        part.error = Some(EdgeError::rate_limited("odds"));
        assert_eq!(freshness(&entry, &part, Duration::from_secs(5)), Freshness::Stale);
    }

    #[test]
    fn test_halted_game_is_never_fresh() {
        let mut entry = GameEntry::new();
        let mut part: Part<u32> = Part::default();
        part.set(Arc::new(1));
        entry.state = RefreshState::Closed;
        assert_eq!(freshness(&entry, &part, Duration::from_secs(5)), Freshness::Fresh);

        entry.last_error = Some(EdgeError::invalid_game("gone"));
        assert_eq!(freshness(&entry, &part, Duration::from_secs(5)), Freshness::Stale);
    }
}
