pub mod provider;
pub mod sports;
pub mod websocket;

pub use provider::GameStateSource;
pub use sports::TheSportsDB;
pub use websocket::WebSocketFeed;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::db::models::{GameSnapshot, GameStatus};
use crate::error::FeedError;

fn provider_weight(name: &str) -> f64 {
    let n = name.to_lowercase();
    if n.contains("polymarket") {
        1.0
    } else if n.contains("thesportsdb") {
        0.9
    } else {
        0.85
    }
}

type ConsensusKey = (u32, u32, u32, u32, GameStatus);

fn consensus_key(snap: &GameSnapshot) -> ConsensusKey {
    (
        snap.home.score,
        snap.away.score,
        snap.clock.period,
        snap.clock.seconds_remaining,
        snap.status,
    )
}

/// Pick the snapshot most providers agree on.
///
/// Groups by (scores, clock, status); the largest group wins, ties go to the
/// group with the higher summed provider weight. Within the group the highest
/// weighted provider wins, then the latest timestamp.
fn select_consensus(candidates: Vec<(String, GameSnapshot)>) -> Option<(String, GameSnapshot, usize)> {
    let mut groups: HashMap<ConsensusKey, Vec<(String, GameSnapshot)>> = HashMap::new();
    for (provider, snap) in candidates {
        groups.entry(consensus_key(&snap)).or_default().push((provider, snap));
    }

    let mut best_group: Option<Vec<(String, GameSnapshot)>> = None;
    let mut best_count = 0usize;
    let mut best_weight = -1.0f64;
    for group in groups.into_values() {
        let count = group.len();
        let weight_sum: f64 = group.iter().map(|(p, _)| provider_weight(p)).sum();
        if count > best_count || (count == best_count && weight_sum > best_weight) {
            best_count = count;
            best_weight = weight_sum;
            best_group = Some(group);
        }
    }

    best_group?
        .into_iter()
        .max_by(|(pa, a), (pb, b)| {
            provider_weight(pa)
                .partial_cmp(&provider_weight(pb))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        })
        .map(|(provider, snap)| (provider, snap, best_count))
}

/// Polls several game-state sources **concurrently** and keeps the snapshot
/// with the most agreement. Any single provider may fail or time out.
pub struct ConsensusGameSource {
    providers: Vec<Arc<dyn GameStateSource>>,
    provider_timeout: Duration,
}

impl ConsensusGameSource {
    pub fn new(providers: Vec<Arc<dyn GameStateSource>>, provider_timeout: Duration) -> Self {
        ConsensusGameSource {
            providers,
            provider_timeout,
        }
    }
}

#[async_trait]
impl GameStateSource for ConsensusGameSource {
    fn name(&self) -> &str {
        "consensus"
    }

    async fn fetch_snapshot(&self, game_id: &str) -> Result<GameSnapshot, FeedError> {
        let timeout = self.provider_timeout;
        let fetches: Vec<_> = self
            .providers
            .iter()
            .map(|p| {
                let p = Arc::clone(p);
                async move {
                    let out = match tokio::time::timeout(timeout, p.fetch_snapshot(game_id)).await {
                        Ok(result) => result,
                        Err(_) => Err(FeedError::Unavailable(format!(
                            "{} timed out after {:?}",
                            p.name(),
                            timeout
                        ))),
                    };
                    (p.name().to_string(), out)
                }
            })
            .collect();

        let results = futures_util::future::join_all(fetches).await;

        let mut candidates = Vec::new();
        let mut errors = Vec::new();
        for (provider, result) in results {
            match result {
                Ok(snap) if snap.game_id == game_id => candidates.push((provider, snap)),
                Ok(snap) => {
                    warn!(
                        "Provider '{}' answered {} with game {}",
                        provider, game_id, snap.game_id
                    );
                    errors.push(FeedError::WrongGame {
                        requested: game_id.to_string(),
                        received: snap.game_id,
                    });
                }
                Err(e) => {
                    debug!("Provider '{}' failed for {}: {}", provider, game_id, e);
                    errors.push(e);
                }
            }
        }

        match select_consensus(candidates) {
            Some((provider, snap, agreeing)) => {
                debug!(
                    "Game {} resolved by {} ({} provider(s) agree)",
                    game_id, provider, agreeing
                );
                Ok(snap)
            }
            None => Err(combine_errors(game_id, errors)),
        }
    }
}

/// Fold provider failures into one. A game is only unknown when every
/// provider says so; throttling wins over plain unavailability.
fn combine_errors(game_id: &str, errors: Vec<FeedError>) -> FeedError {
    if errors.is_empty() {
        return FeedError::Unavailable(format!("no providers configured for {}", game_id));
    }
    if errors
        .iter()
        .all(|e| matches!(e, FeedError::UnknownGame(_) | FeedError::WrongGame { .. }))
    {
        return errors
            .into_iter()
            .next()
            .unwrap_or_else(|| FeedError::UnknownGame(game_id.to_string()));
    }
    let throttled: Vec<&FeedError> = errors
        .iter()
        .filter(|e| matches!(e, FeedError::RateLimited { .. }))
        .collect();
    if !throttled.is_empty() {
        let retry_after = throttled.iter().filter_map(|e| e.retry_after()).max();
        return FeedError::RateLimited {
            source_name: "consensus".into(),
            retry_after,
        };
    }
    FeedError::Unavailable(
        errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{GameClock, TeamLine};
    use chrono::{Duration as ChronoDuration, Utc};

    fn snap(home: u32, away: u32) -> GameSnapshot {
        GameSnapshot {
            game_id: "g1".into(),
            home: TeamLine {
                team_id: "bos".into(),
                name: "Boston".into(),
                score: home,
            },
            away: TeamLine {
                team_id: "mia".into(),
                name: "Miami".into(),
                score: away,
            },
            clock: GameClock::new(2, 300),
            status: GameStatus::InProgress,
            timestamp: Utc::now(),
        }
    }

    struct Fixed {
        name: &'static str,
        result: Result<GameSnapshot, FeedError>,
        delay: Duration,
    }

    #[async_trait]
    impl GameStateSource for Fixed {
        async fn fetch_snapshot(&self, _game_id: &str) -> Result<GameSnapshot, FeedError> {
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    fn fixed(name: &'static str, result: Result<GameSnapshot, FeedError>) -> Arc<dyn GameStateSource> {
        Arc::new(Fixed {
            name,
            result,
            delay: Duration::ZERO,
        })
    }

    #[test]
    fn test_majority_wins_over_weight() {
        let picked = select_consensus(vec![
            ("polymarket".into(), snap(50, 48)),
            ("a".into(), snap(52, 48)),
            ("b".into(), snap(52, 48)),
        ])
        .unwrap();
        assert_eq!(picked.1.home.score, 52);
        assert_eq!(picked.2, 2);
    }

    #[test]
    fn test_weight_breaks_count_ties() {
        let picked = select_consensus(vec![
            ("other".into(), snap(50, 48)),
            ("TheSportsDB".into(), snap(52, 48)),
        ])
        .unwrap();
        assert_eq!(picked.0, "TheSportsDB");
    }

    #[test]
    fn test_latest_timestamp_within_group() {
        let mut older = snap(50, 48);
        older.timestamp = older.timestamp - ChronoDuration::seconds(5);
        let newer = snap(50, 48);
        let stamp = newer.timestamp;
        let picked = select_consensus(vec![("x".into(), older), ("y".into(), newer)]).unwrap();
        assert_eq!(picked.1.timestamp, stamp);
    }

    #[tokio::test]
    async fn test_one_failing_provider_does_not_fail_fetch() {
        let source = ConsensusGameSource::new(
            vec![
                fixed("down", Err(FeedError::Unavailable("503".into()))),
                fixed("up", Ok(snap(10, 8))),
            ],
            Duration::from_millis(200),
        );
        let s = source.fetch_snapshot("g1").await.unwrap();
        assert_eq!(s.home.score, 10);
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let slow: Arc<dyn GameStateSource> = Arc::new(Fixed {
            name: "slow",
            result: Ok(snap(1, 1)),
            delay: Duration::from_millis(500),
        });
        let source = ConsensusGameSource::new(vec![slow], Duration::from_millis(20));
        assert!(matches!(
            source.fetch_snapshot("g1").await,
            Err(FeedError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_only_when_all_agree() {
        let mixed = ConsensusGameSource::new(
            vec![
                fixed("a", Err(FeedError::UnknownGame("g1".into()))),
                fixed("b", Err(FeedError::RateLimited {
                    source_name: "b".into(),
                    retry_after: Some(Duration::from_secs(3)),
                })),
            ],
            Duration::from_millis(200),
        );
        match mixed.fetch_snapshot("g1").await {
            Err(FeedError::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(3)))
            }
            other => panic!("expected rate limit, got {:?}", other),
        }

        let unknown = ConsensusGameSource::new(
            vec![
                fixed("a", Err(FeedError::UnknownGame("g1".into()))),
                fixed("b", Err(FeedError::UnknownGame("g1".into()))),
            ],
            Duration::from_millis(200),
        );
        assert!(matches!(
            unknown.fetch_snapshot("g1").await,
            Err(FeedError::UnknownGame(_))
        ));
    }
}
