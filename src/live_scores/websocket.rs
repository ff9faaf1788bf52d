//! WebSocket push feed for live game state.
//!
//! Instead of polling a REST API every few seconds, this provider keeps a
//! socket open and stores the latest snapshot per game as updates arrive:
//!
//! ```text
//!  WS Server ──push──▶ WebSocketFeed (background task)
//!                         │  parses messages → GameSnapshot
//!                         │  stores latest per game id
//!                         ▼
//!              GameStateSource::fetch_snapshot(game_id)
//!                  reads the shared map, no network call
//! ```
//!
//! Included parser: **Polymarket Sports WS** (`wss://sports-api.polymarket.com/ws`),
//! no auth needed.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::provider::GameStateSource;
use super::sports::{parse_period_clock, slugify};
use crate::db::models::{GameSnapshot, GameStatus, TeamLine};
use crate::error::FeedError;

/// A function that parses a raw WebSocket text message into zero or more snapshots.
pub type ParseFn = Arc<dyn Fn(&str) -> Vec<GameSnapshot> + Send + Sync>;

/// Snapshots older than this are dropped from the shared map.
const RETAIN_HOURS: i64 = 6;

/// Configuration for a WebSocket game-state feed.
pub struct WebSocketFeedConfig {
    /// Display name for logging
    pub name: String,
    /// WebSocket URL to connect to (wss://...)
    pub url: String,
    /// Optional subscription message to send after connecting
    pub subscribe_message: Option<String>,
    /// Parser that converts raw WS text frames into snapshots
    pub parse_fn: ParseFn,
    /// Seconds between client-side ping frames
    pub ping_interval_secs: u64,
}

/// A push-based game-state source.
///
/// The background task maintains a persistent connection with auto-reconnect.
/// `fetch_snapshot()` returns the latest pushed snapshot from shared memory.
pub struct WebSocketFeed {
    name: String,
    snapshot: Arc<RwLock<HashMap<String, GameSnapshot>>>,
}

impl WebSocketFeed {
    /// Create a new feed and spawn the background listener. Must be called
    /// from within a tokio runtime.
    pub fn new(config: WebSocketFeedConfig) -> Self {
        let snapshot = Arc::new(RwLock::new(HashMap::new()));
        let name = config.name.clone();
        tokio::spawn(ws_connection_loop(config, Arc::clone(&snapshot)));
        WebSocketFeed { name, snapshot }
    }

    /// Polymarket sports socket with the bundled parser.
    pub fn polymarket_sports(url: &str) -> Self {
        Self::new(WebSocketFeedConfig {
            name: "Polymarket-Sports-WS".into(),
            url: url.to_string(),
            subscribe_message: None,
            parse_fn: Arc::new(parse_polymarket_sports),
            ping_interval_secs: 25,
        })
    }
}

#[async_trait]
impl GameStateSource for WebSocketFeed {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_snapshot(&self, game_id: &str) -> Result<GameSnapshot, FeedError> {
        let snap = self.snapshot.read().await;
        snap.get(game_id).cloned().ok_or_else(|| {
            FeedError::Unavailable(format!("{}: no push update yet for {}", self.name, game_id))
        })
    }
}

/// Merge parsed snapshots into the shared map, keeping the newest per game.
async fn store_snapshots(
    snapshot: &RwLock<HashMap<String, GameSnapshot>>,
    games: Vec<GameSnapshot>,
) {
    let mut snap = snapshot.write().await;
    for game in games {
        match snap.get(&game.game_id) {
            Some(existing) if existing.timestamp > game.timestamp => {}
            _ => {
                snap.insert(game.game_id.clone(), game);
            }
        }
    }
    let cutoff = Utc::now() - ChronoDuration::hours(RETAIN_HOURS);
    snap.retain(|_, g| g.timestamp >= cutoff);
}

/// Why a socket session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Never got a working session; keep growing the delay.
    Failed,
    /// Was connected and receiving; reconnect from the base delay.
    Dropped,
}

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Reconnects forever, doubling the delay after sessions that never came up.
async fn ws_connection_loop(
    config: WebSocketFeedConfig,
    snapshot: Arc<RwLock<HashMap<String, GameSnapshot>>>,
) {
    let mut delay = RECONNECT_BASE;
    loop {
        match run_session(&config, &snapshot).await {
            SessionEnd::Dropped => delay = RECONNECT_BASE,
            SessionEnd::Failed => {}
        }
        warn!("[{}] socket down, retrying in {:?}", config.name, delay);
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(RECONNECT_CAP);
    }
}

/// One connected session: subscribe, then pump frames into the map until
/// the socket closes or a keepalive fails.
async fn run_session(
    config: &WebSocketFeedConfig,
    snapshot: &RwLock<HashMap<String, GameSnapshot>>,
) -> SessionEnd {
    let name = config.name.as_str();
    let stream = match tokio_tungstenite::connect_async(config.url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            error!("[{}] connect to {} failed: {}", name, config.url, e);
            return SessionEnd::Failed;
        }
    };
    info!("[{}] connected to {}", name, config.url);
    let (mut sink, mut frames) = stream.split();

    if let Some(sub) = &config.subscribe_message {
        if let Err(e) = sink.send(Message::Text(sub.clone())).await {
            error!("[{}] subscribe failed: {}", name, e);
            return SessionEnd::Failed;
        }
    }

    let mut keepalive =
        tokio::time::interval(Duration::from_secs(config.ping_interval_secs.max(1)));
    let mut received_any = false;

    loop {
        tokio::select! {
            frame = frames.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        error!("[{}] read error: {}", name, e);
                        break;
                    }
                    None => break,
                };
                received_any = true;
                match frame {
                    // The sports socket sends an application-level text ping.
                    Message::Text(text) if text.trim() == "ping" => {
                        let _ = sink.send(Message::Text("pong".into())).await;
                    }
                    Message::Text(text) => {
                        let games = (config.parse_fn)(&text);
                        if !games.is_empty() {
                            debug!("[{}] {} game update(s)", name, games.len());
                            store_snapshots(snapshot, games).await;
                        }
                    }
                    Message::Ping(payload) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Message::Close(reason) => {
                        warn!("[{}] closed by server: {:?}", name, reason);
                        break;
                    }
                    _ => {}
                }
            }
            _ = keepalive.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    error!("[{}] keepalive failed: {}", name, e);
                    break;
                }
            }
        }
    }

    if received_any {
        SessionEnd::Dropped
    } else {
        SessionEnd::Failed
    }
}

// ── Polymarket Sports Parser ─────────────────────────────────────────────────

/// Parse Polymarket Sports WebSocket messages for basketball games.
///
/// Fields used: `gameId` (or `slug`), `homeTeam` / `awayTeam` (or teams from a
/// "home-vs-away" slug), `score` ("102-99"), `period` ("Q3", "OT1", "HT",
/// "Final", optionally with an inline clock), `elapsed` / `clock`, `ended`.
pub fn parse_polymarket_sports(text: &str) -> Vec<GameSnapshot> {
    let Ok(val) = serde_json::from_str::<serde_json::Value>(text) else {
        return vec![];
    };

    // Handle both single update and array of updates
    let events: Vec<&serde_json::Value> = match &val {
        serde_json::Value::Array(items) => items.iter().collect(),
        v if v.get("gameId").is_some() || v.get("slug").is_some() => vec![v],
        v => match v.get("data") {
            Some(serde_json::Value::Array(items)) => items.iter().collect(),
            Some(data) if data.get("gameId").is_some() || data.get("slug").is_some() => {
                vec![data]
            }
            _ => return vec![],
        },
    };

    let now = Utc::now();
    events
        .into_iter()
        .filter_map(|ev| {
            if let Some(league) = ev.get("leagueAbbreviation").and_then(|v| v.as_str()) {
                if !matches!(league.to_lowercase().as_str(), "nba" | "wnba" | "ncaab" | "cbb") {
                    return None;
                }
            }

            let slug = ev.get("slug").and_then(|v| v.as_str()).unwrap_or("");
            let game_id = ev
                .get("gameId")
                .and_then(|v| {
                    v.as_str()
                        .map(|s| s.to_string())
                        .or_else(|| v.as_u64().map(|n| n.to_string()))
                })
                .or_else(|| (!slug.is_empty()).then(|| slug.to_string()))?;

            let (slug_home, slug_away) = parse_teams_from_slug(slug);
            let home_name = ev
                .get("homeTeam")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .or(slug_home)?;
            let away_name = ev
                .get("awayTeam")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .or(slug_away)?;

            let (home_score, away_score) =
                parse_score_string(ev.get("score").and_then(|v| v.as_str()).unwrap_or(""));

            let period = ev.get("period").and_then(|v| v.as_str()).unwrap_or("");
            let clock = ev
                .get("elapsed")
                .or_else(|| ev.get("clock"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let (mut status, mut game_clock) = parse_period_clock(period, clock);
            if ev.get("ended").and_then(|v| v.as_bool()) == Some(true) {
                status = GameStatus::Final;
                game_clock.seconds_remaining = 0;
            }

            Some(GameSnapshot {
                game_id,
                home: TeamLine {
                    team_id: slugify(&home_name),
                    name: home_name,
                    score: home_score,
                },
                away: TeamLine {
                    team_id: slugify(&away_name),
                    name: away_name,
                    score: away_score,
                },
                clock: game_clock,
                status,
                timestamp: now,
            })
        })
        .collect()
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Parse a score string like "102 - 99", "102-99", "102:99" into (home, away).
fn parse_score_string(s: &str) -> (u32, u32) {
    for sep in [" - ", "-", ":"] {
        if let Some((h, a)) = s.split_once(sep) {
            if let (Ok(home), Ok(away)) = (h.trim().parse::<u32>(), a.trim().parse::<u32>()) {
                return (home, away);
            }
        }
    }
    (0, 0)
}

/// Extract team names from a slug like "celtics-vs-heat-2025-01-05".
fn parse_teams_from_slug(slug: &str) -> (Option<String>, Option<String>) {
    match slug.find("-vs-") {
        Some(idx) => (
            Some(slug_to_name(&slug[..idx])),
            Some(slug_to_name(&slug[idx + 4..])),
        ),
        None => (None, None),
    }
}

/// Convert a slug segment like "golden-state" into "Golden State".
fn slug_to_name(slug: &str) -> String {
    slug.split('-')
        .filter(|s| !s.is_empty() && s.parse::<u32>().is_err()) // strip dates
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::GameClock;

    #[test]
    fn test_parse_score_string() {
        assert_eq!(parse_score_string("102 - 99"), (102, 99));
        assert_eq!(parse_score_string("88-90"), (88, 90));
        assert_eq!(parse_score_string("1:1"), (1, 1));
        assert_eq!(parse_score_string("garbage"), (0, 0));
    }

    #[test]
    fn test_parse_teams_from_slug() {
        let (h, a) = parse_teams_from_slug("golden-state-vs-heat-2025-01-05");
        assert_eq!(h.as_deref(), Some("Golden State"));
        assert_eq!(a.as_deref(), Some("Heat"));
        assert_eq!(parse_teams_from_slug("no-separator"), (None, None));
    }

    #[test]
    fn test_parse_polymarket_sports_message() {
        let msg = r#"{"gameId": 9981, "leagueAbbreviation": "nba",
            "homeTeam": "Celtics", "awayTeam": "Heat",
            "score": "77-70", "period": "Q3", "elapsed": "4:30"}"#;
        let games = parse_polymarket_sports(msg);
        assert_eq!(games.len(), 1);
        let g = &games[0];
        assert_eq!(g.game_id, "9981");
        assert_eq!(g.home.name, "Celtics");
        assert_eq!(g.home.team_id, "celtics");
        assert_eq!(g.home.score, 77);
        assert_eq!(g.away.score, 70);
        assert_eq!(g.clock, GameClock::new(3, 270));
        assert_eq!(g.status, GameStatus::InProgress);
    }

    #[test]
    fn test_parse_slug_only_message() {
        let msg = r#"{"data": [{"slug": "celtics-vs-heat", "score": "101 - 99", "period": "Final"}]}"#;
        let games = parse_polymarket_sports(msg);
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].game_id, "celtics-vs-heat");
        assert_eq!(games[0].away.name, "Heat");
        assert_eq!(games[0].status, GameStatus::Final);
    }

    #[test]
    fn test_other_leagues_ignored() {
        let msg = r#"[{"gameId": 1, "leagueAbbreviation": "epl", "homeTeam": "A", "awayTeam": "B", "score": "1-0", "period": "2H"}]"#;
        assert!(parse_polymarket_sports(msg).is_empty());
    }

    #[test]
    fn test_ended_flag_marks_final() {
        let msg = r#"{"gameId": "7", "homeTeam": "A", "awayTeam": "B", "score": "99-98", "period": "Q4", "elapsed": "0:01", "ended": true}"#;
        let games = parse_polymarket_sports(msg);
        assert_eq!(games[0].status, GameStatus::Final);
        assert_eq!(games[0].clock.seconds_remaining, 0);
    }

    #[tokio::test]
    async fn test_store_keeps_newest_snapshot() {
        let map = RwLock::new(HashMap::new());
        let newer = parse_polymarket_sports(
            r#"{"gameId": "7", "homeTeam": "A", "awayTeam": "B", "score": "10-8", "period": "Q1"}"#,
        );
        let mut older = newer.clone();
        older[0].timestamp = older[0].timestamp - ChronoDuration::seconds(30);
        older[0].home.score = 2;

        store_snapshots(&map, newer).await;
        store_snapshots(&map, older).await;
        assert_eq!(map.read().await.get("7").unwrap().home.score, 10);
    }

    #[test]
    fn test_garbage_ignored() {
        assert!(parse_polymarket_sports("not json").is_empty());
        assert!(parse_polymarket_sports(r#"{"hello": 1}"#).is_empty());
    }
}
