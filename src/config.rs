use clap::Parser;
use std::time::Duration;

use crate::engine::MomentumSettings;
use crate::refresh::RefreshSettings;

/// Live basketball momentum and betting-edge service
#[derive(Parser, Debug, Clone)]
#[command(name = "courtside-momentum", version, about)]
pub struct Config {
    /// Read API listen address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8080")]
    pub api_addr: String,

    /// SQLite database path (latest results per game)
    #[arg(long, env = "DATABASE_PATH", default_value = "courtside.db")]
    pub database_path: String,

    /// Live scores API URL (TheSportsDB v1 JSON base)
    #[arg(
        long,
        env = "LIVE_SCORES_API_URL",
        default_value = "https://www.thesportsdb.com/api/v1/json"
    )]
    pub live_scores_api_url: String,

    /// Live scores API key
    #[arg(long, env = "LIVE_SCORES_API_KEY")]
    pub live_scores_api_key: Option<String>,

    /// Optional sports WebSocket feed pushing live basketball scores
    #[arg(long, env = "SPORTS_WS_URL")]
    pub sports_ws_url: Option<String>,

    /// Per-provider timeout when polling game state (milliseconds)
    #[arg(long, env = "PROVIDER_TIMEOUT_MS", default_value = "4000")]
    pub provider_timeout_ms: u64,

    /// The Odds API base URL
    #[arg(long, env = "ODDS_API_URL", default_value = "https://api.the-odds-api.com")]
    pub odds_api_url: String,

    /// The Odds API key
    #[arg(long, env = "ODDS_API_KEY", default_value = "")]
    pub odds_api_key: String,

    /// Sport key used for odds lookups
    #[arg(long, env = "ODDS_SPORT", default_value = "basketball_nba")]
    pub odds_sport: String,

    /// Player-prop markets to request (comma separated)
    #[arg(long, env = "ODDS_MARKETS", value_delimiter = ',')]
    pub odds_markets: Vec<String>,

    /// Projection model service base URL
    #[arg(long, env = "PROJECTIONS_API_URL", default_value = "http://127.0.0.1:9000")]
    pub projections_api_url: String,

    /// Polling interval per tracked game (milliseconds)
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "5000")]
    pub poll_interval_ms: u64,

    /// How long a result stays fresh (milliseconds)
    #[arg(long, env = "STALE_AFTER_MS", default_value = "15000")]
    pub stale_after_ms: u64,

    /// First retry delay after a failed refresh (milliseconds)
    #[arg(long, env = "BACKOFF_BASE_MS", default_value = "1000")]
    pub backoff_base_ms: u64,

    /// Retry delay ceiling (milliseconds)
    #[arg(long, env = "BACKOFF_CAP_MS", default_value = "30000")]
    pub backoff_cap_ms: u64,

    /// Minimum absolute edge, in percentage points, for an edge to be reported
    #[arg(long, env = "MIN_EDGE_PCT", default_value = "2.0")]
    pub min_edge_pct: f64,

    /// Consecutive failures before polling for a game pauses
    #[arg(long, env = "RETRY_ATTEMPTS", default_value = "8")]
    pub retry_attempts: u32,

    /// How long finished or idle games stay cached (seconds)
    #[arg(long, env = "CLOSED_RETENTION_SECS", default_value = "900")]
    pub closed_retention_secs: u64,

    /// Snapshots kept per game for momentum
    #[arg(long, env = "MAX_HISTORY", default_value = "240")]
    pub max_history: usize,

    /// Snapshot count at which momentum confidence saturates
    #[arg(long, env = "MIN_SNAPSHOTS", default_value = "12")]
    pub min_snapshots: usize,

    /// Trailing momentum window (game-clock seconds)
    #[arg(long, env = "MOMENTUM_WINDOW_SECS", default_value = "180")]
    pub momentum_window_secs: u32,

    /// Games to track from startup (comma separated ids)
    #[arg(long = "track-game", env = "TRACK_GAMES", value_delimiter = ',')]
    pub track_games: Vec<String>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.refresh_settings().validate()?;
        if self.min_snapshots == 0 {
            anyhow::bail!("min_snapshots must be >= 1");
        }
        if self.momentum_window_secs == 0 {
            anyhow::bail!("momentum_window_secs must be positive");
        }
        if self.provider_timeout_ms == 0 {
            anyhow::bail!("provider_timeout_ms must be positive");
        }
        if self.odds_api_key.trim().is_empty() {
            anyhow::bail!("ODDS_API_KEY is required to fetch bookmaker lines");
        }
        if self.track_games.iter().any(|g| g.trim().is_empty()) {
            anyhow::bail!("track_games contains an empty game id");
        }
        Ok(())
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stale_after: Duration::from_millis(self.stale_after_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            min_edge_pct: self.min_edge_pct,
            retry_attempts: self.retry_attempts,
            closed_retention: Duration::from_secs(self.closed_retention_secs),
            max_history: self.max_history,
        }
    }

    pub fn momentum_settings(&self) -> MomentumSettings {
        MomentumSettings {
            window_secs: self.momentum_window_secs,
            min_snapshots: self.min_snapshots,
            ..MomentumSettings::default()
        }
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }
}
