use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EdgeError;

/// Regulation period length for basketball, in seconds (12 minutes).
pub const REGULATION_PERIOD_SECS: u32 = 720;
/// Overtime period length, in seconds (5 minutes).
pub const OVERTIME_PERIOD_SECS: u32 = 300;
/// Number of regulation periods.
pub const REGULATION_PERIODS: u32 = 4;

// ── Game state (consumed) ────────────────────────────────────────────────────

/// One side of a game as reported by the game-state source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamLine {
    pub team_id: String,
    pub name: String,
    pub score: u32,
}

/// Game clock: current period (1-based, 5+ is overtime) and seconds left in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameClock {
    pub period: u32,
    pub seconds_remaining: u32,
}

impl GameClock {
    pub fn new(period: u32, seconds_remaining: u32) -> Self {
        GameClock {
            period,
            seconds_remaining,
        }
    }

    /// Length of the given period in seconds.
    pub fn period_length(period: u32) -> u32 {
        if period <= REGULATION_PERIODS {
            REGULATION_PERIOD_SECS
        } else {
            OVERTIME_PERIOD_SECS
        }
    }

    /// Game seconds elapsed since tip-off.
    pub fn elapsed_secs(&self) -> u32 {
        let period = self.period.max(1);
        let completed: u32 = (1..period).map(Self::period_length).sum();
        let length = Self::period_length(period);
        completed + length.saturating_sub(self.seconds_remaining.min(length))
    }

    /// Game seconds left until the end of regulation, or until the end of the
    /// current overtime period once regulation is over.
    pub fn remaining_secs(&self) -> u32 {
        let period = self.period.max(1);
        if period <= REGULATION_PERIODS {
            let later: u32 = (period + 1..=REGULATION_PERIODS)
                .map(Self::period_length)
                .sum();
            later + self.seconds_remaining.min(REGULATION_PERIOD_SECS)
        } else {
            self.seconds_remaining.min(OVERTIME_PERIOD_SECS)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Scheduled,
    InProgress,
    Halftime,
    Final,
}

/// Immutable point-in-time fact about a live game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub game_id: String,
    pub home: TeamLine,
    pub away: TeamLine,
    pub clock: GameClock,
    pub status: GameStatus,
    pub timestamp: DateTime<Utc>,
}

// ── Momentum (produced) ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MomentumMetrics {
    /// Squashed momentum in [0, 1]; 0.5 is neutral.
    pub overall: f64,
    /// Raw, unsquashed delta the metric was derived from.
    pub net_change: f64,
    pub trend: Trend,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMetrics {
    pub offense: MomentumMetrics,
    pub defense: MomentumMetrics,
    pub overall: MomentumMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyFactor {
    pub factor: String,
    /// Signed impact in [-1, 1].
    pub impact: f64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMomentum {
    pub team_id: String,
    pub team_name: String,
    pub metrics: TeamMetrics,
    /// Ordered by descending absolute impact.
    pub key_factors: Vec<KeyFactor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchupMetrics {
    pub home_advantage: f64,
    pub pace_impact: f64,
    pub matchup_strength: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HomeAway {
    pub home: f64,
    pub away: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Predictions {
    pub win_probability: HomeAway,
    pub expected_score: HomeAway,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameMomentum {
    pub game_id: String,
    pub home_team: TeamMomentum,
    pub away_team: TeamMomentum,
    pub matchup_metrics: MatchupMetrics,
    pub predictions: Predictions,
    pub last_update: DateTime<Utc>,
}

// ── Odds and projections (consumed) ──────────────────────────────────────────

/// Model projection for one player + market (e.g. "player_points").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelProjection {
    pub player_id: String,
    pub player_name: String,
    pub market: String,
    pub mean: f64,
    pub std_dev: f64,
    pub confidence: f64,
}

/// A single bookmaker quote for a player market, decimal prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmakerLine {
    pub bookmaker: String,
    pub player_id: String,
    pub player_name: String,
    pub market: String,
    pub line: f64,
    pub over: f64,
    pub under: f64,
}

// ── Edges (produced) ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeOdds {
    pub bookmaker: String,
    pub line: f64,
    pub over: f64,
    pub under: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub edge_id: String,
    pub game_id: String,
    pub player_id: String,
    pub player_name: String,
    pub market: String,
    /// Signed percentage points: model over-probability minus market's.
    pub edge_pct: f64,
    pub timestamp: DateTime<Utc>,
    /// Selected line first, one entry per bookmaker.
    pub odds: Vec<EdgeOdds>,
    pub model_projection: ProjectionSummary,
}

/// A projected market for which no odds were available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketMiss {
    pub player_id: String,
    pub market: String,
    pub error: EdgeError,
}

/// Output of one edge computation for a game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeSet {
    pub game_id: String,
    pub edges: Vec<Edge>,
    pub unavailable: Vec<MarketMiss>,
    pub computed_at: DateTime<Utc>,
}
