//! Team momentum from a sequence of game snapshots.
//!
//! For each side we look at a short window of game time at the end of the
//! history and compare it with the whole game so far:
//!
//! - **overall**: the scoring run inside the window (points for − against)
//! - **offense**: window points/min − game points/min
//! - **defense**: opponent game points/min − opponent window points/min
//!
//! Each raw delta is the metric's `net_change`; the logistic squash of it is the
//! bounded `overall` value, and its sign (outside a dead zone) is the trend.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::db::models::{
    GameMomentum, GameSnapshot, GameStatus, KeyFactor, MatchupMetrics, MomentumMetrics,
    HomeAway, Predictions, TeamMetrics, TeamMomentum, Trend,
};
use crate::error::EdgeError;

use super::win_probability::{final_probabilities, sigmoid, win_probabilities, HOME_ADVANTAGE};

/// Scale for squashing a scoring run (points). A 6-0 run maps to ~0.73.
const RUN_SCALE: f64 = 6.0;
/// Scale for squashing per-minute scoring rate deltas.
const RATE_SCALE: f64 = 1.5;
/// Run length that saturates the scoring-run key factor.
const RUN_FACTOR_SCALE: f64 = 10.0;

/// Tunables for the momentum engine.
#[derive(Debug, Clone)]
pub struct MomentumSettings {
    /// Length of the trailing window, in game-clock seconds.
    pub window_secs: u32,
    /// Snapshot count at which history stops adding confidence.
    pub min_snapshots: usize,
    /// Dead zone around zero for trend classification.
    pub trend_epsilon: f64,
    /// Game-clock advance between consecutive snapshots that counts as a gap.
    pub max_clock_gap_secs: u32,
    /// Confidence lost per detected gap.
    pub gap_penalty: f64,
    /// Upper bound on the total gap penalty.
    pub max_gap_penalty: f64,
    /// League-average combined scoring rate, points per minute.
    pub expected_points_per_minute: f64,
}

impl Default for MomentumSettings {
    fn default() -> Self {
        MomentumSettings {
            window_secs: 180,
            min_snapshots: 12,
            trend_epsilon: 0.25,
            max_clock_gap_secs: 120,
            gap_penalty: 0.15,
            max_gap_penalty: 0.6,
            expected_points_per_minute: 228.0 / 48.0,
        }
    }
}

/// Compute momentum and predictions for one game.
///
/// `history` must be non-empty, belong to a single game and be ordered by
/// timestamp ascending. Either a complete `GameMomentum` or an error is
/// returned, never a partial result.
pub fn compute_game_momentum(
    history: &[GameSnapshot],
    settings: &MomentumSettings,
) -> Result<GameMomentum, EdgeError> {
    let (first, last) = match (history.first(), history.last()) {
        (Some(f), Some(l)) => (f, l),
        _ => return Err(EdgeError::invalid_game("empty snapshot history")),
    };
    validate_history(history, &first.game_id)?;

    let window_start = window_start(history, last, settings.window_secs);
    let stats = ScoringStats::new(window_start, last);
    let confidence = history_confidence(history, settings);
    let stamp = last.timestamp;

    let pace_impact = pace_impact(&stats, settings.expected_points_per_minute);
    let home_margin = last.home.score as f64 - last.away.score as f64;

    let home_metrics = team_metrics(&stats.home, &stats.away, confidence, settings, stamp);
    let away_metrics = team_metrics(&stats.away, &stats.home, confidence, settings, stamp);

    let home_factors = key_factors(
        &stats.home,
        &stats.away,
        &home_metrics,
        pace_impact,
        home_margin,
        true,
        stats.window_minutes,
    );
    let away_factors = key_factors(
        &stats.away,
        &stats.home,
        &away_metrics,
        pace_impact,
        -home_margin,
        false,
        stats.window_minutes,
    );

    let home_overall = home_metrics.overall.overall;
    let away_overall = away_metrics.overall.overall;

    let matchup_metrics = MatchupMetrics {
        home_advantage: clamp01(0.5 + HOME_ADVANTAGE + (home_overall - away_overall) / 2.0),
        pace_impact,
        matchup_strength: clamp01(1.0 - (home_overall - away_overall).abs()),
    };

    let predictions = predictions(
        last,
        &stats,
        home_margin,
        home_overall,
        away_overall,
        pace_impact,
        confidence,
        settings,
    );

    Ok(GameMomentum {
        game_id: last.game_id.clone(),
        home_team: TeamMomentum {
            team_id: last.home.team_id.clone(),
            team_name: last.home.name.clone(),
            metrics: home_metrics,
            key_factors: home_factors,
        },
        away_team: TeamMomentum {
            team_id: last.away.team_id.clone(),
            team_name: last.away.name.clone(),
            metrics: away_metrics,
            key_factors: away_factors,
        },
        matchup_metrics,
        predictions,
        last_update: stamp,
    })
}

/// Trend from the sign of a raw delta, neutral inside `±epsilon`.
pub fn classify_trend(net_change: f64, epsilon: f64) -> Trend {
    if net_change > epsilon {
        Trend::Up
    } else if net_change < -epsilon {
        Trend::Down
    } else {
        Trend::Neutral
    }
}

fn validate_history(history: &[GameSnapshot], game_id: &str) -> Result<(), EdgeError> {
    if game_id.trim().is_empty() {
        return Err(EdgeError::invalid_game("snapshot has an empty game id"));
    }
    if let Some(stray) = history.iter().find(|s| s.game_id != game_id) {
        return Err(EdgeError::invalid_game(format!(
            "history mixes games {} and {}",
            game_id, stray.game_id
        )));
    }
    if history
        .windows(2)
        .any(|pair| pair[1].timestamp < pair[0].timestamp)
    {
        return Err(EdgeError::invalid_game(format!(
            "snapshot history for {} is not time-ordered",
            game_id
        )));
    }
    Ok(())
}

/// Earliest snapshot whose game clock falls inside the trailing window.
fn window_start<'a>(
    history: &'a [GameSnapshot],
    last: &'a GameSnapshot,
    window_secs: u32,
) -> &'a GameSnapshot {
    let end = last.clock.elapsed_secs();
    history
        .iter()
        .find(|s| s.clock.elapsed_secs().saturating_add(window_secs) >= end)
        .unwrap_or(last)
}

/// Per-side scoring numbers used by every metric.
#[derive(Debug, Clone, Copy)]
struct SideStats {
    score: f64,
    window_points: f64,
    window_rate: f64,
    game_rate: f64,
}

#[derive(Debug, Clone, Copy)]
struct ScoringStats {
    home: SideStats,
    away: SideStats,
    game_minutes: f64,
    window_minutes: f64,
}

impl ScoringStats {
    fn new(start: &GameSnapshot, last: &GameSnapshot) -> Self {
        let game_minutes = last.clock.elapsed_secs() as f64 / 60.0;
        let window_minutes = last
            .clock
            .elapsed_secs()
            .saturating_sub(start.clock.elapsed_secs()) as f64
            / 60.0;

        let side = |start_score: u32, score: u32| {
            let score = score as f64;
            let window_points = score - start_score as f64;
            let game_rate = if game_minutes > 0.0 {
                score / game_minutes
            } else {
                0.0
            };
            // A zero-length window carries no signal of its own.
            let window_rate = if window_minutes > 0.0 {
                window_points / window_minutes
            } else {
                game_rate
            };
            SideStats {
                score,
                window_points,
                window_rate,
                game_rate,
            }
        };

        ScoringStats {
            home: side(start.home.score, last.home.score),
            away: side(start.away.score, last.away.score),
            game_minutes,
            window_minutes,
        }
    }
}

fn history_confidence(history: &[GameSnapshot], settings: &MomentumSettings) -> f64 {
    let target = settings.min_snapshots.max(1);
    let coverage = history.len().min(target) as f64 / target as f64;
    let gaps = history
        .windows(2)
        .filter(|pair| {
            pair[1]
                .clock
                .elapsed_secs()
                .saturating_sub(pair[0].clock.elapsed_secs())
                > settings.max_clock_gap_secs
        })
        .count();
    let penalty = (gaps as f64 * settings.gap_penalty).min(settings.max_gap_penalty);
    clamp01(coverage * (1.0 - penalty))
}

fn metric(
    net_change: f64,
    scale: f64,
    confidence: f64,
    settings: &MomentumSettings,
    stamp: DateTime<Utc>,
) -> MomentumMetrics {
    MomentumMetrics {
        overall: clamp01(sigmoid(net_change / scale)),
        net_change,
        trend: classify_trend(net_change, settings.trend_epsilon),
        confidence: clamp01(confidence),
        last_update: stamp,
    }
}

fn team_metrics(
    team: &SideStats,
    opponent: &SideStats,
    confidence: f64,
    settings: &MomentumSettings,
    stamp: DateTime<Utc>,
) -> TeamMetrics {
    let run = team.window_points - opponent.window_points;
    TeamMetrics {
        offense: metric(
            team.window_rate - team.game_rate,
            RATE_SCALE,
            confidence,
            settings,
            stamp,
        ),
        defense: metric(
            opponent.game_rate - opponent.window_rate,
            RATE_SCALE,
            confidence,
            settings,
            stamp,
        ),
        overall: metric(run, RUN_SCALE, confidence, settings, stamp),
    }
}

fn pace_impact(stats: &ScoringStats, expected_ppm: f64) -> f64 {
    if stats.game_minutes <= 0.0 || expected_ppm <= 0.0 {
        return 0.0;
    }
    let observed = (stats.home.score + stats.away.score) / stats.game_minutes;
    (2.0 * (observed - expected_ppm) / expected_ppm).tanh()
}

fn key_factors(
    team: &SideStats,
    opponent: &SideStats,
    metrics: &TeamMetrics,
    pace_impact: f64,
    margin: f64,
    is_home: bool,
    window_minutes: f64,
) -> Vec<KeyFactor> {
    let run = team.window_points - opponent.window_points;
    let mut factors = vec![
        KeyFactor {
            factor: "scoring_run".to_string(),
            impact: (run / RUN_FACTOR_SCALE).tanh(),
            description: format!(
                "{:.0}-{:.0} over the last {:.1} min",
                team.window_points, opponent.window_points, window_minutes
            ),
        },
        KeyFactor {
            factor: "offensive_efficiency".to_string(),
            impact: (metrics.offense.net_change / RATE_SCALE).tanh(),
            description: format!(
                "{:.2} pts/min recently vs {:.2} for the game",
                team.window_rate, team.game_rate
            ),
        },
        KeyFactor {
            factor: "defensive_stops".to_string(),
            impact: (metrics.defense.net_change / RATE_SCALE).tanh(),
            description: format!(
                "opponent at {:.2} pts/min recently vs {:.2} for the game",
                opponent.window_rate, opponent.game_rate
            ),
        },
        KeyFactor {
            factor: "pace".to_string(),
            // Extra possessions favour the side that needs to come back.
            impact: if margin == 0.0 {
                0.0
            } else {
                (-0.5 * pace_impact * margin.signum()).clamp(-1.0, 1.0)
            },
            description: format!("pace impact {:+.2}", pace_impact),
        },
    ];
    if is_home {
        factors.push(KeyFactor {
            factor: "home_court".to_string(),
            impact: 2.0 * HOME_ADVANTAGE,
            description: "home court advantage".to_string(),
        });
    }
    factors.sort_by(|a, b| {
        b.impact
            .abs()
            .partial_cmp(&a.impact.abs())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.factor.cmp(&b.factor))
    });
    factors
}

#[allow(clippy::too_many_arguments)]
fn predictions(
    last: &GameSnapshot,
    stats: &ScoringStats,
    home_margin: f64,
    home_overall: f64,
    away_overall: f64,
    pace_impact: f64,
    confidence: f64,
    settings: &MomentumSettings,
) -> Predictions {
    if last.status == GameStatus::Final {
        return Predictions {
            win_probability: final_probabilities(home_margin),
            expected_score: HomeAway {
                home: stats.home.score,
                away: stats.away.score,
            },
            confidence: 1.0,
        };
    }

    let minutes_remaining = last.clock.remaining_secs() as f64 / 60.0;
    let win_probability = win_probabilities(
        home_margin,
        home_overall,
        away_overall,
        minutes_remaining,
        pace_impact,
    );

    let projected_rate = |side: &SideStats| {
        if stats.game_minutes <= 0.0 {
            settings.expected_points_per_minute / 2.0
        } else {
            0.7 * side.game_rate + 0.3 * side.window_rate.max(0.0)
        }
    };
    let expected_score = HomeAway {
        home: stats.home.score + projected_rate(&stats.home) * minutes_remaining,
        away: stats.away.score + projected_rate(&stats.away) * minutes_remaining,
    };

    let total_minutes = stats.game_minutes + minutes_remaining;
    let progress = if total_minutes > 0.0 {
        stats.game_minutes / total_minutes
    } else {
        1.0
    };

    Predictions {
        win_probability,
        expected_score,
        confidence: clamp01(confidence * (0.5 + 0.5 * progress)),
    }
}

fn clamp01(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{GameClock, TeamLine};
    use crate::error::ErrorCode;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn snap(ts: i64, period: u32, secs_left: u32, home: u32, away: u32) -> GameSnapshot {
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
            clock: GameClock::new(period, secs_left),
            status: GameStatus::InProgress,
            timestamp: Utc.timestamp_opt(1_700_000_000 + ts, 0).unwrap(),
        }
    }

    /// Steady back-and-forth scoring, one snapshot every 30 game seconds.
    fn even_history(n: usize) -> Vec<GameSnapshot> {
        (0..n)
            .map(|i| {
                let elapsed = 600 + 30 * i as u32;
                let period = elapsed / 720 + 1;
                let left = 720 - elapsed % 720;
                let pts = (i as u32) * 2;
                snap(i as i64 * 10, period, left, 20 + pts, 20 + pts)
            })
            .collect()
    }

    #[test]
    fn test_empty_history_is_invalid() {
        let err = compute_game_momentum(&[], &MomentumSettings::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidGame);
    }

    #[test]
    fn test_mixed_game_ids_are_invalid() {
        let mut history = even_history(3);
        history[1].game_id = "other".into();
        let err = compute_game_momentum(&history, &MomentumSettings::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidGame);
    }

    #[test]
    fn test_out_of_order_history_is_invalid() {
        let mut history = even_history(3);
        history.swap(0, 2);
        let err = compute_game_momentum(&history, &MomentumSettings::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidGame);
    }

    #[test]
    fn test_single_snapshot_is_accepted() {
        let m = compute_game_momentum(&[snap(0, 1, 720, 0, 0)], &MomentumSettings::default())
            .unwrap();
        assert_relative_eq!(
            m.predictions.win_probability.home + m.predictions.win_probability.away,
            1.0,
            epsilon = 1e-6
        );
        assert_eq!(m.home_team.metrics.overall.trend, Trend::Neutral);
    }

    #[test]
    fn test_outputs_stay_in_bounds() {
        let settings = MomentumSettings::default();
        for home_run in [0u32, 5, 14, 30] {
            for away_run in [0u32, 3, 12, 25] {
                for period in 1..=5 {
                    let history = vec![
                        snap(0, period, 300, 50, 50),
                        snap(10, period, 200, 50 + home_run / 2, 50 + away_run / 2),
                        snap(20, period, 100, 50 + home_run, 50 + away_run),
                    ];
                    let m = compute_game_momentum(&history, &settings).unwrap();
                    for team in [&m.home_team, &m.away_team] {
                        for metric in [
                            &team.metrics.offense,
                            &team.metrics.defense,
                            &team.metrics.overall,
                        ] {
                            assert!((0.0..=1.0).contains(&metric.overall));
                            assert!((0.0..=1.0).contains(&metric.confidence));
                        }
                        for f in &team.key_factors {
                            assert!((-1.0..=1.0).contains(&f.impact));
                        }
                    }
                    let mm = &m.matchup_metrics;
                    assert!((0.0..=1.0).contains(&mm.home_advantage));
                    assert!((0.0..=1.0).contains(&mm.matchup_strength));
                    assert!((-1.0..=1.0).contains(&mm.pace_impact));
                    let wp = m.predictions.win_probability;
                    assert!((0.0..=1.0).contains(&wp.home));
                    assert!((0.0..=1.0).contains(&wp.away));
                    assert_relative_eq!(wp.home + wp.away, 1.0, epsilon = 1e-6);
                    assert!((0.0..=1.0).contains(&m.predictions.confidence));
                }
            }
        }
    }

    #[test]
    fn test_confidence_grows_with_snapshots_below_minimum() {
        let settings = MomentumSettings::default();
        let full = even_history(settings.min_snapshots);
        let mut prev = 0.0;
        for n in 1..=full.len() {
            let m = compute_game_momentum(&full[..n], &settings).unwrap();
            let c = m.home_team.metrics.overall.confidence;
            assert!(c >= prev, "confidence dropped at n={}: {} < {}", n, c, prev);
            prev = c;
        }
        assert_relative_eq!(prev, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_clock_gaps_reduce_confidence() {
        let settings = MomentumSettings::default();
        let smooth = even_history(12);
        let mut gappy = smooth.clone();
        // Skip ahead four game minutes between two polls.
        for s in gappy.iter_mut().skip(6) {
            let elapsed = s.clock.elapsed_secs() + 240;
            s.clock = GameClock::new(elapsed / 720 + 1, 720 - elapsed % 720);
        }
        let a = compute_game_momentum(&smooth, &settings).unwrap();
        let b = compute_game_momentum(&gappy, &settings).unwrap();
        assert!(
            b.home_team.metrics.overall.confidence < a.home_team.metrics.overall.confidence
        );
    }

    #[test]
    fn test_ten_unanswered_points_trend_up_for_home() {
        let history = vec![
            snap(0, 4, 400, 88, 90),
            snap(10, 4, 350, 88, 90),
            snap(20, 4, 300, 91, 90),
            snap(30, 4, 270, 93, 90),
            snap(40, 4, 250, 96, 90),
            snap(50, 4, 230, 98, 90),
        ];
        let m = compute_game_momentum(&history, &MomentumSettings::default()).unwrap();
        let home = &m.home_team.metrics.overall;
        assert_eq!(home.trend, Trend::Up);
        assert!(home.net_change > 0.0);
        assert_relative_eq!(home.net_change, 10.0, epsilon = 1e-9);
        assert!(home.overall > 0.5);
        assert_eq!(m.away_team.metrics.overall.trend, Trend::Down);
        let run = m
            .home_team
            .key_factors
            .iter()
            .find(|f| f.factor == "scoring_run")
            .unwrap();
        assert!(run.impact > 0.7);
    }

    #[test]
    fn test_trend_dead_zone_is_neutral() {
        assert_eq!(classify_trend(0.2, 0.25), Trend::Neutral);
        assert_eq!(classify_trend(-0.25, 0.25), Trend::Neutral);
        assert_eq!(classify_trend(0.3, 0.25), Trend::Up);
        assert_eq!(classify_trend(-1.0, 0.25), Trend::Down);
    }

    #[test]
    fn test_key_factors_sorted_by_absolute_impact() {
        let history = vec![snap(0, 2, 500, 40, 44), snap(10, 2, 380, 47, 44)];
        let m = compute_game_momentum(&history, &MomentumSettings::default()).unwrap();
        for team in [&m.home_team, &m.away_team] {
            let impacts: Vec<f64> = team.key_factors.iter().map(|f| f.impact.abs()).collect();
            assert!(impacts.windows(2).all(|w| w[0] >= w[1]), "{:?}", impacts);
        }
        assert!(m.home_team.key_factors.iter().any(|f| f.factor == "home_court"));
        assert!(!m.away_team.key_factors.iter().any(|f| f.factor == "home_court"));
    }

    #[test]
    fn test_final_game_settles_predictions() {
        let mut last = snap(10, 4, 0, 101, 99);
        last.status = GameStatus::Final;
        let m = compute_game_momentum(&[snap(0, 4, 30, 99, 99), last], &MomentumSettings::default())
            .unwrap();
        assert_eq!(m.predictions.win_probability.home, 1.0);
        assert_eq!(m.predictions.win_probability.away, 0.0);
        assert_eq!(m.predictions.expected_score.home, 101.0);
    }

    #[test]
    fn test_expected_score_never_below_current() {
        let history = vec![snap(0, 3, 600, 60, 58), snap(10, 3, 500, 62, 64)];
        let m = compute_game_momentum(&history, &MomentumSettings::default()).unwrap();
        assert!(m.predictions.expected_score.home >= 62.0);
        assert!(m.predictions.expected_score.away >= 64.0);
    }
}
