//! Model-vs-market edges for player prop markets.
//!
//! The model projects a stat as `Normal(mean, std_dev)`; the probability that
//! the player goes over a bookmaker line is `1 − Φ((line − mean) / std_dev)`.
//! The market's view is the no-vig over share of the selected quote:
//!
//!   p_market = (1/over) / (1/over + 1/under)
//!
//! and the edge is the gap in percentage points:
//!
//!   edge_pct = 100 × (p_model − p_market)
//!
//! Positive means the model likes the over more than the book does.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::db::models::{
    BookmakerLine, Edge, EdgeOdds, EdgeSet, MarketMiss, ModelProjection, ProjectionSummary,
};
use crate::error::EdgeError;

/// Width of the time bucket that keeps `edge_id` stable across recomputation.
pub const EDGE_BUCKET_SECS: i64 = 60;

/// Standard normal CDF approximation (Abramowitz-Stegun 7.1.26)
pub fn normal_cdf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let z = x.abs() / std::f64::consts::SQRT_2;

    let t = 1.0 / (1.0 + p * z);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-z * z).exp();

    0.5 * (1.0 + sign * y)
}

/// Model probability that the stat lands over `line`.
pub fn model_over_probability(mean: f64, std_dev: f64, line: f64) -> f64 {
    if std_dev <= 0.0 {
        return match mean.partial_cmp(&line) {
            Some(Ordering::Greater) => 1.0,
            Some(Ordering::Less) => 0.0,
            _ => 0.5,
        };
    }
    (1.0 - normal_cdf((line - mean) / std_dev)).clamp(0.0, 1.0)
}

/// No-vig over probability implied by a pair of decimal prices.
pub fn market_over_probability(over: f64, under: f64) -> f64 {
    let over_implied = 1.0 / over;
    let under_implied = 1.0 / under;
    over_implied / (over_implied + under_implied)
}

/// Bookmaker margin on a two-way quote. Lower is tighter.
pub fn overround(over: f64, under: f64) -> f64 {
    1.0 / over + 1.0 / under - 1.0
}

pub fn edge_id(game_id: &str, player_id: &str, market: &str, as_of: DateTime<Utc>) -> String {
    format!(
        "{}:{}:{}:{}",
        game_id,
        player_id,
        market,
        as_of.timestamp().div_euclid(EDGE_BUCKET_SECS)
    )
}

/// Compute one edge per projected player + market.
///
/// Markets with no usable quote are reported in `unavailable` as
/// `EDGE_NOT_FOUND`; edges with `|edge_pct| < min_edge_pct` are dropped
/// silently (an edge exactly at the threshold is kept).
pub fn compute_edges(
    game_id: &str,
    projections: &[ModelProjection],
    lines: &[BookmakerLine],
    min_edge_pct: f64,
    as_of: DateTime<Utc>,
) -> EdgeSet {
    let mut edges = Vec::new();
    let mut unavailable = Vec::new();
    let mut seen: HashSet<(&str, &str)> = HashSet::new();

    for projection in projections {
        if !seen.insert((projection.player_id.as_str(), projection.market.as_str())) {
            continue;
        }
        if !projection.mean.is_finite()
            || !projection.std_dev.is_finite()
            || projection.std_dev < 0.0
        {
            warn!(
                "Skipping projection for {} {} with invalid distribution (mean={}, sd={})",
                projection.player_id, projection.market, projection.mean, projection.std_dev
            );
            continue;
        }

        let quotes = best_quotes(projection, lines);
        let Some(selected) = quotes.first() else {
            unavailable.push(MarketMiss {
                player_id: projection.player_id.clone(),
                market: projection.market.clone(),
                error: EdgeError::edge_not_found(format!(
                    "no odds for {} {} in game {}",
                    projection.player_name, projection.market, game_id
                )),
            });
            continue;
        };

        let p_model = model_over_probability(projection.mean, projection.std_dev, selected.line);
        let p_market = market_over_probability(selected.over, selected.under);
        let edge_pct = 100.0 * (p_model - p_market);

        if edge_pct.abs() < min_edge_pct {
            debug!(
                "Edge {:+.2}% for {} {} below threshold {:.2}%",
                edge_pct, projection.player_id, projection.market, min_edge_pct
            );
            continue;
        }

        edges.push(Edge {
            edge_id: edge_id(game_id, &projection.player_id, &projection.market, as_of),
            game_id: game_id.to_string(),
            player_id: projection.player_id.clone(),
            player_name: projection.player_name.clone(),
            market: projection.market.clone(),
            edge_pct,
            timestamp: as_of,
            odds: quotes
                .iter()
                .map(|q| EdgeOdds {
                    bookmaker: q.bookmaker.clone(),
                    line: q.line,
                    over: q.over,
                    under: q.under,
                })
                .collect(),
            model_projection: ProjectionSummary {
                mean: projection.mean,
                std_dev: projection.std_dev,
                confidence: projection.confidence.clamp(0.0, 1.0),
            },
        });
    }

    edges.sort_by(|a, b| {
        b.edge_pct
            .abs()
            .partial_cmp(&a.edge_pct.abs())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.edge_id.cmp(&b.edge_id))
    });

    EdgeSet {
        game_id: game_id.to_string(),
        edges,
        unavailable,
        computed_at: as_of,
    }
}

/// Usable quotes for a projection, one per bookmaker, tightest first.
fn best_quotes<'a>(projection: &ModelProjection, lines: &'a [BookmakerLine]) -> Vec<&'a BookmakerLine> {
    let mut quotes: Vec<&BookmakerLine> = lines
        .iter()
        .filter(|l| l.player_id == projection.player_id && l.market == projection.market)
        .filter(|l| l.line.is_finite() && l.over > 1.0 && l.under > 1.0)
        .filter(|l| l.over.is_finite() && l.under.is_finite())
        .collect();

    quotes.sort_by(|a, b| {
        overround(a.over, a.under)
            .partial_cmp(&overround(b.over, b.under))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.bookmaker.cmp(&b.bookmaker))
    });

    // Sorted tightest first, so the first quote per bookmaker is its best.
    let mut bookmakers = HashSet::new();
    quotes.retain(|q| bookmakers.insert(q.bookmaker.clone()));
    quotes
}
