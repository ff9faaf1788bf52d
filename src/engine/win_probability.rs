//! In-play basketball win probability.
//!
//! Standard margin model:
//!   P(team wins) = sigmoid(k * margin / sqrt(minutes_remaining))
//!
//! Individual baskets barely matter in Q1 but a 10-point lead with 4 minutes
//! left is close to decisive. Each side is estimated independently (its own
//! margin, momentum tilt and court prior) and the pair is normalised so the
//! two probabilities sum to exactly one.

use crate::db::models::HomeAway;

/// Logistic coefficient for the margin model.
/// Calibrated: 10-pt lead at HT → ~77%, 10-pt lead w/4min left → ~93%.
const MARGIN_K: f64 = 0.50;
/// Home-court advantage in win probability points, expressed around 0.5.
pub const HOME_ADVANTAGE: f64 = 0.035;
/// Weight of the momentum tilt in logit space. Momentum 1.0 vs 0.0 is worth
/// about as much as a 4-point lead at halftime.
const MOMENTUM_WEIGHT: f64 = 0.35;
/// How strongly a fast pace widens the outcome distribution.
const PACE_VOLATILITY: f64 = 0.5;
/// Floor on minutes remaining to avoid division by zero at the buzzer.
const MIN_REMAINING_MINUTES: f64 = 0.1;

/// Inputs for one side's independent estimate.
#[derive(Debug, Clone, Copy)]
pub struct SideInput {
    /// Points ahead (negative when trailing).
    pub margin: f64,
    /// Overall momentum in [0, 1].
    pub momentum: f64,
    /// True for the home side.
    pub is_home: bool,
}

pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        let z = (-x).exp();
        1.0 / (1.0 + z)
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

fn logit(p: f64) -> f64 {
    let p = p.clamp(1e-6, 1.0 - 1e-6);
    (p / (1.0 - p)).ln()
}

/// Home-court prior as a logit offset.
pub fn home_prior_logit() -> f64 {
    logit(0.5 + HOME_ADVANTAGE)
}

/// Unnormalised win probability for one side.
pub fn side_win_probability(side: SideInput, minutes_remaining: f64, pace_impact: f64) -> f64 {
    let remaining = minutes_remaining.max(MIN_REMAINING_MINUTES);
    let damping = 1.0 + PACE_VOLATILITY * pace_impact.max(0.0);
    let margin_term = MARGIN_K * side.margin / remaining.sqrt() / damping;
    let momentum_term = MOMENTUM_WEIGHT * (side.momentum - 0.5) * 2.0;
    let prior = if side.is_home {
        home_prior_logit()
    } else {
        -home_prior_logit()
    };
    sigmoid(margin_term + momentum_term + prior)
}

/// Estimate both sides independently and normalise so home + away = 1.
pub fn win_probabilities(
    home_margin: f64,
    home_momentum: f64,
    away_momentum: f64,
    minutes_remaining: f64,
    pace_impact: f64,
) -> HomeAway {
    let home_raw = side_win_probability(
        SideInput {
            margin: home_margin,
            momentum: home_momentum,
            is_home: true,
        },
        minutes_remaining,
        pace_impact,
    );
    let away_raw = side_win_probability(
        SideInput {
            margin: -home_margin,
            momentum: away_momentum,
            is_home: false,
        },
        minutes_remaining,
        pace_impact,
    );
    normalize(home_raw, away_raw)
}

/// Settled result once the final buzzer has sounded.
pub fn final_probabilities(home_margin: f64) -> HomeAway {
    if home_margin > 0.0 {
        HomeAway { home: 1.0, away: 0.0 }
    } else if home_margin < 0.0 {
        HomeAway { home: 0.0, away: 1.0 }
    } else {
        HomeAway { home: 0.5, away: 0.5 }
    }
}

fn normalize(home_raw: f64, away_raw: f64) -> HomeAway {
    let total = home_raw + away_raw;
    if !total.is_finite() || total <= 0.0 {
        return HomeAway { home: 0.5, away: 0.5 };
    }
    let home = (home_raw / total).clamp(0.0, 1.0);
    HomeAway {
        home,
        away: 1.0 - home,
    }
}
