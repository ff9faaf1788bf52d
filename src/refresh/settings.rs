use anyhow::{bail, Result};
use std::time::Duration;

/// Polling, staleness and retry policy for the refresh coordinator.
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub poll_interval: Duration,
    /// How long a READY result counts as fresh.
    pub stale_after: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Edges with `|edge_pct|` below this are suppressed.
    pub min_edge_pct: f64,
    /// Consecutive transient failures before the schedule pauses.
    pub retry_attempts: u32,
    /// How long idle or closed entries stay cached.
    pub closed_retention: Duration,
    /// Snapshots kept per game.
    pub max_history: usize,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        RefreshSettings {
            poll_interval: Duration::from_millis(5_000),
            stale_after: Duration::from_millis(15_000),
            backoff_base: Duration::from_millis(1_000),
            backoff_cap: Duration::from_millis(30_000),
            min_edge_pct: 2.0,
            retry_attempts: 8,
            closed_retention: Duration::from_secs(15 * 60),
            max_history: 240,
        }
    }
}

impl RefreshSettings {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            bail!("poll interval must be > 0");
        }
        if self.stale_after < self.poll_interval {
            bail!(
                "stale window ({:?}) must be at least the poll interval ({:?})",
                self.stale_after,
                self.poll_interval
            );
        }
        if self.backoff_base.is_zero() || self.backoff_base > self.backoff_cap {
            bail!(
                "backoff base ({:?}) must be > 0 and <= cap ({:?})",
                self.backoff_base,
                self.backoff_cap
            );
        }
        if !self.min_edge_pct.is_finite() || self.min_edge_pct < 0.0 {
            bail!("min edge must be a non-negative number, got {}", self.min_edge_pct);
        }
        if self.retry_attempts == 0 {
            bail!("retry attempts must be >= 1");
        }
        if self.max_history == 0 {
            bail!("history size must be >= 1");
        }
        Ok(())
    }

    /// Scheduler tick: never slower than one second.
    pub fn tick_interval(&self) -> Duration {
        self.poll_interval.min(Duration::from_secs(1))
    }
}
