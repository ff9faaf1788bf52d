use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::backoff::{next_delay, with_jitter};
use super::subscription::{GameUpdate, Subscription};
use super::{GameStatusView, RefreshSettings, RefreshState};
use crate::db::models::{
    BookmakerLine, EdgeSet, GameMomentum, GameSnapshot, GameStatus, ModelProjection,
};
use crate::db::Database;
use crate::engine::{compute_edges, compute_game_momentum, MomentumSettings};
use crate::error::{EdgeError, ErrorCode, FeedError};
use crate::live_scores::GameStateSource;
use crate::odds::{OddsSource, ProjectionSource};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

type SharedFetch = Shared<BoxFuture<'static, Result<(), EdgeError>>>;

/// Upstream feeds the coordinator polls.
#[derive(Clone)]
pub struct Sources {
    pub games: Arc<dyn GameStateSource>,
    pub odds: Arc<dyn OddsSource>,
    pub projections: Arc<dyn ProjectionSource>,
}

/// One independently refreshed part of a cache entry.
pub(super) struct Part<T> {
    pub value: Option<Arc<T>>,
    pub fetched_at: Option<Instant>,
    pub fetched_at_utc: Option<DateTime<Utc>>,
    /// Set when the last attempt to refresh this part failed.
    pub error: Option<EdgeError>,
}

impl<T> Default for Part<T> {
    fn default() -> Self {
        Part {
            value: None,
            fetched_at: None,
            fetched_at_utc: None,
            error: None,
        }
    }
}

impl<T> Part<T> {
    pub fn set(&mut self, value: Arc<T>) {
        self.value = Some(value);
        self.touch();
    }

    /// Confirm the current value is still current.
    fn touch(&mut self) {
        self.fetched_at = Some(Instant::now());
        self.fetched_at_utc = Some(Utc::now());
        self.error = None;
    }
}

/// Cache entry and schedule for one game. Mutated only by the coordinator.
pub(super) struct GameEntry {
    pub state: RefreshState,
    pub in_flight: Option<SharedFetch>,
    pub history: VecDeque<GameSnapshot>,
    /// Timestamp of the newest applied snapshot.
    pub latest_snapshot_at: Option<DateTime<Utc>>,
    pub momentum: Part<GameMomentum>,
    pub edges: Part<EdgeSet>,
    pub last_error: Option<EdgeError>,
    pub failures: u32,
    pub next_attempt_at: Option<Instant>,
    pub last_attempt_at: Option<Instant>,
    pub last_success_at: Option<Instant>,
    /// Retry budget used up; polling continues at the backoff cap.
    pub degraded: bool,
    pub subscribers: usize,
    pub last_interest: Instant,
    pub closed_at: Option<Instant>,
    pub updates: broadcast::Sender<GameUpdate>,
}

impl GameEntry {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        GameEntry {
            state: RefreshState::Idle,
            in_flight: None,
            history: VecDeque::new(),
            latest_snapshot_at: None,
            momentum: Part::default(),
            edges: Part::default(),
            last_error: None,
            failures: 0,
            next_attempt_at: None,
            last_attempt_at: None,
            last_success_at: None,
            degraded: false,
            subscribers: 0,
            last_interest: Instant::now(),
            closed_at: None,
            updates,
        }
    }

    fn has_data(&self) -> bool {
        self.momentum.value.is_some() || self.edges.value.is_some()
    }

    /// Closed because the game itself was rejected, not because it ended.
    pub fn is_halted(&self) -> bool {
        self.state == RefreshState::Closed
            && self
                .last_error
                .as_ref()
                .is_some_and(|e| e.code == ErrorCode::InvalidGame)
    }

    fn is_fresh(&self, stale_after: Duration) -> bool {
        self.state == RefreshState::Ready
            && self
                .last_success_at
                .is_some_and(|t| t.elapsed() < stale_after)
    }

    /// Current cached state as an update, if there is anything to report.
    pub fn current_update(&self, game_id: &str) -> Option<GameUpdate> {
        if !self.has_data() && self.last_error.is_none() {
            return None;
        }
        Some(GameUpdate {
            game_id: game_id.to_string(),
            state: self.state,
            momentum: self.momentum.value.clone(),
            edges: self.edges.value.clone(),
            error: self.last_error.clone(),
        })
    }

    fn publish(&self, game_id: &str) {
        if let Some(update) = self.current_update(game_id) {
            // No receivers is fine.
            let _ = self.updates.send(update);
        }
    }

    fn view(&self, game_id: &str) -> GameStatusView {
        GameStatusView {
            game_id: game_id.to_string(),
            state: self.state,
            subscribers: self.subscribers,
            consecutive_failures: self.failures,
            degraded: self.degraded,
            last_error: self.last_error.clone(),
            fetched_at: self.momentum.fetched_at_utc.or(self.edges.fetched_at_utc),
        }
    }
}

pub(super) struct Inner {
    sources: Sources,
    pub settings: RefreshSettings,
    momentum_settings: MomentumSettings,
    db: Option<Database>,
    entries: Mutex<HashMap<String, GameEntry>>,
}

/// Schedules polling per game, deduplicates in-flight fetches, applies the
/// staleness and backoff policy and owns the result cache.
#[derive(Clone)]
pub struct RefreshCoordinator {
    pub(super) inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        sources: Sources,
        settings: RefreshSettings,
        momentum_settings: MomentumSettings,
        db: Option<Database>,
    ) -> Self {
        RefreshCoordinator {
            inner: Arc::new(Inner {
                sources,
                settings,
                momentum_settings,
                db,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.inner.settings
    }

    /// Seed the cache from the database. Entries come back STALE (or CLOSED)
    /// so readers get last-good data before the first poll completes.
    pub fn warm_from(&self, db: &Database) -> anyhow::Result<usize> {
        let stored = db.load_all()?;
        let mut entries = self.inner.lock();
        let mut loaded = 0;
        for row in stored {
            if entries.contains_key(&row.game_id) {
                continue;
            }
            let mut entry = GameEntry::new();
            entry.latest_snapshot_at = row.momentum.as_ref().map(|m| m.last_update);
            entry.momentum.value = row.momentum.map(Arc::new);
            entry.momentum.fetched_at_utc = Some(row.updated_at);
            entry.edges.value = row.edges.map(Arc::new);
            entry.edges.fetched_at_utc = Some(row.updated_at);
            if row.closed {
                entry.state = RefreshState::Closed;
                entry.closed_at = Some(Instant::now());
            } else {
                entry.state = RefreshState::Stale;
            }
            entries.insert(row.game_id, entry);
            loaded += 1;
        }
        info!("Warm-started {} game(s) from the database", loaded);
        Ok(loaded)
    }

    /// Refresh a game now, joining the in-flight fetch if there is one.
    /// Bypasses backoff; does nothing for closed games.
    pub async fn refresh(&self, game_id: &str) -> Result<(), EdgeError> {
        if game_id.trim().is_empty() {
            return Err(EdgeError::invalid_game("empty game id"));
        }
        let fetch = {
            let mut entries = self.inner.lock();
            let entry = entries
                .entry(game_id.to_string())
                .or_insert_with(GameEntry::new);
            entry.last_interest = Instant::now();
            match self.inner.start_fetch(entry, game_id) {
                Some(fetch) => fetch,
                None if entry.is_halted() => {
                    return Err(entry
                        .last_error
                        .clone()
                        .unwrap_or_else(|| EdgeError::invalid_game(game_id)))
                }
                None => return Ok(()),
            }
        };
        fetch.await
    }

    /// Register interest in a game. The first subscriber triggers a fetch;
    /// later ones attach to it.
    pub fn subscribe(&self, game_id: &str) -> Subscription {
        let mut entries = self.inner.lock();
        let entry = entries
            .entry(game_id.to_string())
            .or_insert_with(GameEntry::new);
        entry.subscribers += 1;
        let rx = entry.updates.subscribe();
        info!("Game {}: {} subscriber(s)", game_id, entry.subscribers);
        self.inner.ensure_fresh(entry, game_id);
        let initial = entry.current_update(game_id);
        drop(entries);
        Subscription::new(game_id.to_string(), initial, rx, Arc::clone(&self.inner))
    }

    pub fn status(&self) -> Vec<GameStatusView> {
        let entries = self.inner.lock();
        let mut views: Vec<GameStatusView> =
            entries.iter().map(|(id, entry)| entry.view(id)).collect();
        views.sort_by(|a, b| a.game_id.cmp(&b.game_id));
        views
    }

    /// One scheduler pass over every entry.
    pub fn tick(&self) {
        self.inner.tick();
    }

    /// Scheduler loop. Runs until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.inner.settings.tick_interval();
        info!("Refresh scheduler started (tick {:?})", period);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                _ = shutdown.recv() => {
                    info!("Refresh scheduler: shutdown signal received");
                    break;
                }
            }
        }
    }

    /// Wait for the game's in-flight fetch, if any.
    #[cfg(test)]
    pub(crate) async fn wait_idle(&self, game_id: &str) {
        let fetch = self
            .inner
            .lock()
            .get(game_id)
            .and_then(|e| e.in_flight.clone());
        if let Some(fetch) = fetch {
            let _ = fetch.await;
        }
    }
}

impl Inner {
    pub fn lock(&self) -> MutexGuard<'_, HashMap<String, GameEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a fetch unless one is already running; either way return the
    /// future to await. `None` for closed games.
    fn start_fetch(self: &Arc<Self>, entry: &mut GameEntry, game_id: &str) -> Option<SharedFetch> {
        if let Some(fetch) = &entry.in_flight {
            debug!("Game {}: joining in-flight fetch", game_id);
            return Some(fetch.clone());
        }
        if entry.state == RefreshState::Closed {
            return None;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Game {}: no async runtime, refresh skipped", game_id);
            return None;
        };

        let inner = Arc::clone(self);
        let id = game_id.to_string();
        // Spawned so the fetch completes even if every waiter goes away.
        let task = runtime.spawn(async move {
            match AssertUnwindSafe(inner.run_fetch(&id)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    error!("Refresh for {} panicked", id);
                    Err(inner.abandon_fetch(&id))
                }
            }
        });
        let inner = Arc::clone(self);
        let id = game_id.to_string();
        let fetch = async move {
            task.await.unwrap_or_else(|e| {
                error!("Refresh task for {} failed: {}", id, e);
                Err(inner.abandon_fetch(&id))
            })
        }
        .boxed()
        .shared();

        entry.in_flight = Some(fetch.clone());
        entry.state = RefreshState::Fetching;
        entry.last_attempt_at = Some(Instant::now());
        debug!("Game {}: fetch started", game_id);
        Some(fetch)
    }

    /// Release a fetch that ended without applying a result, so the entry
    /// is scheduled again instead of waiting on it forever.
    fn abandon_fetch(&self, game_id: &str) -> EdgeError {
        let err = EdgeError::edge_not_found(format!("refresh for game {} did not complete", game_id));
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(game_id) {
            if entry.in_flight.take().is_some() || entry.state == RefreshState::Fetching {
                self.record_failure(game_id, entry, err.clone(), None);
            }
        }
        err
    }

    async fn run_fetch(self: &Arc<Self>, game_id: &str) -> Result<(), EdgeError> {
        let (snapshot, lines, projections) = tokio::join!(
            self.sources.games.fetch_snapshot(game_id),
            self.sources.odds.fetch_lines(game_id),
            self.sources.projections.fetch_projections(game_id),
        );
        self.apply(game_id, snapshot, lines, projections)
    }

    fn apply(
        &self,
        game_id: &str,
        snapshot: Result<GameSnapshot, FeedError>,
        lines: Result<Vec<BookmakerLine>, FeedError>,
        projections: Result<Vec<ModelProjection>, FeedError>,
    ) -> Result<(), EdgeError> {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(game_id) else {
            debug!("Game {} evicted while fetching, result dropped", game_id);
            return Ok(());
        };
        entry.in_flight = None;

        let snapshot = match snapshot.and_then(|s| check_game_id(game_id, s)) {
            Ok(s) => s,
            Err(e) => {
                let retry_after = e.retry_after();
                let err = EdgeError::from(e);
                self.record_failure(game_id, entry, err.clone(), retry_after);
                return Err(err);
            }
        };
        let finished = snapshot.status == GameStatus::Final;

        let momentum_changed = match self.apply_snapshot(game_id, entry, snapshot) {
            Ok(changed) => changed,
            Err(err) => {
                self.record_failure(game_id, entry, err.clone(), None);
                return Err(err);
            }
        };

        let mut throttled = None;
        let edges_changed = match (lines, projections) {
            (Ok(lines), Ok(projections)) => {
                let set = compute_edges(
                    game_id,
                    &projections,
                    &lines,
                    self.settings.min_edge_pct,
                    Utc::now(),
                );
                debug!(
                    "Game {}: {} edge(s), {} market(s) without odds",
                    game_id,
                    set.edges.len(),
                    set.unavailable.len()
                );
                entry.edges.set(Arc::new(set));
                true
            }
            (Err(e), _) | (_, Err(e)) => {
                let retry_after = e.retry_after();
                let err = market_error(e);
                warn!("Game {}: market data not refreshed: {}", game_id, err);
                entry.edges.error = Some(err.clone());
                if err.code == ErrorCode::RateLimited {
                    throttled = Some((err, retry_after));
                }
                false
            }
        };

        if finished {
            info!("Game {} is final, closing", game_id);
            entry.state = RefreshState::Closed;
            entry.closed_at = Some(Instant::now());
            entry.next_attempt_at = None;
            entry.last_error = None;
        } else if let Some((err, retry_after)) = throttled.clone() {
            self.record_failure(game_id, entry, err, retry_after);
        } else {
            if entry.failures > 0 {
                info!("Game {} recovered after {} failure(s)", game_id, entry.failures);
            }
            entry.state = RefreshState::Ready;
            entry.failures = 0;
            entry.degraded = false;
            entry.next_attempt_at = None;
            entry.last_error = None;
            entry.last_success_at = Some(Instant::now());
        }

        if momentum_changed || edges_changed || finished {
            self.persist(game_id, entry);
            if throttled.is_none() {
                entry.publish(game_id);
            }
        }

        match throttled {
            Some((err, _)) if !finished => Err(err),
            _ => Ok(()),
        }
    }

    /// Append a snapshot and recompute momentum. Returns whether the cached
    /// momentum changed; older snapshots are discarded.
    fn apply_snapshot(
        &self,
        game_id: &str,
        entry: &mut GameEntry,
        snapshot: GameSnapshot,
    ) -> Result<bool, EdgeError> {
        if let Some(latest) = entry.latest_snapshot_at {
            if snapshot.timestamp < latest {
                debug!(
                    "Game {}: discarding superseded snapshot from {} (have {})",
                    game_id, snapshot.timestamp, latest
                );
                return Ok(false);
            }
            if snapshot.timestamp == latest {
                if entry.momentum.value.is_some() {
                    entry.momentum.touch();
                }
                return Ok(false);
            }
        }

        entry.latest_snapshot_at = Some(snapshot.timestamp);
        entry.history.push_back(snapshot);
        while entry.history.len() > self.settings.max_history {
            entry.history.pop_front();
        }

        let momentum = compute_game_momentum(entry.history.make_contiguous(), &self.momentum_settings)?;
        entry.momentum.set(Arc::new(momentum));
        Ok(true)
    }

    fn record_failure(
        &self,
        game_id: &str,
        entry: &mut GameEntry,
        err: EdgeError,
        retry_after: Option<Duration>,
    ) {
        if !err.code.is_retriable() {
            warn!("Game {} rejected, halting refresh: {}", game_id, err);
            entry.state = RefreshState::Closed;
            entry.closed_at = Some(Instant::now());
            entry.next_attempt_at = None;
        } else {
            entry.failures = entry.failures.saturating_add(1);
            entry.degraded = entry.failures >= self.settings.retry_attempts;
            let delay = if entry.degraded {
                let delay = with_jitter(self.settings.backoff_cap);
                retry_after.map_or(delay, |hint| hint.max(delay))
            } else {
                next_delay(
                    entry.failures,
                    self.settings.backoff_base,
                    self.settings.backoff_cap,
                    retry_after,
                )
            };
            entry.next_attempt_at = Some(Instant::now() + delay);
            entry.state = if entry.has_data() {
                RefreshState::Stale
            } else {
                RefreshState::Idle
            };
            if entry.degraded {
                warn!(
                    "Game {}: {} consecutive failures, polling every {:?}: {}",
                    game_id, entry.failures, delay, err
                );
            } else {
                warn!(
                    "Game {}: refresh failed (attempt {}), retrying in {:?}: {}",
                    game_id, entry.failures, delay, err
                );
            }
        }
        entry.last_error = Some(err);
        entry.publish(game_id);
    }

    fn persist(&self, game_id: &str, entry: &GameEntry) {
        let Some(db) = &self.db else {
            return;
        };
        if let Err(e) = db.save_latest(
            game_id,
            entry.momentum.value.as_deref(),
            entry.edges.value.as_deref(),
            entry.state == RefreshState::Closed,
        ) {
            error!("Failed to persist results for {}: {}", game_id, e);
        }
    }

    /// Reader or subscriber interest: retry a degraded game right away and
    /// fetch if the cached data is not fresh and backoff allows it.
    pub fn ensure_fresh(self: &Arc<Self>, entry: &mut GameEntry, game_id: &str) {
        let now = Instant::now();
        entry.last_interest = now;
        if entry.state == RefreshState::Closed || entry.in_flight.is_some() {
            return;
        }
        if entry.degraded {
            info!("Game {}: retry re-armed by interest", game_id);
            entry.degraded = false;
            entry.failures = 0;
            entry.next_attempt_at = None;
        }
        if entry.next_attempt_at.is_some_and(|t| t > now) {
            return;
        }
        if entry.is_fresh(self.settings.stale_after) {
            return;
        }
        self.start_fetch(entry, game_id);
    }

    pub fn release_interest(&self, game_id: &str) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(game_id) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
            entry.last_interest = Instant::now();
            if entry.subscribers == 0 {
                info!("Game {}: no subscribers left, polling stops", game_id);
            }
        }
    }

    fn tick(self: &Arc<Self>) {
        let now = Instant::now();
        let retention = self.settings.closed_retention;
        let mut evicted = Vec::new();

        let mut entries = self.lock();
        entries.retain(|game_id, entry| {
            if entry.state == RefreshState::Closed {
                if entry.closed_at.is_some_and(|t| now.duration_since(t) >= retention) {
                    evicted.push(game_id.clone());
                    return false;
                }
                return true;
            }

            if entry.state == RefreshState::Ready && !entry.is_fresh(self.settings.stale_after) {
                debug!("Game {}: READY -> STALE", game_id);
                entry.state = RefreshState::Stale;
            }

            if entry.subscribers == 0 {
                if entry.in_flight.is_none() && now.duration_since(entry.last_interest) >= retention {
                    evicted.push(game_id.clone());
                    return false;
                }
                return true;
            }

            if entry.in_flight.is_some() {
                return true;
            }
            if entry.next_attempt_at.is_some_and(|t| t > now) {
                return true;
            }
            let due = entry
                .last_attempt_at
                .map_or(true, |t| now.duration_since(t) >= self.settings.poll_interval);
            if due {
                self.start_fetch(entry, game_id);
            }
            true
        });
        drop(entries);

        for game_id in evicted {
            info!("Game {}: evicted from cache", game_id);
            if let Some(db) = &self.db {
                if let Err(e) = db.remove(&game_id) {
                    error!("Failed to remove stored results for {}: {}", game_id, e);
                }
            }
        }
    }
}

fn check_game_id(game_id: &str, snapshot: GameSnapshot) -> Result<GameSnapshot, FeedError> {
    if snapshot.game_id != game_id {
        return Err(FeedError::WrongGame {
            requested: game_id.to_string(),
            received: snapshot.game_id,
        });
    }
    Ok(snapshot)
}

/// Odds and projection failures never invalidate the game itself; only the
/// game-state feed can do that.
fn market_error(err: FeedError) -> EdgeError {
    match err {
        FeedError::RateLimited { .. } => EdgeError::from(err),
        other => EdgeError::edge_not_found(other.to_string()),
    }
}
