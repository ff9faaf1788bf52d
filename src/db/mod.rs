use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

pub mod models;
use models::{EdgeSet, GameMomentum};

/// Thread-safe SQLite connection (single connection behind a mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Latest computed results for one game, as last written.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResult {
    pub game_id: String,
    pub momentum: Option<GameMomentum>,
    pub edges: Option<EdgeSet>,
    pub closed: bool,
    pub updated_at: DateTime<Utc>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path.
    /// `":memory:"` gives a throwaway database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        self.lock().execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves SQLite itself consistent.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Latest results ───────────────────────────────────────────────────────

    /// Replace the stored results for a game. Absent parts keep their
    /// previously stored value.
    pub fn save_latest(
        &self,
        game_id: &str,
        momentum: Option<&GameMomentum>,
        edges: Option<&EdgeSet>,
        closed: bool,
    ) -> Result<()> {
        let momentum_json = momentum.map(serde_json::to_string).transpose()?;
        let edges_json = edges.map(serde_json::to_string).transpose()?;
        self.lock().execute(
            "INSERT INTO latest_results (game_id, momentum_json, edges_json, closed, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(game_id) DO UPDATE SET
                momentum_json=COALESCE(excluded.momentum_json, latest_results.momentum_json),
                edges_json=COALESCE(excluded.edges_json, latest_results.edges_json),
                closed=excluded.closed,
                updated_at=excluded.updated_at",
            params![game_id, momentum_json, edges_json, closed, Utc::now()],
        )?;
        Ok(())
    }

    /// Load one game's stored results.
    #[cfg(test)]
    pub fn load(&self, game_id: &str) -> Result<Option<StoredResult>> {
        use rusqlite::OptionalExtension;
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT game_id, momentum_json, edges_json, closed, updated_at
                 FROM latest_results WHERE game_id=?1",
                params![game_id],
                map_row,
            )
            .optional()?;
        Ok(row.and_then(decode_row))
    }

    /// Load every stored game. Rows whose JSON no longer decodes are skipped.
    pub fn load_all(&self) -> Result<Vec<StoredResult>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT game_id, momentum_json, edges_json, closed, updated_at
             FROM latest_results ORDER BY updated_at DESC",
        )?;
        let rows = stmt
            .query_map([], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().filter_map(decode_row).collect())
    }

    /// Forget a game (cache eviction).
    pub fn remove(&self, game_id: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM latest_results WHERE game_id=?1", params![game_id])?;
        Ok(())
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

struct RawRow {
    game_id: String,
    momentum_json: Option<String>,
    edges_json: Option<String>,
    closed: bool,
    updated_at: DateTime<Utc>,
}

fn map_row(row: &rusqlite::Row) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        game_id: row.get(0)?,
        momentum_json: row.get(1)?,
        edges_json: row.get(2)?,
        closed: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn decode_row(raw: RawRow) -> Option<StoredResult> {
    let momentum = raw
        .momentum_json
        .as_deref()
        .map(serde_json::from_str::<GameMomentum>)
        .transpose();
    let momentum = match momentum {
        Ok(m) => m,
        Err(e) => {
            warn!("Skipping stored momentum for {}: {}", raw.game_id, e);
            return None;
        }
    };
    let edges = raw
        .edges_json
        .as_deref()
        .map(serde_json::from_str::<EdgeSet>)
        .transpose();
    let edges = match edges {
        Ok(e) => e,
        Err(e) => {
            warn!("Skipping stored edges for {}: {}", raw.game_id, e);
            return None;
        }
    };
    Some(StoredResult {
        game_id: raw.game_id,
        momentum,
        edges,
        closed: raw.closed,
        updated_at: raw.updated_at,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS latest_results (
    game_id       TEXT    PRIMARY KEY,
    momentum_json TEXT,
    edges_json    TEXT,
    closed        INTEGER NOT NULL DEFAULT 0,
    updated_at    TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_latest_results_updated ON latest_results(updated_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn edge_set(game_id: &str) -> EdgeSet {
        EdgeSet {
            game_id: game_id.into(),
            edges: vec![],
            unavailable: vec![],
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_and_load_latest() {
        let db = Database::open(":memory:").unwrap();
        db.save_latest("g1", None, Some(&edge_set("g1")), false).unwrap();

        let stored = db.load("g1").unwrap().unwrap();
        assert_eq!(stored.game_id, "g1");
        assert!(stored.momentum.is_none());
        assert_eq!(stored.edges.unwrap().game_id, "g1");
        assert!(!stored.closed);
        assert!(db.load("missing").unwrap().is_none());
    }

    #[test]
    fn test_upsert_keeps_single_row_and_prior_parts() {
        let db = Database::open(":memory:").unwrap();
        db.save_latest("g1", None, Some(&edge_set("g1")), false).unwrap();
        db.save_latest("g1", None, None, true).unwrap();

        let all = db.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].closed);
        assert!(all[0].edges.is_some(), "edges survive a partial update");
    }

    #[test]
    fn test_remove() {
        let db = Database::open(":memory:").unwrap();
        db.save_latest("g1", None, Some(&edge_set("g1")), false).unwrap();
        db.remove("g1").unwrap();
        assert!(db.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_row_is_skipped() {
        let db = Database::open(":memory:").unwrap();
        db.save_latest("good", None, Some(&edge_set("good")), false).unwrap();
        db.lock()
            .execute(
                "INSERT INTO latest_results (game_id, edges_json, closed, updated_at)
                 VALUES ('bad', '{not json', 0, ?1)",
                params![Utc::now()],
            )
            .unwrap();
        let all = db.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].game_id, "good");
    }
}
