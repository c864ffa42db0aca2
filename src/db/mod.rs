use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

pub mod models;
use models::*;

/// Thread-safe SQLite handle (single connection behind a mutex).
///
/// Holds the resume state: the latest snapshot of every tracked match
/// (including its recorded event keys) and the delivery log.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Snapshots ─────────────────────────────────────────────────────────────

    /// Insert or replace the stored snapshot of a match.
    pub fn save_snapshot(&self, snapshot: &MatchSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot).context("Failed to encode snapshot")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO match_snapshots (match_id, status, kickoff, snapshot, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(match_id) DO UPDATE SET
                status=excluded.status,
                kickoff=excluded.kickoff,
                snapshot=excluded.snapshot,
                updated_at=excluded.updated_at",
            params![
                snapshot.match_id,
                snapshot.status.as_str(),
                snapshot.kickoff,
                json,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    /// Load every stored snapshot. Rows that no longer decode are skipped.
    pub fn load_snapshots(&self) -> Result<Vec<MatchSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT match_id, snapshot FROM match_snapshots ORDER BY kickoff")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for (match_id, json) in rows {
            match serde_json::from_str::<MatchSnapshot>(&json) {
                Ok(s) => snapshots.push(s),
                Err(e) => tracing::warn!(match_id = %match_id, "Skipping undecodable snapshot: {}", e),
            }
        }
        Ok(snapshots)
    }

    pub fn delete_snapshot(&self, match_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM match_snapshots WHERE match_id = ?1",
            params![match_id],
        )?;
        Ok(())
    }

    // ── Delivery log ──────────────────────────────────────────────────────────

    /// Record that an event was delivered through a channel (idempotent).
    pub fn record_delivery(&self, dedup_key: &str, channel: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO deliveries (dedup_key, channel, delivered_at)
             VALUES (?1, ?2, ?3)",
            params![dedup_key, channel, at],
        )?;
        Ok(())
    }

    /// Channel that already delivered this key, if any.
    pub fn delivered_via(&self, dedup_key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let channel = conn
            .query_row(
                "SELECT channel FROM deliveries WHERE dedup_key = ?1 ORDER BY delivered_at LIMIT 1",
                params![dedup_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(channel)
    }

    /// Drop delivery records older than `before`. Returns rows removed.
    pub fn prune_deliveries(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM deliveries WHERE delivered_at < ?1",
            params![before],
        )?;
        Ok(n)
    }
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS match_snapshots (
    match_id    TEXT    PRIMARY KEY,
    status      TEXT    NOT NULL,
    kickoff     TEXT    NOT NULL,
    snapshot    TEXT    NOT NULL,
    updated_at  TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS deliveries (
    dedup_key    TEXT    NOT NULL,
    channel      TEXT    NOT NULL,
    delivered_at TEXT    NOT NULL,
    PRIMARY KEY (dedup_key, channel)
);

CREATE INDEX IF NOT EXISTS idx_deliveries_at ON deliveries(delivered_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot(id: &str) -> MatchSnapshot {
        let kickoff = Utc.with_ymd_and_hms(2024, 5, 4, 14, 0, 0).unwrap();
        MatchSnapshot {
            match_id: id.into(),
            home: Team::new("42", "Arsenal"),
            away: Team::new("49", "Chelsea"),
            competition: Some("Premier League".into()),
            status: MatchStatus::Live,
            score: Score::new(1, 0),
            minute: Some(23),
            recorded_events: ["1:match_start:0:0-0:".to_string()].into_iter().collect(),
            kickoff,
            last_updated: kickoff,
            timeline: vec![],
            shootout: None,
        }
    }

    #[test]
    fn test_snapshot_persists_recorded_events() {
        let db = Database::open_in_memory().unwrap();
        let s = snapshot("1");
        db.save_snapshot(&s).unwrap();

        let mut updated = s.clone();
        updated.score = Score::new(2, 0);
        db.save_snapshot(&updated).unwrap();

        let loaded = db.load_snapshots().unwrap();
        assert_eq!(loaded, vec![updated]);

        db.delete_snapshot("1").unwrap();
        assert!(db.load_snapshots().unwrap().is_empty());
    }

    #[test]
    fn test_delivery_log() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 4, 14, 0, 0).unwrap();
        assert_eq!(db.delivered_via("k1").unwrap(), None);

        db.record_delivery("k1", "email", t0).unwrap();
        db.record_delivery("k1", "email", t0).unwrap();
        assert_eq!(db.delivered_via("k1").unwrap().as_deref(), Some("email"));

        let removed = db.prune_deliveries(t0 + chrono::Duration::days(1)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.delivered_via("k1").unwrap(), None);
    }
}
