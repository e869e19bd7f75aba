//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! The engine and the history policy call store methods; they never
//! execute SQL directly.

use crate::{error::FunnelResult, types::RunTimestamp};
use rusqlite::{params, Connection};

mod history;

pub struct HistoryStore {
    conn: Connection,
    path: Option<String>, // None for :memory:
}

impl HistoryStore {
    /// Open (or create) the history database at `path`.
    pub fn open(path: &str) -> FunnelResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only matters for real files; ignore failures elsewhere.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> FunnelResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> FunnelResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_history.sql"))?;
        Ok(())
    }

    // ── Run ────────────────────────────────────────────────────

    pub fn insert_run(
        &self,
        run_id: &str,
        run_timestamp: RunTimestamp,
        eligibility_table: &str,
        offer_code: &str,
        version: &str,
    ) -> FunnelResult<()> {
        self.conn.execute(
            "INSERT INTO funnel_run (run_id, run_timestamp, eligibility_table, offer_code, version)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                run_timestamp.timestamp(),
                eligibility_table,
                offer_code,
                version
            ],
        )?;
        Ok(())
    }

    pub fn run_count(&self) -> FunnelResult<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM funnel_run", [], |row| row.get(0))?;
        Ok(n)
    }
}
