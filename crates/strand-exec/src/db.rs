use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use serde::de::DeserializeOwned;
use tracing::debug;

use strand_core::error::{Result, StrandError};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        status TEXT NOT NULL,
        input_params TEXT NOT NULL,
        output_result TEXT,
        error_message TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        parent_run_id TEXT,
        root_run_id TEXT NOT NULL,
        depth INTEGER NOT NULL DEFAULT 0,
        orchestration_group_id TEXT,
        spawn_key TEXT,
        grant_id TEXT,
        principal_id TEXT,
        delegated_scopes TEXT NOT NULL DEFAULT '[]'
    );
    CREATE INDEX IF NOT EXISTS idx_runs_parent ON runs(parent_run_id);
    CREATE INDEX IF NOT EXISTS idx_runs_root ON runs(root_run_id);

    CREATE TABLE IF NOT EXISTS trace_spans (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        span_id TEXT NOT NULL,
        parent_span_id TEXT,
        name TEXT NOT NULL,
        span_type TEXT NOT NULL,
        inputs TEXT NOT NULL DEFAULT 'null',
        outputs TEXT,
        start_time TEXT NOT NULL,
        end_time TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        UNIQUE (run_id, span_id)
    );

    CREATE TABLE IF NOT EXISTS orchestrator_policies (
        tenant_id TEXT NOT NULL,
        orchestrator_agent_id TEXT NOT NULL,
        policy TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, orchestrator_agent_id)
    );

    CREATE TABLE IF NOT EXISTS orchestrator_allowlist (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT NOT NULL,
        orchestrator_agent_id TEXT NOT NULL,
        target_agent_id TEXT,
        target_agent_slug TEXT,
        capability_tag TEXT,
        enabled INTEGER NOT NULL DEFAULT 1
    );
    CREATE INDEX IF NOT EXISTS idx_allowlist_orchestrator
        ON orchestrator_allowlist(tenant_id, orchestrator_agent_id);

    CREATE TABLE IF NOT EXISTS orchestration_groups (
        id TEXT PRIMARY KEY,
        orchestrator_run_id TEXT NOT NULL,
        parent_node_id TEXT,
        idempotency_prefix TEXT,
        failure_policy TEXT NOT NULL,
        join_mode TEXT NOT NULL,
        quorum_threshold INTEGER,
        timeout_s INTEGER NOT NULL,
        status TEXT NOT NULL,
        policy_snapshot TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        UNIQUE (orchestrator_run_id, idempotency_prefix)
    );

    CREATE TABLE IF NOT EXISTS orchestration_group_members (
        group_id TEXT NOT NULL,
        run_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        status TEXT NOT NULL,
        target TEXT NOT NULL,
        input TEXT NOT NULL,
        spawn_key TEXT,
        attempt INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (group_id, run_id)
    );

    CREATE TABLE IF NOT EXISTS spawn_keys (
        caller_run_id TEXT NOT NULL,
        idempotency_key TEXT NOT NULL,
        child_run_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (caller_run_id, idempotency_key)
    );
";

/// The SQLite database shared by the run and orchestration stores.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        debug!(path = %path.display(), "Opened database");
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StrandError::Database(e.to_string()))?;
        f(&mut conn).map_err(db_err)
    }
}

pub(crate) fn db_err(e: rusqlite::Error) -> StrandError {
    StrandError::Database(e.to_string())
}

// ── Column helpers ───────────────────────────────────────────────

fn conversion(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

pub(crate) fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion(idx, e))
}

pub(crate) fn opt_json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| conversion(idx, e)))
        .transpose()
}

pub(crate) fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

pub(crate) fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        DateTime::parse_from_rfc3339(&t)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion(idx, e))
    })
    .transpose()
}

/// Parse an enum column through its `parse` function.
pub(crate) fn parsed_col<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> Result<T>,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    parse(&text).map_err(|e| conversion(idx, e))
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_on_disk_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("strand.db");
        {
            let db = Database::open(&path).unwrap();
            db.with(|c| {
                c.execute(
                    "INSERT INTO spawn_keys VALUES ('r1', 'k', 'c1', '2024-01-01T00:00:00Z')",
                    [],
                )
            })
            .unwrap();
        }
        let db = Database::open(&path).unwrap();
        let child: String = db
            .with(|c| c.query_row("SELECT child_run_id FROM spawn_keys", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(child, "c1");
    }
}
