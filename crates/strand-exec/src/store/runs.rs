//! Run records and trace spans. Written only by the execution service.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use strand_core::error::Result;
use strand_core::{RunId, RunRecord, RunStatus, TraceSpan};

use crate::db::{
    json_col, opt_json_col, opt_time_col, parsed_col, time_col, to_json, Database,
};

const RUN_COLUMNS: &str = "id, tenant_id, agent_id, user_id, status, input_params, output_result,
    error_message, created_at, started_at, completed_at, parent_run_id, root_run_id, depth,
    orchestration_group_id, spawn_key, grant_id, principal_id, delegated_scopes";

const ACTIVE: &str = "('queued', 'running', 'paused')";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: RunId(row.get(0)?),
        tenant_id: row.get(1)?,
        agent_id: row.get(2)?,
        user_id: row.get(3)?,
        status: parsed_col(row, 4, RunStatus::parse)?,
        input_params: json_col(row, 5)?,
        output_result: opt_json_col(row, 6)?,
        error_message: row.get(7)?,
        created_at: time_col(row, 8)?,
        started_at: opt_time_col(row, 9)?,
        completed_at: opt_time_col(row, 10)?,
        parent_run_id: row.get::<_, Option<String>>(11)?.map(RunId),
        root_run_id: RunId(row.get(12)?),
        depth: row.get(13)?,
        orchestration_group_id: row.get(14)?,
        spawn_key: row.get(15)?,
        grant_id: row.get(16)?,
        principal_id: row.get(17)?,
        delegated_scopes: json_col(row, 18)?,
    })
}

fn span_from_row(row: &Row<'_>) -> rusqlite::Result<TraceSpan> {
    Ok(TraceSpan {
        run_id: RunId(row.get(0)?),
        span_id: row.get(1)?,
        parent_span_id: row.get(2)?,
        name: row.get(3)?,
        span_type: row.get(4)?,
        inputs: json_col(row, 5)?,
        outputs: opt_json_col(row, 6)?,
        start_time: time_col(row, 7)?,
        end_time: opt_time_col(row, 8)?,
        metadata: json_col(row, 9)?,
    })
}

#[derive(Clone)]
pub struct RunStore {
    db: Arc<Database>,
}

impl RunStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // ── Runs ─────────────────────────────────────────────────────

    pub fn insert(&self, run: &RunRecord) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                     ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                    RUN_COLUMNS
                ),
                params![
                    run.id.as_str(),
                    run.tenant_id,
                    run.agent_id,
                    run.user_id,
                    run.status.as_str(),
                    to_json(&run.input_params),
                    run.output_result.as_ref().map(to_json),
                    run.error_message,
                    run.created_at.to_rfc3339(),
                    run.started_at.map(|t| t.to_rfc3339()),
                    run.completed_at.map(|t| t.to_rfc3339()),
                    run.parent_run_id.as_ref().map(|p| p.as_str()),
                    run.root_run_id.as_str(),
                    run.depth,
                    run.orchestration_group_id,
                    run.spawn_key,
                    run.grant_id,
                    run.principal_id,
                    to_json(&run.delegated_scopes),
                ],
            )
            .map(|_| ())
        })
    }

    pub fn get(&self, id: &RunId) -> Result<Option<RunRecord>> {
        self.db.with(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![id.as_str()],
                run_from_row,
            )
            .optional()
        })
    }

    /// `from -> running`. False when the run was no longer in `from`.
    pub fn mark_running(&self, id: &RunId, from: RunStatus) -> Result<bool> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE runs SET status = 'running', started_at = COALESCE(started_at, ?2)
                 WHERE id = ?1 AND status = ?3",
                params![id.as_str(), Utc::now().to_rfc3339(), from.as_str()],
            )
            .map(|n| n == 1)
        })
    }

    pub fn mark_paused(&self, id: &RunId) -> Result<bool> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE runs SET status = 'paused' WHERE id = ?1 AND status = 'running'",
                params![id.as_str()],
            )
            .map(|n| n == 1)
        })
    }

    /// `running -> completed|failed`, recording output or error.
    pub fn finish(
        &self,
        id: &RunId,
        status: RunStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<bool> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE runs SET status = ?2, output_result = ?3, error_message = ?4, completed_at = ?5
                 WHERE id = ?1 AND status = 'running'",
                params![
                    id.as_str(),
                    status.as_str(),
                    output.map(to_json),
                    error,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map(|n| n == 1)
        })
    }

    /// Fail a run that never got to run.
    pub fn fail_queued(&self, id: &RunId, error: &str) -> Result<bool> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE runs SET status = 'failed', error_message = ?2, completed_at = ?3
                 WHERE id = ?1 AND status = 'queued'",
                params![id.as_str(), error, Utc::now().to_rfc3339()],
            )
            .map(|n| n == 1)
        })
    }

    /// Any active state -> cancelled.
    pub fn cancel(&self, id: &RunId, reason: &str) -> Result<bool> {
        self.db.with(|conn| {
            conn.execute(
                &format!(
                    "UPDATE runs SET status = 'cancelled', completed_at = ?2,
                     error_message = COALESCE(error_message, ?3)
                     WHERE id = ?1 AND status IN {}",
                    ACTIVE
                ),
                params![id.as_str(), Utc::now().to_rfc3339(), reason],
            )
            .map(|n| n == 1)
        })
    }

    pub fn children(&self, parent: &RunId) -> Result<Vec<RunRecord>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM runs WHERE parent_run_id = ?1 ORDER BY created_at, rowid",
                RUN_COLUMNS
            ))?;
            let rows = stmt.query_map(params![parent.as_str()], run_from_row)?;
            rows.collect()
        })
    }

    pub fn count_children(&self, parent: &RunId) -> Result<u32> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM runs WHERE parent_run_id = ?1",
                params![parent.as_str()],
                |r| r.get(0),
            )
        })
    }

    /// Every run sharing `root`, shallowest first.
    pub fn tree(&self, root: &RunId) -> Result<Vec<RunRecord>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM runs WHERE root_run_id = ?1 ORDER BY depth, created_at, rowid",
                RUN_COLUMNS
            ))?;
            let rows = stmt.query_map(params![root.as_str()], run_from_row)?;
            rows.collect()
        })
    }

    // ── Trace spans ──────────────────────────────────────────────

    /// Insert a span, or refresh inputs of one already started.
    pub fn start_span(&self, span: &TraceSpan) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO trace_spans
                    (run_id, span_id, parent_span_id, name, span_type, inputs, start_time, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (run_id, span_id) DO UPDATE SET
                    inputs = excluded.inputs,
                    metadata = excluded.metadata",
                params![
                    span.run_id.as_str(),
                    span.span_id,
                    span.parent_span_id,
                    span.name,
                    span.span_type,
                    to_json(&span.inputs),
                    span.start_time.to_rfc3339(),
                    to_json(&span.metadata),
                ],
            )
            .map(|_| ())
        })
    }

    /// Close a span. A span never started is inserted already closed.
    #[allow(clippy::too_many_arguments)]
    pub fn end_span(
        &self,
        run_id: &RunId,
        span_id: &str,
        name: &str,
        span_type: &str,
        parent_span_id: Option<&str>,
        outputs: &Value,
        end_time: DateTime<Utc>,
    ) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO trace_spans
                    (run_id, span_id, parent_span_id, name, span_type, outputs, start_time, end_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT (run_id, span_id) DO UPDATE SET
                    outputs = excluded.outputs,
                    end_time = excluded.end_time",
                params![
                    run_id.as_str(),
                    span_id,
                    parent_span_id,
                    name,
                    span_type,
                    to_json(outputs),
                    end_time.to_rfc3339(),
                ],
            )
            .map(|_| ())
        })
    }

    pub fn spans(&self, run_id: &RunId) -> Result<Vec<TraceSpan>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, span_id, parent_span_id, name, span_type, inputs, outputs,
                        start_time, end_time, metadata
                 FROM trace_spans WHERE run_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![run_id.as_str()], span_from_row)?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> RunStore {
        RunStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    #[test]
    fn run_roundtrip_and_transitions() {
        let store = store();
        let mut run = RunRecord::top_level("t1", "agent", "u1", json!({"q": 1}));
        run.delegated_scopes = vec!["docs:read".into()];
        store.insert(&run).unwrap();

        let loaded = store.get(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Queued);
        assert_eq!(loaded.root_run_id, run.id);
        assert_eq!(loaded.delegated_scopes, vec!["docs:read"]);

        assert!(store.mark_running(&run.id, RunStatus::Queued).unwrap());
        assert!(!store.mark_running(&run.id, RunStatus::Queued).unwrap());
        assert!(store
            .finish(&run.id, RunStatus::Completed, Some(&json!("done")), None)
            .unwrap());
        // Terminal runs stay put.
        assert!(!store.cancel(&run.id, "late").unwrap());

        let done = store.get(&run.id).unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.output_result, Some(json!("done")));
        assert!(done.started_at.is_some() && done.completed_at.is_some());
    }

    #[test]
    fn only_queued_runs_fail_without_starting() {
        let store = store();
        let run = RunRecord::top_level("t1", "agent", "u1", json!(null));
        store.insert(&run).unwrap();

        assert!(store.fail_queued(&run.id, "backend 'remote' is not registered").unwrap());
        let failed = store.get(&run.id).unwrap().unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(failed.started_at.is_none());
        assert!(failed.completed_at.is_some());
        assert!(!store.mark_running(&run.id, RunStatus::Queued).unwrap());

        let started = RunRecord::top_level("t1", "agent", "u1", json!(null));
        store.insert(&started).unwrap();
        store.mark_running(&started.id, RunStatus::Queued).unwrap();
        assert!(!store.fail_queued(&started.id, "too late").unwrap());
    }

    #[test]
    fn children_and_tree() {
        let store = store();
        let root = RunRecord::top_level("t1", "orch", "u1", json!(null));
        store.insert(&root).unwrap();
        let child = RunRecord::child_of(&root, RunId::new(), "worker", json!(1));
        store.insert(&child).unwrap();
        let grandchild = RunRecord::child_of(&child, RunId::new(), "worker", json!(2));
        store.insert(&grandchild).unwrap();

        assert_eq!(store.count_children(&root.id).unwrap(), 1);
        let tree = store.tree(&root.id).unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree[2].depth, 2);
    }
}
