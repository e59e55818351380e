//! Policies, allow-lists, spawn keys, groups and their members.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use strand_core::error::Result;
use strand_core::orchestration::{
    AllowlistEntry, FailurePolicy, GroupMember, GroupStatus, JoinMode, OrchestrationGroup,
    OrchestratorPolicy,
};
use strand_core::{RunId, RunStatus};

use crate::db::{json_col, opt_time_col, parsed_col, time_col, to_json, Database};

const GROUP_COLUMNS: &str = "id, orchestrator_run_id, parent_node_id, idempotency_prefix,
    failure_policy, join_mode, quorum_threshold, timeout_s, status, policy_snapshot,
    started_at, completed_at";

const MEMBER_COLUMNS: &str = "group_id, run_id, ordinal, status, target, input, spawn_key, attempt";

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<OrchestrationGroup> {
    Ok(OrchestrationGroup {
        id: row.get(0)?,
        orchestrator_run_id: RunId(row.get(1)?),
        parent_node_id: row.get(2)?,
        idempotency_prefix: row.get(3)?,
        failure_policy: parsed_col(row, 4, FailurePolicy::parse)?,
        join_mode: parsed_col(row, 5, JoinMode::parse)?,
        quorum_threshold: row.get(6)?,
        timeout_s: row.get(7)?,
        status: parsed_col(row, 8, GroupStatus::parse)?,
        policy_snapshot: json_col(row, 9)?,
        started_at: time_col(row, 10)?,
        completed_at: opt_time_col(row, 11)?,
    })
}

fn member_from_row(row: &Row<'_>) -> rusqlite::Result<GroupMember> {
    Ok(GroupMember {
        group_id: row.get(0)?,
        run_id: RunId(row.get(1)?),
        ordinal: row.get(2)?,
        status: parsed_col(row, 3, RunStatus::parse)?,
        target: json_col(row, 4)?,
        input: json_col(row, 5)?,
        spawn_key: row.get(6)?,
        attempt: row.get(7)?,
    })
}

fn allowlist_from_row(row: &Row<'_>) -> rusqlite::Result<AllowlistEntry> {
    Ok(AllowlistEntry {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        orchestrator_agent_id: row.get(2)?,
        target_agent_id: row.get(3)?,
        target_agent_slug: row.get(4)?,
        capability_tag: row.get(5)?,
        enabled: row.get(6)?,
    })
}

/// Orchestration tables. Policy and allow-list writes are admin
/// operations; everything else is driven by the kernel.
#[derive(Clone)]
pub struct OrchestrationStore {
    db: Arc<Database>,
}

impl OrchestrationStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // ── Policies ─────────────────────────────────────────────────

    pub fn set_policy(
        &self,
        tenant_id: &str,
        orchestrator_agent_id: &str,
        policy: &OrchestratorPolicy,
    ) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO orchestrator_policies (tenant_id, orchestrator_agent_id, policy, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (tenant_id, orchestrator_agent_id) DO UPDATE SET
                    policy = excluded.policy,
                    updated_at = excluded.updated_at",
                params![
                    tenant_id,
                    orchestrator_agent_id,
                    to_json(policy),
                    Utc::now().to_rfc3339()
                ],
            )
            .map(|_| ())
        })
    }

    pub fn policy(
        &self,
        tenant_id: &str,
        orchestrator_agent_id: &str,
    ) -> Result<Option<OrchestratorPolicy>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT policy FROM orchestrator_policies
                 WHERE tenant_id = ?1 AND orchestrator_agent_id = ?2",
                params![tenant_id, orchestrator_agent_id],
                |row| json_col(row, 0),
            )
            .optional()
        })
    }

    // ── Allow-list ───────────────────────────────────────────────

    pub fn add_allowlist_entry(&self, entry: &AllowlistEntry) -> Result<i64> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO orchestrator_allowlist
                    (tenant_id, orchestrator_agent_id, target_agent_id, target_agent_slug,
                     capability_tag, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.tenant_id,
                    entry.orchestrator_agent_id,
                    entry.target_agent_id,
                    entry.target_agent_slug,
                    entry.capability_tag,
                    entry.enabled,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn set_allowlist_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE orchestrator_allowlist SET enabled = ?2 WHERE id = ?1",
                params![id, enabled],
            )
            .map(|n| n == 1)
        })
    }

    pub fn allowlist(
        &self,
        tenant_id: &str,
        orchestrator_agent_id: &str,
    ) -> Result<Vec<AllowlistEntry>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tenant_id, orchestrator_agent_id, target_agent_id, target_agent_slug,
                        capability_tag, enabled
                 FROM orchestrator_allowlist
                 WHERE tenant_id = ?1 AND orchestrator_agent_id = ?2
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![tenant_id, orchestrator_agent_id], allowlist_from_row)?;
            rows.collect()
        })
    }

    // ── Spawn keys ───────────────────────────────────────────────

    pub fn spawn_key(&self, caller: &RunId, key: &str) -> Result<Option<RunId>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT child_run_id FROM spawn_keys WHERE caller_run_id = ?1 AND idempotency_key = ?2",
                params![caller.as_str(), key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map(|id| id.map(RunId))
        })
    }

    /// Bind `key` to `child` unless it is already bound. Returns the run
    /// the key ends up pointing at.
    pub fn claim_spawn_key(&self, caller: &RunId, key: &str, child: &RunId) -> Result<RunId> {
        self.db.with(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO spawn_keys (caller_run_id, idempotency_key, child_run_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![caller.as_str(), key, child.as_str(), Utc::now().to_rfc3339()],
            )?;
            let bound: String = tx.query_row(
                "SELECT child_run_id FROM spawn_keys WHERE caller_run_id = ?1 AND idempotency_key = ?2",
                params![caller.as_str(), key],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(RunId(bound))
        })
    }

    /// Drop a key whose child was never created.
    pub fn release_spawn_key(&self, caller: &RunId, key: &str) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "DELETE FROM spawn_keys WHERE caller_run_id = ?1 AND idempotency_key = ?2",
                params![caller.as_str(), key],
            )
            .map(|_| ())
        })
    }

    // ── Groups ───────────────────────────────────────────────────

    /// Insert `group` unless one with the same (orchestrator run, prefix)
    /// exists. Returns the stored group and whether it was newly created.
    pub fn claim_group(&self, group: &OrchestrationGroup) -> Result<(OrchestrationGroup, bool)> {
        self.db.with(|conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                &format!(
                    "INSERT OR IGNORE INTO orchestration_groups ({}) VALUES
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    GROUP_COLUMNS
                ),
                params![
                    group.id,
                    group.orchestrator_run_id.as_str(),
                    group.parent_node_id,
                    group.idempotency_prefix,
                    group.failure_policy.as_str(),
                    group.join_mode.as_str(),
                    group.quorum_threshold,
                    group.timeout_s,
                    group.status.as_str(),
                    to_json(&group.policy_snapshot),
                    group.started_at.to_rfc3339(),
                    group.completed_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            let stored = if inserted == 1 {
                group.clone()
            } else {
                tx.query_row(
                    &format!(
                        "SELECT {} FROM orchestration_groups
                         WHERE orchestrator_run_id = ?1 AND idempotency_prefix = ?2",
                        GROUP_COLUMNS
                    ),
                    params![group.orchestrator_run_id.as_str(), group.idempotency_prefix],
                    group_from_row,
                )?
            };
            tx.commit()?;
            Ok((stored, inserted == 1))
        })
    }

    pub fn group(&self, id: &str) -> Result<Option<OrchestrationGroup>> {
        self.db.with(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM orchestration_groups WHERE id = ?1", GROUP_COLUMNS),
                params![id],
                group_from_row,
            )
            .optional()
        })
    }

    pub fn group_by_prefix(
        &self,
        orchestrator_run_id: &RunId,
        prefix: &str,
    ) -> Result<Option<OrchestrationGroup>> {
        self.db.with(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM orchestration_groups
                     WHERE orchestrator_run_id = ?1 AND idempotency_prefix = ?2",
                    GROUP_COLUMNS
                ),
                params![orchestrator_run_id.as_str(), prefix],
                group_from_row,
            )
            .optional()
        })
    }

    /// `running -> status`. False when the group had already settled.
    pub fn set_group_status(&self, id: &str, status: GroupStatus) -> Result<bool> {
        let completed = status.is_terminal().then(|| Utc::now().to_rfc3339());
        self.db.with(|conn| {
            conn.execute(
                "UPDATE orchestration_groups SET status = ?2, completed_at = ?3
                 WHERE id = ?1 AND status = 'running'",
                params![id, status.as_str(), completed],
            )
            .map(|n| n == 1)
        })
    }

    /// Put a settled group back to running after re-spawning members.
    pub fn reopen_group(&self, id: &str) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE orchestration_groups SET status = 'running', completed_at = NULL,
                    started_at = ?2
                 WHERE id = ?1",
                params![id, Utc::now().to_rfc3339()],
            )
            .map(|_| ())
        })
    }

    /// Groups opened by any run of the tree rooted at `root`.
    pub fn groups_in_tree(&self, root: &RunId) -> Result<Vec<OrchestrationGroup>> {
        let columns = GROUP_COLUMNS
            .split(',')
            .map(|c| format!("g.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM orchestration_groups g
                 JOIN runs r ON r.id = g.orchestrator_run_id
                 WHERE r.root_run_id = ?1
                 ORDER BY g.started_at",
                columns
            ))?;
            let rows = stmt.query_map(params![root.as_str()], group_from_row)?;
            rows.collect()
        })
    }

    // ── Members ──────────────────────────────────────────────────

    pub fn add_member(&self, member: &GroupMember) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO orchestration_group_members ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    MEMBER_COLUMNS
                ),
                params![
                    member.group_id,
                    member.run_id.as_str(),
                    member.ordinal,
                    member.status.as_str(),
                    to_json(&member.target),
                    to_json(&member.input),
                    member.spawn_key,
                    member.attempt,
                ],
            )
            .map(|_| ())
        })
    }

    /// Every member row of a group, including superseded attempts.
    pub fn members(&self, group_id: &str) -> Result<Vec<GroupMember>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM orchestration_group_members WHERE group_id = ?1
                 ORDER BY ordinal, attempt",
                MEMBER_COLUMNS
            ))?;
            let rows = stmt.query_map(params![group_id], member_from_row)?;
            rows.collect()
        })
    }

    pub fn membership(&self, run_id: &RunId) -> Result<Option<GroupMember>> {
        self.db.with(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM orchestration_group_members WHERE run_id = ?1",
                    MEMBER_COLUMNS
                ),
                params![run_id.as_str()],
                member_from_row,
            )
            .optional()
        })
    }

    pub fn set_member_status(&self, group_id: &str, run_id: &RunId, status: RunStatus) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE orchestration_group_members SET status = ?3
                 WHERE group_id = ?1 AND run_id = ?2",
                params![group_id, run_id.as_str(), status.as_str()],
            )
            .map(|_| ())
        })
    }
}

/// Latest attempt of each ordinal, in ordinal order.
pub fn latest_attempts(members: Vec<GroupMember>) -> Vec<GroupMember> {
    let mut latest: Vec<GroupMember> = Vec::new();
    for member in members {
        match latest.last_mut() {
            Some(last) if last.ordinal == member.ordinal => {
                if member.attempt >= last.attempt {
                    *last = member;
                }
            }
            _ => latest.push(member),
        }
    }
    latest
}
