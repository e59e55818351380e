//! The orchestration kernel: policy-checked spawning, joining and
//! cancellation of child runs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use strand_core::config::OrchestrationConfig;
use strand_core::error::{Result, StrandError};
use strand_core::orchestration::{
    CancelOutcome, CancellationPropagated, FailurePolicy, GroupMember, GroupStatus, JoinMode,
    JoinOutcome, JoinRequest, MemberResult, OrchestrationGroup, OrchestratorPolicy,
    PendingMemberPolicy, ReplanAction, ReplanOutcome, SpawnGroupOutcome, SpawnGroupRequest,
    SpawnOutcome, SpawnRequest, TargetRef,
};
use strand_core::traits::Orchestrator;
use strand_core::{EventKind, RunId, RunRecord, RunStatus, RuntimeEvent};

use crate::catalog::DeployedAgent;
use crate::lineage::{LineageService, RunTree};
use crate::service::ExecutionService;
use crate::store::{latest_attempts, OrchestrationStore};

/// Longest join timeout a group records. Larger requests are clamped so the
/// value fits an SQLite integer.
const MAX_JOIN_TIMEOUT_S: u64 = i64::MAX as u64;

/// Far enough out to never fire; used when a deadline would overflow `Instant`.
const UNBOUNDED_WAIT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Where a new child lands inside a group.
struct Slot<'a> {
    group_id: &'a str,
    ordinal: u32,
    attempt: u32,
    target: &'a TargetRef,
}

/// A child to create, already authorized.
struct ChildSpec<'a> {
    agent: Arc<DeployedAgent>,
    input: serde_json::Value,
    key: Option<String>,
    scopes: Vec<String>,
    parent_node_id: Option<&'a str>,
    slot: Option<Slot<'a>>,
}

/// Latest attempt of every member, joined with its run record.
struct Tally {
    entries: Vec<(GroupMember, RunRecord)>,
    success: u32,
    failure: u32,
    running: u32,
}

impl Tally {
    fn results(&self) -> Vec<MemberResult> {
        self.entries
            .iter()
            .map(|(member, run)| MemberResult {
                run_id: run.id.clone(),
                ordinal: member.ordinal,
                status: run.status,
                output: run.output_result.clone(),
                error: run.error_message.clone(),
            })
            .collect()
    }
}

fn key_taken(key: &str, bound: &RunId) -> StrandError {
    StrandError::InvalidState(format!(
        "spawn key '{}' is already bound to run {}",
        key, bound
    ))
}

fn is_failure(status: RunStatus) -> bool {
    matches!(status, RunStatus::Failed | RunStatus::Cancelled)
}

/// Whether the join condition is settled, and whether the remaining
/// members must be cancelled (with the reason).
fn decide(
    mode: JoinMode,
    threshold: Option<u32>,
    failure_policy: FailurePolicy,
    tally: &Tally,
) -> Option<(GroupStatus, Option<&'static str>)> {
    match mode {
        JoinMode::All => {
            if tally.running > 0 {
                return None;
            }
            let ok = match failure_policy {
                FailurePolicy::FailGroup => tally.failure == 0,
                FailurePolicy::BestEffort => tally.success > 0 || tally.entries.is_empty(),
            };
            Some((if ok { GroupStatus::Completed } else { GroupStatus::Failed }, None))
        }
        JoinMode::Any => {
            if tally.success > 0 {
                Some((GroupStatus::Completed, None))
            } else if tally.running == 0 {
                Some((GroupStatus::Failed, None))
            } else {
                None
            }
        }
        JoinMode::Quorum => {
            let needed = threshold.unwrap_or(1);
            if tally.success >= needed {
                Some((GroupStatus::Completed, None))
            } else if tally.success + tally.running < needed {
                Some((GroupStatus::Failed, Some("quorum_unreachable")))
            } else {
                None
            }
        }
        JoinMode::FailFast => {
            if tally.failure > 0 {
                Some((GroupStatus::Failed, Some("fail_fast")))
            } else if tally.running == 0 {
                Some((GroupStatus::Completed, None))
            } else {
                None
            }
        }
    }
}

/// Spawns, joins and cancels child runs on behalf of orchestrator runs.
///
/// Run records are written only through the execution service; groups,
/// members and spawn keys only through this kernel.
pub struct OrchestrationKernel {
    service: Arc<ExecutionService>,
    store: OrchestrationStore,
    config: OrchestrationConfig,
    /// Serializes limit checks with the child creation they guard.
    spawn_lock: Mutex<()>,
}

impl OrchestrationKernel {
    pub fn new(
        service: Arc<ExecutionService>,
        store: OrchestrationStore,
        config: OrchestrationConfig,
    ) -> Self {
        Self {
            service,
            store,
            config,
            spawn_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &OrchestrationStore {
        &self.store
    }

    /// Read-only lineage view. Works even with the kernel disabled.
    pub fn query_tree(&self, run_id: &RunId) -> Result<RunTree> {
        LineageService::new(self.service.clone(), self.store.clone()).query_tree(run_id)
    }

    // ── Policy ───────────────────────────────────────────────────

    /// Emit a `policy_deny` event and build the error to return.
    fn deny(&self, caller: &RunId, operation: &str, reason: String) -> StrandError {
        warn!(run_id = %caller, operation, reason = %reason, "Orchestration request denied");
        self.service.publish(
            RuntimeEvent::new(EventKind::PolicyDeny, caller.clone(), operation)
                .with_data(json!({"operation": operation, "reason": reason})),
        );
        StrandError::Permission(reason)
    }

    fn ensure_enabled(&self, caller: &RunId, operation: &str) -> Result<()> {
        if self.config.kernel_enabled {
            Ok(())
        } else {
            Err(self.deny(caller, operation, "orchestration kernel is disabled".into()))
        }
    }

    fn policy_for(&self, caller: &RunRecord) -> Result<OrchestratorPolicy> {
        Ok(self
            .store
            .policy(&caller.tenant_id, &caller.agent_id)?
            .unwrap_or_else(|| self.config.default_policy.clone()))
    }

    fn active_caller(&self, caller_run_id: &RunId) -> Result<RunRecord> {
        let caller = self.service.get_run(caller_run_id)?;
        if caller.status.is_terminal() {
            return Err(StrandError::InvalidState(format!(
                "caller run {} is already {}",
                caller.id,
                caller.status.as_str()
            )));
        }
        Ok(caller)
    }

    /// Depth, publication and allow-list checks for one target.
    fn authorize(
        &self,
        caller: &RunRecord,
        policy: &OrchestratorPolicy,
        target: &TargetRef,
        operation: &str,
    ) -> Result<Arc<DeployedAgent>> {
        if caller.depth + 1 > policy.max_depth {
            return Err(self.deny(
                &caller.id,
                operation,
                format!(
                    "spawning at depth {} exceeds max_depth {}",
                    caller.depth + 1,
                    policy.max_depth
                ),
            ));
        }
        let agent = self.service.catalog().resolve(&caller.tenant_id, target)?;
        if policy.enforce_published_only && !agent.definition.published {
            return Err(self.deny(
                &caller.id,
                operation,
                format!("target {} is not published", target),
            ));
        }
        let allowlist = self.store.allowlist(&caller.tenant_id, &caller.agent_id)?;
        let def = &agent.definition;
        if !allowlist
            .iter()
            .any(|entry| entry.admits(&def.id, &def.slug, &def.capability_tags))
        {
            return Err(self.deny(
                &caller.id,
                operation,
                format!(
                    "target {} is not allow-listed for orchestrator '{}'",
                    target, caller.agent_id
                ),
            ));
        }
        Ok(agent)
    }

    /// Caller's delegated scopes, narrowed by policy and by the request.
    fn effective_scopes(
        caller: &RunRecord,
        policy: &OrchestratorPolicy,
        requested: Option<&Vec<String>>,
    ) -> Vec<String> {
        let mut scopes = caller.delegated_scopes.clone();
        if let Some(allowed) = &policy.allowed_scope_subset {
            scopes.retain(|s| allowed.contains(s));
        }
        if let Some(requested) = requested {
            scopes.retain(|s| requested.contains(s));
        }
        scopes
    }

    fn check_total(
        &self,
        caller: &RunRecord,
        policy: &OrchestratorPolicy,
        adding: u32,
        operation: &str,
    ) -> Result<()> {
        let existing = self.service.count_children(&caller.id)?;
        if existing + adding > policy.max_children_total {
            return Err(self.deny(
                &caller.id,
                operation,
                format!(
                    "{} more children would exceed max_children_total {} ({} already spawned)",
                    adding, policy.max_children_total, existing
                ),
            ));
        }
        Ok(())
    }

    // ── Children ─────────────────────────────────────────────────

    /// Create and start one child. A key already bound to another child
    /// returns that child instead, flagged idempotent.
    /// Fail before anything is created if a group member's key is taken.
    fn ensure_keys_free<'k>(
        &self,
        caller: &RunId,
        keys: impl IntoIterator<Item = &'k String>,
    ) -> Result<()> {
        for key in keys {
            if let Some(bound) = self.store.spawn_key(caller, key)? {
                return Err(key_taken(key, &bound));
            }
        }
        Ok(())
    }

    fn create_child(&self, caller: &RunRecord, spec: ChildSpec<'_>) -> Result<(RunId, bool)> {
        let child_id = RunId::new();
        if let Some(key) = &spec.key {
            let bound = self.store.claim_spawn_key(&caller.id, key, &child_id)?;
            if bound != child_id {
                // A group slot must own its child; reusing another run would leave the slot empty.
                if spec.slot.is_some() {
                    return Err(key_taken(key, &bound));
                }
                return Ok((bound, true));
            }
        }

        let mut record =
            RunRecord::child_of(caller, child_id.clone(), &spec.agent.definition.id, spec.input.clone());
        record.delegated_scopes = spec.scopes.clone();
        record.spawn_key = spec.key.clone();
        record.orchestration_group_id = spec.slot.as_ref().map(|s| s.group_id.to_string());

        if let Err(e) = self.service.start_child(record, spec.agent.clone()) {
            if let Some(key) = &spec.key {
                self.store.release_spawn_key(&caller.id, key)?;
            }
            return Err(e);
        }

        if let Some(slot) = &spec.slot {
            self.store.add_member(&GroupMember {
                group_id: slot.group_id.to_string(),
                run_id: child_id.clone(),
                ordinal: slot.ordinal,
                status: RunStatus::Queued,
                target: slot.target.clone(),
                input: spec.input.clone(),
                spawn_key: spec.key.clone(),
                attempt: slot.attempt,
            })?;
        }

        self.service.publish(
            RuntimeEvent::new(EventKind::SpawnDecision, caller.id.clone(), child_id.as_str())
                .with_data(json!({
                    "child_run_id": child_id,
                    "target_agent_id": spec.agent.definition.id,
                    "parent_node_id": spec.parent_node_id,
                    "group_id": spec.slot.as_ref().map(|s| s.group_id),
                    "idempotency_key": spec.key,
                    "effective_scopes": spec.scopes,
                    "idempotent": false,
                })),
        );
        Ok((child_id, false))
    }

    /// Load a group the caller owns.
    fn owned_group(&self, caller: &RunId, group_id: &str, operation: &str) -> Result<OrchestrationGroup> {
        let group = self.store.group(group_id)?.ok_or_else(|| {
            StrandError::Resolution(format!("orchestration group {} not found", group_id))
        })?;
        if &group.orchestrator_run_id != caller {
            return Err(self.deny(
                caller,
                operation,
                format!("group {} belongs to another orchestrator run", group_id),
            ));
        }
        Ok(group)
    }

    /// Group for a grouped `spawn_run`, opened on first use.
    fn group_for_spawn(
        &self,
        caller: &RunRecord,
        policy: &OrchestratorPolicy,
        req: &SpawnRequest,
        group_id: &str,
    ) -> Result<(OrchestrationGroup, u32)> {
        let group = match self.store.group(group_id)? {
            Some(group) => group,
            None => {
                let (group, _) = self.store.claim_group(&OrchestrationGroup {
                    id: group_id.to_string(),
                    orchestrator_run_id: caller.id.clone(),
                    parent_node_id: req.parent_node_id.clone(),
                    idempotency_prefix: None,
                    failure_policy: req.failure_policy.unwrap_or(policy.default_failure_policy),
                    join_mode: JoinMode::All,
                    quorum_threshold: None,
                    timeout_s: req
                        .timeout_s
                        .unwrap_or(policy.join_timeout_s)
                        .min(MAX_JOIN_TIMEOUT_S),
                    status: GroupStatus::Running,
                    policy_snapshot: policy.clone(),
                    started_at: Utc::now(),
                    completed_at: None,
                })?;
                group
            }
        };
        if group.orchestrator_run_id != caller.id {
            return Err(self.deny(
                &caller.id,
                "spawn_run",
                format!("group {} belongs to another orchestrator run", group_id),
            ));
        }
        if group.status.is_terminal() {
            return Err(StrandError::InvalidState(format!(
                "group {} is already {}",
                group_id,
                group.status.as_str()
            )));
        }
        let next_ordinal = self
            .store
            .members(&group.id)?
            .iter()
            .map(|m| m.ordinal + 1)
            .max()
            .unwrap_or(0);
        Ok((group, next_ordinal))
    }

    // ── Join ─────────────────────────────────────────────────────

    /// Latest attempt per member, mirroring run status onto member rows.
    fn tally(&self, group: &OrchestrationGroup) -> Result<Tally> {
        let mut tally = Tally {
            entries: vec![],
            success: 0,
            failure: 0,
            running: 0,
        };
        for member in latest_attempts(self.store.members(&group.id)?) {
            let run = self.service.get_run(&member.run_id)?;
            if run.status != member.status {
                self.store
                    .set_member_status(&group.id, &member.run_id, run.status)?;
            }
            match run.status {
                RunStatus::Completed => tally.success += 1,
                s if is_failure(s) => tally.failure += 1,
                _ => tally.running += 1,
            }
            tally.entries.push((member, run));
        }
        Ok(tally)
    }

    /// Cancel every member that has not settled, honouring the pending
    /// member policy for queued ones.
    async fn cancel_members(
        &self,
        group: &OrchestrationGroup,
        tally: &Tally,
        reason: &str,
    ) -> Result<CancellationPropagated> {
        let mut run_ids = vec![];
        for (member, run) in &tally.entries {
            let cancel = match run.status {
                RunStatus::Running | RunStatus::Paused => true,
                RunStatus::Queued => self.config.pending_member_policy == PendingMemberPolicy::Cancel,
                _ => false,
            };
            if !cancel {
                continue;
            }
            let outcome = self.cancel_tree(&run.id, reason).await?;
            if outcome.cancelled_run_ids.contains(&run.id) {
                self.store
                    .set_member_status(&group.id, &member.run_id, RunStatus::Cancelled)?;
                run_ids.push(run.id.clone());
            }
        }
        info!(
            group_id = %group.id,
            reason,
            count = run_ids.len(),
            "Propagated cancellation to group members"
        );
        self.service.publish(
            RuntimeEvent::new(
                EventKind::CancellationPropagation,
                group.orchestrator_run_id.clone(),
                group.id.as_str(),
            )
            .with_data(json!({"group_id": group.id, "reason": reason, "run_ids": run_ids})),
        );
        Ok(CancellationPropagated {
            count: run_ids.len(),
            run_ids,
            reason: reason.to_string(),
        })
    }

    async fn settle(
        &self,
        group: &OrchestrationGroup,
        mode: JoinMode,
        status: GroupStatus,
        cancel_reason: Option<&str>,
        tally: Tally,
    ) -> Result<JoinOutcome> {
        let propagated = match cancel_reason {
            Some(reason) => Some(self.cancel_members(group, &tally, reason).await?),
            None => None,
        };
        let tally = if propagated.is_some() {
            self.tally(group)?
        } else {
            tally
        };

        // A concurrent joiner may have settled the group first; report
        // what is stored.
        let status = if self.store.set_group_status(&group.id, status)? {
            status
        } else {
            self.store
                .group(&group.id)?
                .map(|g| g.status)
                .unwrap_or(status)
        };

        info!(
            group_id = %group.id,
            mode = mode.as_str(),
            status = status.as_str(),
            success = tally.success,
            failure = tally.failure,
            running = tally.running,
            "Join settled"
        );
        self.service.publish(
            RuntimeEvent::new(
                EventKind::JoinDecision,
                group.orchestrator_run_id.clone(),
                group.id.as_str(),
            )
            .with_data(json!({
                "group_id": group.id,
                "mode": mode,
                "status": status,
                "success_count": tally.success,
                "failure_count": tally.failure,
                "running_count": tally.running,
                "cancellation_propagated": propagated,
            })),
        );

        Ok(JoinOutcome {
            group_id: group.id.clone(),
            status,
            complete: status.is_terminal(),
            success_count: tally.success,
            failure_count: tally.failure,
            running_count: tally.running,
            cancellation_propagated: propagated,
            members: tally.results(),
        })
    }

    // ── Cancellation ─────────────────────────────────────────────

    /// Cancel `root` and all its descendants, parents before children.
    async fn cancel_tree(&self, root: &RunId, reason: &str) -> Result<CancelOutcome> {
        // Holding the spawn lock keeps new children from appearing
        // under a run while its subtree is being walked.
        let _guard = self.spawn_lock.lock().await;
        let mut outcome = CancelOutcome::default();
        let mut queue = VecDeque::from([root.clone()]);
        while let Some(run_id) = queue.pop_front() {
            if self.service.cancel_run(&run_id, reason)? {
                outcome.cancelled_run_ids.push(run_id.clone());
            } else {
                outcome.already_terminal.push(run_id.clone());
            }
            for child in self.service.children(&run_id)? {
                queue.push_back(child.id);
            }
        }
        Ok(outcome)
    }

    // ── Operations ───────────────────────────────────────────────

    async fn do_spawn_run(&self, req: SpawnRequest) -> Result<SpawnOutcome> {
        self.ensure_enabled(&req.caller_run_id, "spawn_run")?;
        let _guard = self.spawn_lock.lock().await;
        let caller = self.active_caller(&req.caller_run_id)?;

        if let Some(key) = &req.idempotency_key {
            if let Some(existing) = self.store.spawn_key(&caller.id, key)? {
                let child = self.service.get_run(&existing)?;
                debug!(run_id = %caller.id, child_run_id = %existing, key = %key, "Idempotent spawn");
                self.service.publish(
                    RuntimeEvent::new(EventKind::SpawnDecision, caller.id.clone(), existing.as_str())
                        .with_data(json!({"child_run_id": existing, "idempotency_key": key, "idempotent": true})),
                );
                return Ok(SpawnOutcome {
                    spawned_run_ids: vec![existing],
                    idempotent: true,
                    group_id: child.orchestration_group_id,
                    effective_scopes: child.delegated_scopes,
                });
            }
        }

        let policy = self.policy_for(&caller)?;
        let agent = self.authorize(&caller, &policy, &req.target, "spawn_run")?;
        self.check_total(&caller, &policy, 1, "spawn_run")?;

        let group = match &req.group_id {
            Some(group_id) => Some(self.group_for_spawn(&caller, &policy, &req, group_id)?),
            None => None,
        };
        let scopes = Self::effective_scopes(&caller, &policy, req.scope_subset.as_ref());
        let (child_id, idempotent) = self.create_child(
            &caller,
            ChildSpec {
                agent,
                input: req.input.clone(),
                key: req.idempotency_key.clone(),
                scopes: scopes.clone(),
                parent_node_id: req.parent_node_id.as_deref(),
                slot: group.as_ref().map(|(g, ordinal)| Slot {
                    group_id: &g.id,
                    ordinal: *ordinal,
                    attempt: 0,
                    target: &req.target,
                }),
            },
        )?;
        info!(
            run_id = %caller.id,
            child_run_id = %child_id,
            target = %req.target,
            "Spawned child run"
        );
        Ok(SpawnOutcome {
            spawned_run_ids: vec![child_id],
            idempotent,
            group_id: group.map(|(g, _)| g.id),
            effective_scopes: scopes,
        })
    }

    async fn do_spawn_group(&self, req: SpawnGroupRequest) -> Result<SpawnGroupOutcome> {
        self.ensure_enabled(&req.caller_run_id, "spawn_group")?;
        if req.targets.is_empty() {
            return Err(StrandError::InvalidState(
                "spawn_group needs at least one target".into(),
            ));
        }
        let _guard = self.spawn_lock.lock().await;
        let caller = self.active_caller(&req.caller_run_id)?;
        let policy = self.policy_for(&caller)?;

        let fanout = req.targets.len() as u32;
        if fanout > policy.max_fanout {
            return Err(self.deny(
                &caller.id,
                "spawn_group",
                format!("fan-out of {} exceeds max_fanout {}", fanout, policy.max_fanout),
            ));
        }
        if req.join_mode == JoinMode::Quorum {
            match req.quorum_threshold {
                Some(n) if n >= 1 && n <= fanout => {}
                _ => {
                    return Err(StrandError::InvalidState(format!(
                        "quorum threshold must be between 1 and {}",
                        fanout
                    )))
                }
            }
        }

        if let Some(prefix) = &req.idempotency_key_prefix {
            if let Some(existing) = self.store.group_by_prefix(&caller.id, prefix)? {
                let members = latest_attempts(self.store.members(&existing.id)?);
                debug!(run_id = %caller.id, group_id = %existing.id, prefix = %prefix, "Idempotent spawn_group");
                return Ok(SpawnGroupOutcome {
                    group_id: existing.id,
                    spawned_run_ids: members.into_iter().map(|m| m.run_id).collect(),
                    idempotent: true,
                });
            }
        }

        // Every target is checked before any child exists.
        let agents = req
            .targets
            .iter()
            .map(|t| self.authorize(&caller, &policy, &t.target, "spawn_group"))
            .collect::<Result<Vec<_>>>()?;
        self.check_total(&caller, &policy, fanout, "spawn_group")?;
        let keys: Vec<Option<String>> = (0..fanout)
            .map(|ordinal| {
                req.idempotency_key_prefix
                    .as_ref()
                    .map(|p| format!("{}{}", p, ordinal))
            })
            .collect();
        self.ensure_keys_free(&caller.id, keys.iter().flatten())?;

        let (group, _) = self.store.claim_group(&OrchestrationGroup {
            id: Uuid::new_v4().to_string(),
            orchestrator_run_id: caller.id.clone(),
            parent_node_id: req.parent_node_id.clone(),
            idempotency_prefix: req.idempotency_key_prefix.clone(),
            failure_policy: req.failure_policy.unwrap_or(policy.default_failure_policy),
            join_mode: req.join_mode,
            quorum_threshold: req.quorum_threshold,
            timeout_s: req
                .timeout_s
                .unwrap_or(policy.join_timeout_s)
                .min(MAX_JOIN_TIMEOUT_S),
            status: GroupStatus::Running,
            policy_snapshot: policy.clone(),
            started_at: Utc::now(),
            completed_at: None,
        })?;

        let scopes = Self::effective_scopes(&caller, &policy, req.scope_subset.as_ref());
        let mut spawned = Vec::with_capacity(agents.len());
        for (ordinal, ((target, agent), key)) in req.targets.iter().zip(agents).zip(keys).enumerate() {
            let ordinal = ordinal as u32;
            let (child_id, _) = self.create_child(
                &caller,
                ChildSpec {
                    agent,
                    input: target.input.clone(),
                    key,
                    scopes: scopes.clone(),
                    parent_node_id: req.parent_node_id.as_deref(),
                    slot: Some(Slot {
                        group_id: &group.id,
                        ordinal,
                        attempt: 0,
                        target: &target.target,
                    }),
                },
            )?;
            spawned.push(child_id);
        }
        info!(
            run_id = %caller.id,
            group_id = %group.id,
            members = spawned.len(),
            join_mode = group.join_mode.as_str(),
            "Spawned group"
        );
        Ok(SpawnGroupOutcome {
            group_id: group.id,
            spawned_run_ids: spawned,
            idempotent: false,
        })
    }

    async fn do_join(&self, req: JoinRequest) -> Result<JoinOutcome> {
        self.ensure_enabled(&req.caller_run_id, "join")?;
        let group = self.owned_group(&req.caller_run_id, &req.group_id, "join")?;
        let mode = req.mode.unwrap_or(group.join_mode);
        let threshold = req.quorum_threshold.or(group.quorum_threshold);
        if mode == JoinMode::Quorum && threshold.unwrap_or(0) == 0 {
            return Err(StrandError::InvalidState(
                "quorum join needs a positive threshold".into(),
            ));
        }

        if group.status.is_terminal() {
            let tally = self.tally(&group)?;
            return Ok(JoinOutcome {
                group_id: group.id.clone(),
                status: group.status,
                complete: true,
                success_count: tally.success,
                failure_count: tally.failure,
                running_count: tally.running,
                cancellation_propagated: None,
                members: tally.results(),
            });
        }

        let elapsed = (Utc::now() - group.started_at).to_std().unwrap_or_default();
        let budget = Duration::from_secs(group.timeout_s).saturating_sub(elapsed);
        let now = tokio::time::Instant::now();
        let deadline = now
            .checked_add(budget)
            .unwrap_or_else(|| now + UNBOUNDED_WAIT);
        let poll = self.config.join_poll_interval();
        debug!(group_id = %group.id, mode = mode.as_str(), budget_secs = budget.as_secs(), "Joining group");

        loop {
            let notified = self.service.status_changed();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let tally = self.tally(&group)?;
            if let Some((status, reason)) = decide(mode, threshold, group.failure_policy, &tally) {
                return self.settle(&group, mode, status, reason, tally).await;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!(group_id = %group.id, timeout_s = group.timeout_s, "Join timed out");
                return self
                    .settle(&group, mode, GroupStatus::TimedOut, Some("join_timeout"), tally)
                    .await;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline.min(now + poll)) => {}
            }
        }
    }

    async fn do_cancel_subtree(&self, caller: RunId, run_id: RunId) -> Result<CancelOutcome> {
        self.ensure_enabled(&caller, "cancel_subtree")?;
        let mut cursor = Some(self.service.get_run(&run_id)?);
        let mut permitted = false;
        while let Some(run) = cursor {
            if run.id == caller {
                permitted = true;
                break;
            }
            cursor = match &run.parent_run_id {
                Some(parent) => Some(self.service.get_run(parent)?),
                None => None,
            };
        }
        if !permitted {
            return Err(self.deny(
                &caller,
                "cancel_subtree",
                format!("run {} is not in the caller's subtree", run_id),
            ));
        }

        let outcome = self.cancel_tree(&run_id, "cancel_subtree").await?;
        info!(
            run_id = %caller,
            target_run_id = %run_id,
            cancelled = outcome.cancelled_run_ids.len(),
            "Cancelled subtree"
        );
        self.service.publish(
            RuntimeEvent::new(EventKind::CancellationPropagation, caller.clone(), run_id.as_str())
                .with_data(json!({
                    "reason": "cancel_subtree",
                    "run_ids": outcome.cancelled_run_ids,
                    "already_terminal": outcome.already_terminal,
                })),
        );
        Ok(outcome)
    }

    async fn do_evaluate_and_replan(
        &self,
        caller_run_id: RunId,
        group_id: String,
        max_attempts: u32,
    ) -> Result<ReplanOutcome> {
        self.ensure_enabled(&caller_run_id, "evaluate_and_replan")?;
        let group = self.owned_group(&caller_run_id, &group_id, "evaluate_and_replan")?;
        let tally = self.tally(&group)?;
        let mut outcome = ReplanOutcome {
            group_id: group.id.clone(),
            action: ReplanAction::Wait,
            respawned_run_ids: vec![],
            success_count: tally.success,
            failure_count: tally.failure,
            running_count: tally.running,
        };

        if let Some((GroupStatus::Completed, _)) =
            decide(group.join_mode, group.quorum_threshold, group.failure_policy, &tally)
        {
            outcome.action = ReplanAction::Satisfied;
            return Ok(outcome);
        }
        if tally.failure == 0 {
            return Ok(outcome);
        }

        let retryable: Vec<&(GroupMember, RunRecord)> = tally
            .entries
            .iter()
            .filter(|(member, run)| is_failure(run.status) && member.attempt + 1 < max_attempts)
            .collect();
        if retryable.is_empty() {
            info!(group_id = %group.id, failures = tally.failure, "No attempts left, aborting group");
            outcome.action = ReplanAction::Abort;
            return Ok(outcome);
        }

        let _guard = self.spawn_lock.lock().await;
        let caller = self.active_caller(&caller_run_id)?;
        let policy = self.policy_for(&caller)?;
        self.check_total(&caller, &policy, retryable.len() as u32, "evaluate_and_replan")?;
        let retry_keys: Vec<String> = retryable
            .iter()
            .filter_map(|(member, _)| {
                member
                    .spawn_key
                    .as_ref()
                    .map(|k| format!("{}:r{}", k, member.attempt + 1))
            })
            .collect();
        self.ensure_keys_free(&caller.id, &retry_keys)?;

        for (member, run) in retryable {
            let agent = self.authorize(&caller, &policy, &member.target, "evaluate_and_replan")?;
            let attempt = member.attempt + 1;
            let (child_id, _) = self.create_child(
                &caller,
                ChildSpec {
                    agent,
                    input: member.input.clone(),
                    key: member
                        .spawn_key
                        .as_ref()
                        .map(|k| format!("{}:r{}", k, attempt)),
                    scopes: run.delegated_scopes.clone(),
                    parent_node_id: group.parent_node_id.as_deref(),
                    slot: Some(Slot {
                        group_id: &group.id,
                        ordinal: member.ordinal,
                        attempt,
                        target: &member.target,
                    }),
                },
            )?;
            outcome.respawned_run_ids.push(child_id);
        }
        if group.status.is_terminal() {
            self.store.reopen_group(&group.id)?;
        }
        info!(
            group_id = %group.id,
            respawned = outcome.respawned_run_ids.len(),
            "Re-spawned failed group members"
        );
        outcome.action = ReplanAction::Retry;
        Ok(outcome)
    }
}

impl Orchestrator for OrchestrationKernel {
    fn spawn_run(&self, req: SpawnRequest) -> BoxFuture<'_, Result<SpawnOutcome>> {
        Box::pin(self.do_spawn_run(req))
    }

    fn spawn_group(&self, req: SpawnGroupRequest) -> BoxFuture<'_, Result<SpawnGroupOutcome>> {
        Box::pin(self.do_spawn_group(req))
    }

    fn join(&self, req: JoinRequest) -> BoxFuture<'_, Result<JoinOutcome>> {
        Box::pin(self.do_join(req))
    }

    fn cancel_subtree(
        &self,
        caller_run_id: RunId,
        run_id: RunId,
    ) -> BoxFuture<'_, Result<CancelOutcome>> {
        Box::pin(self.do_cancel_subtree(caller_run_id, run_id))
    }

    fn evaluate_and_replan(
        &self,
        caller_run_id: RunId,
        group_id: String,
        max_attempts: u32,
    ) -> BoxFuture<'_, Result<ReplanOutcome>> {
        Box::pin(self.do_evaluate_and_replan(caller_run_id, group_id, max_attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use strand_core::config::RuntimeConfig;
    use strand_core::orchestration::{AllowlistEntry, GroupTarget};
    use strand_core::EventBus;
    use strand_graph::{GraphCompiler, GraphDocument};
    use strand_nodes::{BuiltinOptions, NodeRegistry};
    use strand_runtime::AdapterRegistry;
    use strand_test_utils::{fixtures, ScriptedCapabilities};

    use crate::catalog::{AgentCatalog, AgentDefinition};
    use crate::db::Database;
    use crate::service::StartRun;
    use crate::store::RunStore;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        kernel: Arc<OrchestrationKernel>,
        service: Arc<ExecutionService>,
        caps: Arc<ScriptedCapabilities>,
    }

    fn harness(config: OrchestrationConfig) -> Harness {
        let caps = Arc::new(ScriptedCapabilities::new());
        caps.set_slow_tool("slow", Duration::from_secs(30));
        caps.set_failing_tool("explode", "kaboom");

        let db = Arc::new(Database::in_memory().unwrap());
        let nodes = Arc::new(NodeRegistry::with_builtins(BuiltinOptions::default()));
        let service = Arc::new(
            ExecutionService::new(
                RunStore::new(db.clone()),
                Arc::new(AgentCatalog::new()),
                GraphCompiler::new(nodes.clone()),
                Arc::new(AdapterRegistry::with_local(nodes)),
                Arc::new(EventBus::default()),
                RuntimeConfig::default(),
            )
            .with_capabilities(caps.clone()),
        );
        let kernel = Arc::new(OrchestrationKernel::new(
            service.clone(),
            OrchestrationStore::new(db),
            config,
        ));

        let h = Harness { kernel, service, caps };
        h.deploy(AgentDefinition::new("t1", "orch"), fixtures::approval_gate());
        h.deploy(AgentDefinition::new("t1", "worker"), fixtures::passthrough());
        h.deploy(AgentDefinition::new("t1", "slow"), fixtures::single_tool("slow"));
        h.deploy(AgentDefinition::new("t1", "failing"), fixtures::single_tool("explode"));
        for target in ["worker", "slow", "failing"] {
            h.allow(target);
        }
        h
    }

    impl Harness {
        fn deploy(&self, def: AgentDefinition, doc: Value) {
            let doc = GraphDocument::from_value(doc).unwrap();
            self.service.deploy_agent(def, &doc).unwrap();
        }

        fn allow(&self, target: &str) {
            self.kernel
                .store()
                .add_allowlist_entry(&AllowlistEntry::for_agent("t1", "orch", target))
                .unwrap();
        }

        fn set_policy(&self, policy: OrchestratorPolicy) {
            self.kernel.store().set_policy("t1", "orch", &policy).unwrap();
        }

        /// A paused orchestrator run to spawn from.
        async fn caller_with_scopes(&self, scopes: Vec<String>) -> RunId {
            let mut req = StartRun::new("t1", "orch", "u1", json!("plan"));
            req.scopes = scopes;
            let run = self.service.start_run(req).unwrap();
            let paused = self.service.wait(&run.id, WAIT).await.unwrap();
            assert_eq!(paused.status, RunStatus::Paused);
            run.id
        }

        async fn caller(&self) -> RunId {
            self.caller_with_scopes(vec![]).await
        }

        async fn join(&self, caller: &RunId, group_id: &str) -> JoinOutcome {
            let req = JoinRequest {
                caller_run_id: caller.clone(),
                group_id: group_id.to_string(),
                mode: None,
                quorum_threshold: None,
            };
            tokio::time::timeout(WAIT, self.kernel.join(req))
                .await
                .expect("join did not settle")
                .unwrap()
        }
    }

    fn agent(id: &str) -> TargetRef {
        TargetRef::AgentId(id.into())
    }

    fn targets(ids: &[&str]) -> Vec<GroupTarget> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| GroupTarget {
                target: agent(id),
                input: json!(format!("item-{}", i)),
            })
            .collect()
    }

    fn events_of(rx: &mut tokio::sync::broadcast::Receiver<RuntimeEvent>, kind: EventKind) -> Vec<RuntimeEvent> {
        let mut found = vec![];
        while let Ok(ev) = rx.try_recv() {
            if ev.event == kind {
                found.push(ev);
            }
        }
        found
    }

    #[tokio::test]
    async fn spawn_with_same_key_is_idempotent() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;
        let req = SpawnRequest::new(caller.clone(), agent("worker"), json!("x")).with_key("step-1");

        let first = h.kernel.spawn_run(req.clone()).await.unwrap();
        assert!(!first.idempotent);
        let second = h.kernel.spawn_run(req).await.unwrap();
        assert!(second.idempotent);
        assert_eq!(first.spawned_run_ids, second.spawned_run_ids);
        assert_eq!(h.service.count_children(&caller).unwrap(), 1);

        let child = h.service.get_run(&first.spawned_run_ids[0]).unwrap();
        assert_eq!(child.parent_run_id.as_ref(), Some(&caller));
        assert_eq!(child.root_run_id, caller);
        assert_eq!(child.depth, 1);
        assert_eq!(child.spawn_key.as_deref(), Some("step-1"));
    }

    #[tokio::test]
    async fn concurrent_duplicate_spawns_create_one_child() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;
        let req = SpawnRequest::new(caller.clone(), agent("worker"), json!("x")).with_key("dup");

        let (a, b) = tokio::join!(h.kernel.spawn_run(req.clone()), h.kernel.spawn_run(req));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.spawned_run_ids, b.spawned_run_ids);
        assert!(a.idempotent != b.idempotent);
        assert_eq!(h.service.count_children(&caller).unwrap(), 1);
    }

    #[tokio::test]
    async fn unlisted_or_unpublished_targets_are_denied_without_records() {
        let h = harness(OrchestrationConfig::default());
        h.deploy(AgentDefinition::new("t1", "rogue"), fixtures::passthrough());
        h.deploy(AgentDefinition::new("t1", "draft").unpublished(), fixtures::passthrough());
        h.allow("draft");
        let caller = h.caller().await;
        let mut rx = h.service.subscribe();

        for target in ["rogue", "draft"] {
            let err = h
                .kernel
                .spawn_run(SpawnRequest::new(caller.clone(), agent(target), json!(1)))
                .await
                .unwrap_err();
            assert!(err.is_permission(), "{target}: {err}");
        }
        assert_eq!(h.service.count_children(&caller).unwrap(), 0);

        let denials = events_of(&mut rx, EventKind::PolicyDeny);
        assert_eq!(denials.len(), 2);
        assert!(denials.iter().all(|e| e.run_id == caller));
        assert_eq!(denials[0].data["operation"], "spawn_run");
    }

    #[tokio::test]
    async fn missing_target_is_a_resolution_error() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;
        let err = h
            .kernel
            .spawn_run(SpawnRequest::new(caller, TargetRef::Slug("nope".into()), json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::Resolution(_)));
    }

    #[tokio::test]
    async fn policy_limits_are_enforced() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;

        h.set_policy(OrchestratorPolicy { max_fanout: 2, ..Default::default() });
        let err = h
            .kernel
            .spawn_group(SpawnGroupRequest::new(caller.clone(), targets(&["worker", "worker", "worker"])))
            .await
            .unwrap_err();
        assert!(err.is_permission());
        assert_eq!(h.service.count_children(&caller).unwrap(), 0);

        h.set_policy(OrchestratorPolicy { max_children_total: 1, ..Default::default() });
        h.kernel
            .spawn_run(SpawnRequest::new(caller.clone(), agent("worker"), json!(1)))
            .await
            .unwrap();
        let err = h
            .kernel
            .spawn_run(SpawnRequest::new(caller.clone(), agent("worker"), json!(2)))
            .await
            .unwrap_err();
        assert!(err.is_permission());

        h.set_policy(OrchestratorPolicy { max_depth: 0, ..Default::default() });
        let err = h
            .kernel
            .spawn_run(SpawnRequest::new(caller.clone(), agent("worker"), json!(3)))
            .await
            .unwrap_err();
        assert!(err.is_permission());
        assert_eq!(h.service.count_children(&caller).unwrap(), 1);
    }

    #[tokio::test]
    async fn scopes_only_ever_narrow() {
        let h = harness(OrchestrationConfig::default());
        h.set_policy(OrchestratorPolicy {
            allowed_scope_subset: Some(vec!["read".into(), "write".into()]),
            ..Default::default()
        });
        let caller = h
            .caller_with_scopes(vec!["read".into(), "write".into(), "admin".into()])
            .await;

        let outcome = h
            .kernel
            .spawn_run(
                SpawnRequest::new(caller, agent("worker"), json!(1))
                    .with_scopes(vec!["write".into(), "admin".into(), "root".into()]),
            )
            .await
            .unwrap();
        assert_eq!(outcome.effective_scopes, vec!["write".to_string()]);
        let child = h.service.get_run(&outcome.spawned_run_ids[0]).unwrap();
        assert_eq!(child.delegated_scopes, vec!["write".to_string()]);
    }

    #[tokio::test]
    async fn join_all_collects_member_outputs() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;
        let mut req = SpawnGroupRequest::new(caller.clone(), targets(&["worker", "worker"]));
        req.idempotency_key_prefix = Some("fan:".into());
        let group = h.kernel.spawn_group(req.clone()).await.unwrap();
        assert_eq!(group.spawned_run_ids.len(), 2);

        let again = h.kernel.spawn_group(req).await.unwrap();
        assert!(again.idempotent);
        assert_eq!(again.group_id, group.group_id);
        assert_eq!(again.spawned_run_ids, group.spawned_run_ids);

        let outcome = h.join(&caller, &group.group_id).await;
        assert_eq!(outcome.status, GroupStatus::Completed);
        assert!(outcome.complete);
        assert_eq!(outcome.success_count, 2);
        assert!(outcome.cancellation_propagated.is_none());
        let outputs: Vec<_> = outcome.members.iter().map(|m| m.output.clone()).collect();
        assert_eq!(outputs, vec![Some(json!("item-0")), Some(json!("item-1"))]);

        // A settled group answers immediately with the same verdict.
        let replay = h.join(&caller, &group.group_id).await;
        assert_eq!(replay.status, GroupStatus::Completed);
    }

    #[tokio::test]
    async fn fail_fast_cancels_the_rest() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;
        let mut rx = h.service.subscribe();
        let mut req = SpawnGroupRequest::new(caller.clone(), targets(&["failing", "slow", "slow"]));
        req.join_mode = JoinMode::FailFast;
        let group = h.kernel.spawn_group(req).await.unwrap();

        let outcome = h.join(&caller, &group.group_id).await;
        assert_eq!(outcome.status, GroupStatus::Failed);
        let propagated = outcome.cancellation_propagated.unwrap();
        assert_eq!(propagated.reason, "fail_fast");
        assert_eq!(propagated.count, 2);
        assert_eq!(propagated.run_ids, group.spawned_run_ids[1..].to_vec());
        for id in &group.spawned_run_ids[1..] {
            assert_eq!(h.service.get_run(id).unwrap().status, RunStatus::Cancelled);
        }
        assert_eq!(outcome.failure_count, 3);
        assert_eq!(outcome.running_count, 0);

        let mut decisions = 0;
        let mut propagations = 0;
        while let Ok(ev) = rx.try_recv() {
            match ev.event {
                EventKind::JoinDecision => decisions += 1,
                EventKind::CancellationPropagation => propagations += 1,
                _ => {}
            }
        }
        assert_eq!((decisions, propagations), (1, 1));

        // Joining a settled group emits nothing new.
        let mut rx = h.service.subscribe();
        h.join(&caller, &group.group_id).await;
        assert!(events_of(&mut rx, EventKind::JoinDecision).is_empty());
    }

    #[tokio::test]
    async fn unreachable_quorum_fails_early() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;
        let mut req = SpawnGroupRequest::new(caller.clone(), targets(&["failing", "failing", "slow"]));
        req.join_mode = JoinMode::Quorum;
        req.quorum_threshold = Some(2);
        let group = h.kernel.spawn_group(req).await.unwrap();

        let outcome = h.join(&caller, &group.group_id).await;
        assert_eq!(outcome.status, GroupStatus::Failed);
        let propagated = outcome.cancellation_propagated.unwrap();
        assert_eq!(propagated.reason, "quorum_unreachable");
        assert_eq!(propagated.run_ids, vec![group.spawned_run_ids[2].clone()]);
    }

    #[tokio::test]
    async fn quorum_threshold_is_validated() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;
        let mut req = SpawnGroupRequest::new(caller.clone(), targets(&["worker", "worker"]));
        req.join_mode = JoinMode::Quorum;
        req.quorum_threshold = Some(3);
        let err = h.kernel.spawn_group(req).await.unwrap_err();
        assert!(matches!(err, StrandError::InvalidState(_)));
        assert_eq!(h.service.count_children(&caller).unwrap(), 0);
    }

    #[tokio::test]
    async fn join_times_out_and_cancels_stragglers() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;
        let mut req = SpawnGroupRequest::new(caller.clone(), targets(&["worker", "slow"]));
        req.timeout_s = Some(0);
        let group = h.kernel.spawn_group(req).await.unwrap();

        let outcome = h.join(&caller, &group.group_id).await;
        assert_eq!(outcome.status, GroupStatus::TimedOut);
        assert!(outcome.complete);
        let propagated = outcome.cancellation_propagated.unwrap();
        assert_eq!(propagated.reason, "join_timeout");
        assert!(propagated.run_ids.contains(&group.spawned_run_ids[1]));
    }

    #[tokio::test]
    async fn only_the_owner_joins_a_group() {
        let h = harness(OrchestrationConfig::default());
        let owner = h.caller().await;
        let other = h.caller().await;
        let group = h
            .kernel
            .spawn_group(SpawnGroupRequest::new(owner, targets(&["worker"])))
            .await
            .unwrap();
        let err = h
            .kernel
            .join(JoinRequest {
                caller_run_id: other,
                group_id: group.group_id,
                mode: None,
                quorum_threshold: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_permission());
    }

    #[tokio::test]
    async fn cancel_subtree_is_limited_to_descendants() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;
        let stranger = h.caller().await;
        let spawned = h
            .kernel
            .spawn_run(SpawnRequest::new(caller.clone(), agent("slow"), json!(1)))
            .await
            .unwrap();
        let child = spawned.spawned_run_ids[0].clone();

        let err = h.kernel.cancel_subtree(stranger, child.clone()).await.unwrap_err();
        assert!(err.is_permission());
        let err = h.kernel.cancel_subtree(child.clone(), caller.clone()).await.unwrap_err();
        assert!(err.is_permission());

        let outcome = h.kernel.cancel_subtree(caller.clone(), child.clone()).await.unwrap();
        assert_eq!(outcome.cancelled_run_ids, vec![child.clone()]);
        let done = h.service.wait(&child, WAIT).await.unwrap();
        assert_eq!(done.status, RunStatus::Cancelled);
        assert_eq!(done.error_message.as_deref(), Some("cancel_subtree"));
        assert_eq!(h.service.get_run(&caller).unwrap().status, RunStatus::Paused);

        let again = h.kernel.cancel_subtree(caller, child.clone()).await.unwrap();
        assert_eq!(again.already_terminal, vec![child]);
    }

    #[tokio::test]
    async fn query_tree_shows_group_membership() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;
        let group = h
            .kernel
            .spawn_group(SpawnGroupRequest::new(caller.clone(), targets(&["worker", "worker"])))
            .await
            .unwrap();
        h.join(&caller, &group.group_id).await;

        let tree = h.kernel.query_tree(&group.spawned_run_ids[1]).unwrap();
        assert_eq!(tree.root_run_id, caller);
        assert_eq!(tree.node_count, 3);
        assert_eq!(tree.groups.len(), 1);
        let member = tree.find(&group.spawned_run_ids[1]).unwrap();
        let membership = member.membership.as_ref().unwrap();
        assert_eq!(membership.group_id, group.group_id);
        assert_eq!(membership.ordinal, 1);
        assert_eq!(membership.group_status, GroupStatus::Completed);
        assert!(tree.tree.membership.is_none());
    }

    #[tokio::test]
    async fn disabled_kernel_fails_closed() {
        let h = harness(OrchestrationConfig {
            kernel_enabled: false,
            ..Default::default()
        });
        let caller = h.caller().await;
        let err = h
            .kernel
            .spawn_run(SpawnRequest::new(caller.clone(), agent("worker"), json!(1)))
            .await
            .unwrap_err();
        assert!(err.is_permission());
        assert_eq!(h.service.count_children(&caller).unwrap(), 0);
        // Diagnostics stay available.
        assert_eq!(h.kernel.query_tree(&caller).unwrap().node_count, 1);
    }

    #[tokio::test]
    async fn replan_retries_failed_members_until_attempts_run_out() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;
        let mut req = SpawnGroupRequest::new(caller.clone(), targets(&["failing", "worker"]));
        req.idempotency_key_prefix = Some("g:".into());
        let group = h.kernel.spawn_group(req).await.unwrap();
        let first = h.join(&caller, &group.group_id).await;
        assert_eq!(first.status, GroupStatus::Failed);

        h.caps.set_tool("explode", json!("fixed"));
        let replan = h
            .kernel
            .evaluate_and_replan(caller.clone(), group.group_id.clone(), 2)
            .await
            .unwrap();
        assert_eq!(replan.action, ReplanAction::Retry);
        assert_eq!(replan.respawned_run_ids.len(), 1);
        let retry = h.service.get_run(&replan.respawned_run_ids[0]).unwrap();
        assert_eq!(retry.spawn_key.as_deref(), Some("g:0:r1"));
        assert_eq!(retry.input_params, json!("item-0"));

        let second = h.join(&caller, &group.group_id).await;
        assert_eq!(second.status, GroupStatus::Completed);
        assert_eq!(second.members[0].run_id, replan.respawned_run_ids[0]);

        let settled = h
            .kernel
            .evaluate_and_replan(caller.clone(), group.group_id.clone(), 2)
            .await
            .unwrap();
        assert_eq!(settled.action, ReplanAction::Satisfied);
    }

    #[tokio::test]
    async fn replan_aborts_without_attempts_left() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;
        let group = h
            .kernel
            .spawn_group(SpawnGroupRequest::new(caller.clone(), targets(&["failing"])))
            .await
            .unwrap();
        h.join(&caller, &group.group_id).await;

        let outcome = h
            .kernel
            .evaluate_and_replan(caller, group.group_id, 1)
            .await
            .unwrap();
        assert_eq!(outcome.action, ReplanAction::Abort);
        assert!(outcome.respawned_run_ids.is_empty());
    }

    #[tokio::test]
    async fn any_join_settles_on_first_success() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;
        let mut req = SpawnGroupRequest::new(caller.clone(), targets(&["slow", "worker"]));
        req.join_mode = JoinMode::Any;
        let group = h.kernel.spawn_group(req).await.unwrap();

        let outcome = h.join(&caller, &group.group_id).await;
        assert_eq!(outcome.status, GroupStatus::Completed);
        assert_eq!(outcome.success_count, 1);
        assert_eq!(outcome.running_count, 1);
        assert!(outcome.cancellation_propagated.is_none());
        // The slow member is left alone.
        let slow = h.service.get_run(&group.spawned_run_ids[0]).unwrap();
        assert!(!slow.status.is_terminal(), "{:?}", slow.status);
    }

    #[tokio::test]
    async fn best_effort_all_join_tolerates_failures() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;
        let mut req = SpawnGroupRequest::new(caller.clone(), targets(&["failing", "worker"]));
        req.failure_policy = Some(FailurePolicy::BestEffort);
        let group = h.kernel.spawn_group(req).await.unwrap();

        let outcome = h.join(&caller, &group.group_id).await;
        assert_eq!(outcome.status, GroupStatus::Completed);
        assert_eq!((outcome.success_count, outcome.failure_count), (1, 1));
        assert_eq!(outcome.members[0].status, RunStatus::Failed);
        assert_eq!(outcome.members[1].output, Some(json!("item-1")));
    }

    /// A fail-fast group whose only member already failed, plus a member
    /// attached afterwards that is still queued when the join runs.
    async fn fail_fast_with_queued_member(
        policy: PendingMemberPolicy,
    ) -> (Harness, RunId, JoinOutcome) {
        let h = harness(OrchestrationConfig {
            pending_member_policy: policy,
            ..Default::default()
        });
        let caller = h.caller().await;
        let mut req = SpawnGroupRequest::new(caller.clone(), targets(&["failing"]));
        req.join_mode = JoinMode::FailFast;
        let group = h.kernel.spawn_group(req).await.unwrap();
        let failed = h.service.wait(&group.spawned_run_ids[0], WAIT).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);

        // No await point yields between this spawn and the join below, so
        // the child's task has not started yet.
        let mut late = SpawnRequest::new(caller.clone(), agent("worker"), json!("late"));
        late.group_id = Some(group.group_id.clone());
        let queued = h.kernel.spawn_run(late).await.unwrap().spawned_run_ids[0].clone();
        assert_eq!(h.service.get_run(&queued).unwrap().status, RunStatus::Queued);

        let outcome = h.join(&caller, &group.group_id).await;
        (h, queued, outcome)
    }

    #[tokio::test]
    async fn queued_members_are_cancelled_before_they_start() {
        let (h, queued, outcome) = fail_fast_with_queued_member(PendingMemberPolicy::Cancel).await;
        assert_eq!(outcome.status, GroupStatus::Failed);
        let propagated = outcome.cancellation_propagated.unwrap();
        assert_eq!(propagated.reason, "fail_fast");
        assert_eq!(propagated.run_ids, vec![queued.clone()]);

        let run = h.service.get_run(&queued).unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.started_at.is_none());
    }

    #[tokio::test]
    async fn detached_queued_members_keep_running() {
        let (h, queued, outcome) = fail_fast_with_queued_member(PendingMemberPolicy::Detach).await;
        assert_eq!(outcome.status, GroupStatus::Failed);
        let propagated = outcome.cancellation_propagated.unwrap();
        assert!(propagated.run_ids.is_empty());
        assert_eq!(propagated.count, 0);
        assert_eq!(outcome.running_count, 1);

        let done = h.service.wait(&queued, WAIT).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.output_result, Some(json!("late")));
    }

    #[tokio::test]
    async fn huge_join_timeouts_wait_instead_of_overflowing() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;
        let mut req = SpawnGroupRequest::new(caller.clone(), targets(&["worker"]));
        req.timeout_s = Some(u64::MAX);
        let group = h.kernel.spawn_group(req).await.unwrap();
        let stored = h.kernel.store().group(&group.group_id).unwrap().unwrap();
        assert_eq!(stored.timeout_s, i64::MAX as u64);

        let outcome = h.join(&caller, &group.group_id).await;
        assert_eq!(outcome.status, GroupStatus::Completed);
    }

    #[tokio::test]
    async fn group_keys_may_not_reuse_bound_spawn_keys() {
        let h = harness(OrchestrationConfig::default());
        let caller = h.caller().await;
        h.kernel
            .spawn_run(SpawnRequest::new(caller.clone(), agent("worker"), json!(1)).with_key("fan:1"))
            .await
            .unwrap();

        let mut req = SpawnGroupRequest::new(caller.clone(), targets(&["worker", "worker"]));
        req.idempotency_key_prefix = Some("fan:".into());
        let err = h.kernel.spawn_group(req).await.unwrap_err();
        assert!(matches!(err, StrandError::InvalidState(_)), "{err}");
        assert!(err.to_string().contains("fan:1"));
        // Nothing was created for the rejected group.
        assert_eq!(h.service.count_children(&caller).unwrap(), 1);
        assert!(h.kernel.store().group_by_prefix(&caller, "fan:").unwrap().is_none());
    }
}
