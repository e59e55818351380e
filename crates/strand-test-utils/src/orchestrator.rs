use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use strand_core::error::{Result, StrandError};
use strand_core::orchestration::*;
use strand_core::traits::Orchestrator;
use strand_core::{RunId, RunStatus};

/// An `Orchestrator` that records requests and reports every group as
/// completed. `denying` makes every call fail with a permission error.
pub struct StubOrchestrator {
    deny: Option<String>,
    spawns: Mutex<Vec<SpawnRequest>>,
    group_spawns: Mutex<Vec<SpawnGroupRequest>>,
    groups: Mutex<HashMap<String, Vec<RunId>>>,
}

impl StubOrchestrator {
    pub fn new() -> Self {
        Self {
            deny: None,
            spawns: Mutex::new(Vec::new()),
            group_spawns: Mutex::new(Vec::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn denying(reason: impl Into<String>) -> Self {
        Self {
            deny: Some(reason.into()),
            ..Self::new()
        }
    }

    pub fn spawn_requests(&self) -> Vec<SpawnRequest> {
        self.spawns.lock().unwrap().clone()
    }

    pub fn group_requests(&self) -> Vec<SpawnGroupRequest> {
        self.group_spawns.lock().unwrap().clone()
    }

    fn check(&self) -> Result<()> {
        match &self.deny {
            Some(reason) => Err(StrandError::Permission(reason.clone())),
            None => Ok(()),
        }
    }
}

impl Default for StubOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator for StubOrchestrator {
    fn spawn_run(&self, req: SpawnRequest) -> BoxFuture<'_, Result<SpawnOutcome>> {
        Box::pin(async move {
            self.check()?;
            let group_id = req.group_id.clone();
            self.spawns.lock().unwrap().push(req);
            Ok(SpawnOutcome {
                spawned_run_ids: vec![RunId::new()],
                idempotent: false,
                group_id,
                effective_scopes: vec![],
            })
        })
    }

    fn spawn_group(&self, req: SpawnGroupRequest) -> BoxFuture<'_, Result<SpawnGroupOutcome>> {
        Box::pin(async move {
            self.check()?;
            let group_id = uuid::Uuid::new_v4().to_string();
            let ids: Vec<RunId> = req.targets.iter().map(|_| RunId::new()).collect();
            self.groups
                .lock()
                .unwrap()
                .insert(group_id.clone(), ids.clone());
            self.group_spawns.lock().unwrap().push(req);
            Ok(SpawnGroupOutcome {
                group_id,
                spawned_run_ids: ids,
                idempotent: false,
            })
        })
    }

    fn join(&self, req: JoinRequest) -> BoxFuture<'_, Result<JoinOutcome>> {
        Box::pin(async move {
            self.check()?;
            let ids = self
                .groups
                .lock()
                .unwrap()
                .get(&req.group_id)
                .cloned()
                .ok_or_else(|| StrandError::Resolution(format!("group {} not found", req.group_id)))?;
            let members: Vec<MemberResult> = ids
                .into_iter()
                .enumerate()
                .map(|(i, run_id)| MemberResult {
                    run_id,
                    ordinal: i as u32,
                    status: RunStatus::Completed,
                    output: None,
                    error: None,
                })
                .collect();
            Ok(JoinOutcome {
                group_id: req.group_id,
                status: GroupStatus::Completed,
                complete: true,
                success_count: members.len() as u32,
                failure_count: 0,
                running_count: 0,
                cancellation_propagated: None,
                members,
            })
        })
    }

    fn cancel_subtree(
        &self,
        _caller_run_id: RunId,
        run_id: RunId,
    ) -> BoxFuture<'_, Result<CancelOutcome>> {
        Box::pin(async move {
            self.check()?;
            Ok(CancelOutcome {
                cancelled_run_ids: vec![run_id],
                already_terminal: vec![],
            })
        })
    }

    fn evaluate_and_replan(
        &self,
        _caller_run_id: RunId,
        group_id: String,
        _max_attempts: u32,
    ) -> BoxFuture<'_, Result<ReplanOutcome>> {
        Box::pin(async move {
            self.check()?;
            Ok(ReplanOutcome {
                group_id,
                action: ReplanAction::Satisfied,
                respawned_run_ids: vec![],
                success_count: 0,
                failure_count: 0,
                running_count: 0,
            })
        })
    }
}
