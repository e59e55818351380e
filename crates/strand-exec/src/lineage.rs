use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use strand_core::error::{Result, StrandError};
use strand_core::orchestration::{GroupStatus, JoinMode, OrchestrationGroup};
use strand_core::{RunId, RunRecord, RunStatus};

use crate::service::ExecutionService;
use crate::store::OrchestrationStore;

/// A run's place in an orchestration group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub group_id: String,
    pub ordinal: u32,
    pub attempt: u32,
    pub join_mode: JoinMode,
    pub group_status: GroupStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub run_id: RunId,
    pub agent_id: String,
    pub status: RunStatus,
    pub depth: u32,
    pub parent_run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership: Option<Membership>,
    pub children: Vec<TreeNode>,
}

/// The whole tree a run belongs to, from its root down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTree {
    pub root_run_id: RunId,
    pub node_count: usize,
    pub tree: TreeNode,
    pub groups: Vec<OrchestrationGroup>,
}

impl RunTree {
    /// Depth-first search for one run.
    pub fn find(&self, run_id: &RunId) -> Option<&TreeNode> {
        fn walk<'a>(node: &'a TreeNode, run_id: &RunId) -> Option<&'a TreeNode> {
            if &node.run_id == run_id {
                return Some(node);
            }
            node.children.iter().find_map(|c| walk(c, run_id))
        }
        walk(&self.tree, run_id)
    }
}

/// Read-only reconstruction of run trees.
pub struct LineageService {
    service: Arc<ExecutionService>,
    store: OrchestrationStore,
}

impl LineageService {
    pub fn new(service: Arc<ExecutionService>, store: OrchestrationStore) -> Self {
        Self { service, store }
    }

    /// Rebuild the tree rooted at `run_id`'s root, with group memberships.
    pub fn query_tree(&self, run_id: &RunId) -> Result<RunTree> {
        let run = self.service.get_run(run_id)?;
        let root_id = run.root_run_id.clone();
        let runs = self.service.tree_runs(&root_id)?;

        let groups = self.store.groups_in_tree(&root_id)?;
        let mut memberships = HashMap::new();
        for group in &groups {
            for member in self.store.members(&group.id)? {
                memberships.insert(
                    member.run_id.clone(),
                    Membership {
                        group_id: group.id.clone(),
                        ordinal: member.ordinal,
                        attempt: member.attempt,
                        join_mode: group.join_mode,
                        group_status: group.status,
                    },
                );
            }
        }

        let mut by_parent: HashMap<RunId, Vec<RunRecord>> = HashMap::new();
        let mut root = None;
        for record in runs {
            match record.parent_run_id.clone() {
                Some(parent) => by_parent.entry(parent).or_default().push(record),
                None if record.id == root_id => root = Some(record),
                None => {}
            }
        }
        let root = root.ok_or_else(|| StrandError::RunNotFound(root_id.to_string()))?;

        let mut node_count = 0;
        let tree = build(root, &mut by_parent, &mut memberships, &mut node_count);
        Ok(RunTree {
            root_run_id: root_id,
            node_count,
            tree,
            groups,
        })
    }
}

fn build(
    record: RunRecord,
    by_parent: &mut HashMap<RunId, Vec<RunRecord>>,
    memberships: &mut HashMap<RunId, Membership>,
    count: &mut usize,
) -> TreeNode {
    *count += 1;
    let children = by_parent
        .remove(&record.id)
        .unwrap_or_default()
        .into_iter()
        .map(|child| build(child, by_parent, memberships, count))
        .collect();
    TreeNode {
        membership: memberships.remove(&record.id),
        run_id: record.id,
        agent_id: record.agent_id,
        status: record.status,
        depth: record.depth,
        parent_run_id: record.parent_run_id,
        children,
    }
}
