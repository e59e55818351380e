use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use strand_core::error::{Result, StrandError};
use strand_core::orchestration::TargetRef;
use strand_graph::GraphIr;
use strand_runtime::Executable;

/// A tenant-scoped agent: identity, discovery metadata and routing hints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub tenant_id: String,
    pub slug: String,
    /// Bumped on every deploy of the same id.
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub published: bool,
    /// Tags an orchestrator allow-list can match on.
    #[serde(default)]
    pub capability_tags: Vec<String>,
    /// Runtime backend override; the configured default otherwise.
    #[serde(default)]
    pub backend: Option<String>,
}

impl AgentDefinition {
    pub fn new(tenant_id: impl Into<String>, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            slug: id.clone(),
            id,
            tenant_id: tenant_id.into(),
            version: 0,
            published: true,
            capability_tags: vec![],
            backend: None,
        }
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = slug.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.capability_tags = tags;
        self
    }

    pub fn unpublished(mut self) -> Self {
        self.published = false;
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }
}

/// A definition together with the graph compiled for it.
pub struct DeployedAgent {
    pub definition: AgentDefinition,
    pub ir: Arc<GraphIr>,
    pub executable: Executable,
    /// Adapter the executable was compiled by.
    pub backend: String,
}

/// Deployed agents, one compiled version per id.
#[derive(Default)]
pub struct AgentCatalog {
    agents: RwLock<HashMap<String, Arc<DeployedAgent>>>,
}

impl AgentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compiled agent, replacing the previous version.
    pub fn register(&self, mut agent: DeployedAgent) -> Arc<DeployedAgent> {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        let previous = agents.get(&agent.definition.id).map(|a| a.definition.version);
        agent.definition.version = previous.map_or(1, |v| v + 1);
        info!(
            agent_id = %agent.definition.id,
            tenant_id = %agent.definition.tenant_id,
            version = agent.definition.version,
            backend = %agent.backend,
            "Deployed agent"
        );
        let agent = Arc::new(agent);
        agents.insert(agent.definition.id.clone(), agent.clone());
        agent
    }

    /// Lookup by id, ignoring tenants. Internal use only.
    pub fn get_any(&self, agent_id: &str) -> Option<Arc<DeployedAgent>> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
    }

    pub fn get(&self, tenant_id: &str, agent_id: &str) -> Option<Arc<DeployedAgent>> {
        self.get_any(agent_id)
            .filter(|a| a.definition.tenant_id == tenant_id)
    }

    pub fn by_slug(&self, tenant_id: &str, slug: &str) -> Option<Arc<DeployedAgent>> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|a| a.definition.tenant_id == tenant_id && a.definition.slug == slug)
            .cloned()
    }

    /// Resolve a spawn target inside `tenant_id`. Agents of other tenants
    /// are reported exactly like missing ones.
    pub fn resolve(&self, tenant_id: &str, target: &TargetRef) -> Result<Arc<DeployedAgent>> {
        let found = match target {
            TargetRef::AgentId(id) => self.get(tenant_id, id),
            TargetRef::Slug(slug) => self.by_slug(tenant_id, slug),
        };
        found.ok_or_else(|| {
            StrandError::Resolution(format!("agent {} not found in tenant '{}'", target, tenant_id))
        })
    }

    pub fn list(&self, tenant_id: &str) -> Vec<AgentDefinition> {
        let mut defs: Vec<AgentDefinition> = self
            .agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|a| a.definition.tenant_id == tenant_id)
            .map(|a| a.definition.clone())
            .collect();
        defs.sort_by(|a, b| a.slug.cmp(&b.slug));
        defs
    }
}
