use std::sync::{Arc, Weak};

use tracing::info;

use strand_core::error::{Result, StrandError};
use strand_core::traits::{CapabilityClient, Orchestrator, TokenBroker};
use strand_core::{AppConfig, EventBus};
use strand_graph::{CompilerOptions, GraphCompiler};
use strand_nodes::{BuiltinOptions, NodeRegistry};
use strand_runtime::AdapterRegistry;

use crate::catalog::AgentCatalog;
use crate::db::Database;
use crate::kernel::OrchestrationKernel;
use crate::lineage::LineageService;
use crate::service::ExecutionService;
use crate::store::{OrchestrationStore, RunStore};

/// Everything a host needs, wired from one `AppConfig`.
pub struct Platform {
    pub config: AppConfig,
    pub service: Arc<ExecutionService>,
    pub kernel: Arc<OrchestrationKernel>,
    pub bus: Arc<EventBus>,
    pub nodes: Arc<NodeRegistry>,
}

impl Platform {
    pub fn builder(config: AppConfig) -> PlatformBuilder {
        PlatformBuilder {
            config,
            capabilities: None,
            broker: None,
            in_memory: false,
        }
    }

    pub fn catalog(&self) -> &Arc<AgentCatalog> {
        self.service.catalog()
    }

    /// Policy and allow-list administration.
    pub fn orchestration_store(&self) -> &OrchestrationStore {
        self.kernel.store()
    }

    pub fn lineage(&self) -> LineageService {
        LineageService::new(self.service.clone(), self.kernel.store().clone())
    }
}

pub struct PlatformBuilder {
    config: AppConfig,
    capabilities: Option<Arc<dyn CapabilityClient>>,
    broker: Option<Arc<dyn TokenBroker>>,
    in_memory: bool,
}

impl PlatformBuilder {
    pub fn with_capabilities(mut self, capabilities: Arc<dyn CapabilityClient>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn with_token_broker(mut self, broker: Arc<dyn TokenBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Ignore the configured database path and keep everything in memory.
    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    pub fn build(self) -> Result<Platform> {
        let config = self.config;
        let primitives = config.orchestration.graph_primitives_enabled;

        let nodes = Arc::new(NodeRegistry::with_builtins(BuiltinOptions {
            orchestration_enabled: primitives,
        }));
        let compiler = GraphCompiler::new(nodes.clone()).with_options(CompilerOptions {
            orchestration_enabled: primitives,
        });
        let mut adapters = AdapterRegistry::with_local(nodes.clone());
        adapters
            .set_default(&config.runtime.backend)
            .map_err(|e| StrandError::Config(e.to_string()))?;

        let db = if self.in_memory || config.storage.in_memory {
            Database::in_memory()?
        } else {
            let path = config.storage.database_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Database::open(&path)?
        };
        let db = Arc::new(db);

        let bus = Arc::new(EventBus::new(config.runtime.event_capacity));
        let mut service = ExecutionService::new(
            RunStore::new(db.clone()),
            Arc::new(AgentCatalog::new()),
            compiler,
            Arc::new(adapters),
            bus.clone(),
            config.runtime.clone(),
        );
        if let Some(capabilities) = self.capabilities {
            service = service.with_capabilities(capabilities);
        }
        if let Some(broker) = self.broker {
            service = service.with_token_broker(broker);
        }
        let service = Arc::new(service);

        let kernel = Arc::new(OrchestrationKernel::new(
            service.clone(),
            OrchestrationStore::new(db),
            config.orchestration.clone(),
        ));
        let weak: Weak<dyn Orchestrator> = Arc::downgrade(&kernel) as Weak<dyn Orchestrator>;
        service.attach_orchestrator(weak);

        info!(
            backend = %config.runtime.backend,
            graph_primitives = primitives,
            kernel = config.orchestration.kernel_enabled,
            "Platform ready"
        );
        Ok(Platform {
            config,
            service,
            kernel,
            bus,
            nodes,
        })
    }
}
