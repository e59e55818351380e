//! Run lifecycle, persistence and orchestration for Strand agents.

pub mod catalog;
pub mod db;
pub mod kernel;
pub mod lineage;
pub mod platform;
pub mod service;
pub mod store;
pub mod trace;

pub use catalog::{AgentCatalog, AgentDefinition, DeployedAgent};
pub use db::Database;
pub use kernel::OrchestrationKernel;
pub use lineage::{LineageService, Membership, RunTree, TreeNode};
pub use platform::{Platform, PlatformBuilder};
pub use service::{Caller, ExecutionService, StartRun};
pub use store::{OrchestrationStore, RunStore};
pub use trace::TraceRecorder;
