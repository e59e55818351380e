pub mod adapter;
pub mod local;
pub mod registry;

pub use adapter::{
    EventStream, Executable, RunConfig, RunOutcome, RunServices, RuntimeAdapter, StateSnapshot,
    StreamMode,
};
pub use local::LocalRuntime;
pub use registry::AdapterRegistry;
