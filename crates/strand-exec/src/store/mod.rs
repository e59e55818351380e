pub mod orchestration;
pub mod runs;

pub use orchestration::{latest_attempts, OrchestrationStore};
pub use runs::RunStore;
