pub mod config;
pub mod error;
pub mod event;
pub mod orchestration;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, StrandError};
pub use event::{EventBus, EventEmitter};
pub use state::{GraphState, StateUpdate};
pub use types::*;
