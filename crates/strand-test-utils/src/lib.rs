//! Shared fakes and fixtures for Strand tests.

mod broker;
mod capabilities;
mod events;
pub mod fixtures;
mod orchestrator;

pub use broker::StaticTokenBroker;
pub use capabilities::ScriptedCapabilities;
pub use events::{recording_emitter, RecordedEvents};
pub use orchestrator::StubOrchestrator;
