pub mod builtin;
pub mod expr;
pub mod registry;

pub use registry::{BuiltinOptions, NodeRegistry};
