pub mod compiler;
pub mod document;
pub mod ir;

pub use compiler::{CompileOutput, CompilerOptions, GraphCompiler};
pub use document::{DocumentEdge, DocumentNode, GraphDocument};
pub use ir::{Barrier, GraphIr, GraphIrEdge, GraphIrNode, RoutingMap};
