mod execute_engine;
#[allow(clippy::module_inception)]
mod graph;
mod operation;

pub use execute_engine::{Engine, ExecuteError};
pub use graph::{Graph, GraphError, NodeId, OperationNode};
pub use operation::{Operation, PhysicalOp};
