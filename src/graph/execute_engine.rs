//! ## Engine lifecycle
//! 1. Create the `Engine` by passing it a `Graph`
//! 2. Call `run` or `run_nodal` to compute output values from input values
//! 3. GOTO 2
//!
//! The visitor passed to `run` computes the value of a node from the values of its
//! parents. The engine only visits nodes the requested outputs depend on, and only
//! follows the parents each operation reports as active, so an unselected branch of a
//! discrete selection node is never visited.
use super::graph::{Graph, GraphError, NodeId, OperationNode};
use super::operation::{Operation, PhysicalOp};
use crate::NasError;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;

pub struct Engine<'a> {
    graph: &'a Graph,
}

#[derive(Debug)]
pub enum ExecuteError {
    GraphError {
        err: GraphError,
    },
    /// An operation reported an active input index it does not have.
    ActiveInputOutOfRange {
        id: NodeId,
        index: usize,
    },
    /// A required node has no parents and no value was supplied for it.
    MissingInput {
        id: NodeId,
    },
    NotComputed {
        id: NodeId,
    },
}

impl From<GraphError> for ExecuteError {
    fn from(err: GraphError) -> Self {
        Self::GraphError { err }
    }
}

impl<'a> Engine<'a> {
    pub const fn new(graph: &'a Graph) -> Self {
        Self { graph }
    }

    /// Parents of `id` that its operation will read.
    ///
    /// # Errors
    pub fn active_parents(&self, id: NodeId) -> Result<Vec<NodeId>, NasError> {
        let node = self.graph.get_node(id)?;
        node.operation()
            .active_inputs(node.inputs().len())?
            .into_iter()
            .map(|i| {
                node.inputs()
                    .get(i)
                    .copied()
                    .ok_or_else(|| ExecuteError::ActiveInputOutOfRange { id, index: i }.into())
            })
            .collect()
    }

    /// Every node needed to compute `outputs`, stopping at `given`, in ascending order.
    ///
    /// # Errors
    pub fn required_nodes(
        &self,
        outputs: &[NodeId],
        given: &[NodeId],
    ) -> Result<Vec<NodeId>, NasError> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<NodeId> = outputs.to_vec();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) || given.contains(&id) {
                continue;
            }
            let parents = self.active_parents(id)?;
            if parents.is_empty() && matches!(self.graph.get_node(id)?.operation(), PhysicalOp::Input(_)) {
                return Err(ExecuteError::MissingInput { id }.into());
            }
            stack.extend(parents);
        }
        Ok(seen.into_iter().filter(|id| !given.contains(id)).collect())
    }

    /// Computes `outputs` from `inputs` by visiting the required nodes in topological order.
    ///
    /// # Arguments
    ///
    /// * `outputs` - Nodes whose values to return.
    /// * `inputs` - Values supplied for (typically) the input nodes.
    /// * `visit` - Called with the operation and the values of its active parents.
    ///
    /// # Errors
    /// Whatever the visitor returns, or a missing input.
    pub fn run<T: Clone + Debug>(
        &self,
        outputs: &[NodeId],
        inputs: &[(NodeId, T)],
        mut visit: impl FnMut(&PhysicalOp, &[&T]) -> Result<T, NasError>,
    ) -> Result<Vec<(NodeId, T)>, NasError> {
        self.run_nodal(outputs, inputs, |_, node, values| {
            visit(node.operation(), values)
        })
    }

    /// Like [`Engine::run`], with the node id and node passed to the visitor.
    ///
    /// # Errors
    pub fn run_nodal<T: Clone + Debug>(
        &self,
        outputs: &[NodeId],
        inputs: &[(NodeId, T)],
        mut visit: impl FnMut(NodeId, &OperationNode, &[&T]) -> Result<T, NasError>,
    ) -> Result<Vec<(NodeId, T)>, NasError> {
        let given = inputs.iter().map(|(id, _)| *id).collect::<Vec<_>>();
        let order = self.required_nodes(outputs, &given)?;
        let mut state: HashMap<NodeId, T> = inputs.iter().cloned().collect();

        for id in order {
            let node = self.graph.get_node(id)?;
            let parents = self.active_parents(id)?;
            let value = {
                let values = parents
                    .iter()
                    .map(|p| state.get(p).ok_or(ExecuteError::NotComputed { id: *p }))
                    .collect::<Result<Vec<&T>, _>>()?;
                visit(id, node, &values)?
            };
            state.insert(id, value);
        }

        outputs
            .iter()
            .map(|&id| {
                state
                    .get(&id)
                    .cloned()
                    .map(|v| (id, v))
                    .ok_or_else(|| ExecuteError::NotComputed { id }.into())
            })
            .collect()
    }
}
