use super::operation::{Operation, PhysicalOp};
use crate::module::Input;
use crate::tensorshape::TensorShape;
use crate::NasError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Handle to a node, only obtainable from the graph that created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(usize);

impl NodeId {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub enum GraphError {
    UnknownNode { id: NodeId },
    DuplicateName { name: String },
    UnknownName { name: String },
}

/// A node of the graph. Its output shape is inferred when it is appended.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationNode {
    name: String,
    operation: PhysicalOp,
    inputs: Vec<NodeId>,
    shape: TensorShape,
}

impl OperationNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn operation(&self) -> &PhysicalOp {
        &self.operation
    }

    pub fn operation_mut(&mut self) -> &mut PhysicalOp {
        &mut self.operation
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub const fn shape(&self) -> &TensorShape {
        &self.shape
    }
}

/// Directed acyclic graph of operations, stored in insertion order. Parents must exist
/// before a child is appended, so insertion order is a topological order.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<OperationNode>,
    names: HashMap<String, NodeId>,
}

impl Graph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&OperationNode> {
        self.nodes.get(id.0)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut OperationNode> {
        self.nodes.get_mut(id.0)
    }

    /// # Errors
    pub fn get_node(&self, id: NodeId) -> Result<&OperationNode, GraphError> {
        self.node(id).ok_or(GraphError::UnknownNode { id })
    }

    /// # Errors
    pub fn find(&self, name: &str) -> Result<NodeId, GraphError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownName {
                name: name.to_string(),
            })
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &OperationNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    /// Shapes of the parents of `id`.
    ///
    /// # Errors
    pub fn input_shapes(&self, id: NodeId) -> Result<Vec<TensorShape>, GraphError> {
        self.get_node(id)?
            .inputs
            .iter()
            .map(|&p| self.get_node(p).map(|n| n.shape.clone()))
            .collect()
    }

    /// # Errors
    pub fn add_input<S: Into<String>>(
        &mut self,
        name: S,
        shape: TensorShape,
    ) -> Result<NodeId, NasError> {
        let name = name.into();
        let op = Input::new(name.clone(), shape);
        self.append(name, op, &[])
    }

    /// Appends `operation` fed by `parents`, inferring its output shape.
    ///
    /// # Errors
    /// Unknown parents, a reused name, or parent shapes the operation rejects.
    pub fn append<S, O>(
        &mut self,
        name: S,
        operation: O,
        parents: &[NodeId],
    ) -> Result<NodeId, NasError>
    where
        S: Into<String>,
        O: Into<PhysicalOp>,
    {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(GraphError::DuplicateName { name }.into());
        }
        let operation = operation.into();
        let input_shapes = parents
            .iter()
            .map(|&p| self.get_node(p).map(|n| n.shape.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        let shape = operation.output_shape(&input_shapes).map_err(|e| match e {
            NasError::ShapeMismatch { message } => {
                NasError::shape_mismatch(format!("{}: {}", name, message))
            }
            other => other,
        })?;

        let id = NodeId(self.nodes.len());
        self.names.insert(name.clone(), id);
        self.nodes.push(OperationNode {
            name,
            operation,
            inputs: parents.to_vec(),
            shape,
        });
        Ok(id)
    }

    /// Nodes without parents.
    pub fn input_ids(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, n)| matches!(n.operation, PhysicalOp::Input(_)))
            .map(|(id, _)| id)
            .collect()
    }
}
