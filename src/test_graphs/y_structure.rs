#![cfg(test)]
/// Performs tests on a y-structure graph, i.e. a graph with one input and two outputs.
use crate::graph::{Engine, ExecuteError, Graph, NodeId};
use crate::module::{Activation, Identity};
use crate::tensorshape::TensorShape;
use crate::NasError;

/// Tests the following graph structure where letters indicate nodes and -> indicate edges:
/// ID:   0 1 2 3 4 5
/// A -> B, B -> C, C -> D, B -> E, E -> F
pub fn y_structure_graph() -> (Graph, Vec<NodeId>) {
    let mut graph = Graph::default();
    let a = graph.add_input("a", TensorShape::features(3)).unwrap();
    let b = graph.append("b", Identity::new("b"), &[a]).unwrap();
    let c = graph.append("c", Activation::relu("c"), &[b]).unwrap();
    let d = graph.append("d", Identity::new("d"), &[c]).unwrap();
    let e = graph.append("e", Activation::relu("e"), &[b]).unwrap();
    let f = graph.append("f", Identity::new("f"), &[e]).unwrap();
    (graph, vec![a, b, c, d, e, f])
}

#[test]
fn test_y_structure_graph_whole_graph() {
    let (graph, ids) = y_structure_graph();
    let required = Engine::new(&graph)
        .required_nodes(&[ids[3], ids[5]], &[ids[0]])
        .unwrap();
    assert_eq!(required, ids[1..].to_vec());
}

#[test]
fn test_y_structure_graph_single_branch() {
    let (graph, ids) = y_structure_graph();
    let required = Engine::new(&graph).required_nodes(&[ids[5]], &[ids[0]]).unwrap();
    assert_eq!(required, vec![ids[1], ids[4], ids[5]]);
}

#[test]
fn test_y_structure_graph_missing_input() {
    let (graph, ids) = y_structure_graph();
    assert!(matches!(
        Engine::new(&graph).required_nodes(&[ids[3]], &[]),
        Err(NasError::Execute(ExecuteError::MissingInput { .. }))
    ));
}

#[test]
fn test_y_structure_graph_duplicate_name() {
    let (mut graph, ids) = y_structure_graph();
    assert!(graph.append("c", Identity::new("c"), &[ids[1]]).is_err());
}
