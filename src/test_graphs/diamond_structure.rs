#![cfg(test)]
/// Performs tests on a diamond graph, i.e. a graph with one input to two nodes which are used to calculate an output.
use crate::autograd::{Context, ParameterStore, VarId};
use crate::graph::{Engine, Graph, NodeId, Operation};
use crate::module::{Identity, Merging, Zero};
use crate::tensorshape::TensorShape;
use ndarray::{ArrayD, IxDyn};

/// Tests the following graph structure where letters indicate nodes and -> indicate edges:
/// ID:   0 1 2 3
/// A -> B: identity
/// A -> C: zero
/// (B, C) -> D: channel concat
pub fn diamond_structure_graph() -> (Graph, Vec<NodeId>) {
    let mut graph = Graph::default();
    let a = graph.add_input("a", TensorShape::nchw(2, 3, 3)).unwrap();
    let b = graph.append("b", Identity::new("b"), &[a]).unwrap();
    let c = graph.append("c", Zero::new("c", (1, 1)), &[a]).unwrap();
    let d = graph.append("d", Merging::concat("d"), &[b, c]).unwrap();
    (graph, vec![a, b, c, d])
}

fn visit_order(graph: &Graph, output: NodeId, input: NodeId) -> Vec<String> {
    let mut store = ParameterStore::default();
    let mut ctx = Context::new(&mut store, false, 0);
    let x = ctx.input(ArrayD::ones(IxDyn(&[1, 2, 3, 3])));
    let mut order = vec![];
    let run_res = Engine::new(graph).run_nodal(&[output], &[(input, x)], |_, node, parents| {
        order.push(node.name().to_string());
        let ids: Vec<VarId> = parents.iter().map(|&&v| v).collect();
        node.operation().forward(&mut ctx, &ids)
    });
    assert!(run_res.is_ok(), "{:?}", run_res);
    order
}

#[test]
fn test_diamond_structure_whole_graph() {
    let (graph, ids) = diamond_structure_graph();
    assert_eq!(graph.get_node(ids[3]).unwrap().shape(), &TensorShape::nchw(4, 3, 3));
    assert_eq!(visit_order(&graph, ids[3], ids[0]), vec!["b", "c", "d"]);
}

#[test]
fn test_diamond_structure_subgraph_output() {
    let (graph, ids) = diamond_structure_graph();
    assert_eq!(visit_order(&graph, ids[2], ids[0]), vec!["c"]);
}
