use nas_rs::autograd::{Context, ParameterStore};
use nas_rs::graph::Operation;
use nas_rs::io::ModuleBundle;
use nas_rs::search::{SearchNet, SelectionMode};
use ndarray::{Array, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_pcg::Pcg64;

mod common;

#[test]
fn test_compressed_module_bundles_reproduce_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let mut net = SearchNet::new(common::tiny_config(SelectionMode::Sample)).unwrap();
    let mut store = ParameterStore::new(4);
    net.initialize(&mut store).unwrap();
    net.compress(&mut store).unwrap();

    let written = net.save_module_bundles(dir.path(), &mut store, true).unwrap();
    assert_eq!(written.len(), net.net_modules(true).unwrap().len());
    let sep = dir.path().join("tiny/cell_0/zoph_block_0/candidate_0.json");
    assert!(written.contains(&sep));
    assert!(!dir.path().join("tiny/cell_0/zoph_block_0/candidate_1.json").exists());

    let bundle = ModuleBundle::load(&sep).unwrap();
    assert_eq!(bundle.input_shapes[0].dims()[0], Some(1));
    let mut rng = Pcg64::seed_from_u64(0);
    let x = Array::random_using(IxDyn(&[1, 4, 8, 8]), Uniform::new(-1., 1.), &mut rng);

    let id = net.graph().find("tiny/cell_0/zoph_block_0/candidate_0").unwrap();
    let expected = {
        let mut ctx = Context::new(&mut store, false, 0);
        let v = ctx.input(x.clone());
        let y = net.graph().get_node(id).unwrap().operation().forward(&mut ctx, &[v]).unwrap();
        ctx.value(y).clone()
    };
    let actual = bundle.forward(&[x]).unwrap();
    assert_eq!(actual.shape(), expected.shape());
    for (a, e) in actual.iter().zip(expected.iter()) {
        approx::assert_abs_diff_eq!(*a, *e, epsilon = 1e-12);
    }
}
