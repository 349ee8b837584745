use nas_rs::autograd::{Context, ParameterStore};
use nas_rs::search::{is_architecture_key, SearchNet, SearchNetConfig, SelectionMode};
use nas_rs::NasError;
use std::collections::BTreeSet;

mod common;

#[test]
fn test_default_search_space_partition() {
    let net = SearchNet::new(SearchNetConfig::default()).unwrap();
    let keys: BTreeSet<String> = net.parameter_keys().into_iter().collect();
    let partition = net.parameter_partition();
    let network: BTreeSet<String> = partition.network.iter().cloned().collect();
    let architecture: BTreeSet<String> = partition.architecture.iter().cloned().collect();

    assert!(network.is_disjoint(&architecture));
    assert_eq!(network.union(&architecture).cloned().collect::<BTreeSet<_>>(), keys);
    assert_eq!(architecture.len(), 21);
    assert!(architecture.iter().all(|k| is_architecture_key(k)));
    assert_eq!(net.arch_modules().len(), 21);
}

#[test]
fn test_config_round_trips_through_json() {
    let config = common::tiny_config(SelectionMode::Max);
    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(serde_json::from_str::<SearchNetConfig>(&json).unwrap(), config);
    let partial: SearchNetConfig =
        serde_json::from_str(r#"{"n_classes": 100, "mode": "full", "candidates": ["Identity", "Zero"]}"#)
            .unwrap();
    assert_eq!(partial.n_classes, 100);
    assert_eq!(partial.cell_depth, vec![7; 3]);
    assert_eq!(partial.candidates.len(), 2);
}

#[test]
fn test_discrete_forward_needs_selection() {
    let net = SearchNet::new(common::tiny_config(SelectionMode::Max)).unwrap();
    let mut store = ParameterStore::new(0);
    let mut ctx = Context::new(&mut store, false, 0);
    let (images, _) = common::random_images(2, 0);
    let x = ctx.input(images);
    assert!(matches!(
        net.forward(&mut ctx, x),
        Err(NasError::SelectionNotInitialized { .. })
    ));
}

#[test]
fn test_train_net_reuses_searched_parameters() {
    let config = common::tiny_config(SelectionMode::Full);
    let searched = SearchNet::new(config.clone()).unwrap();
    let mut store = ParameterStore::new(1);
    searched.initialize(&mut store).unwrap();
    let alpha = "tiny/cell_0/zoph_block_1/join/alpha";
    store.get_mut(alpha).unwrap().data[[3]] = 2.;
    let params = store.snapshot();

    let mut fresh = ParameterStore::new(2);
    let net = SearchNet::train_net(config, &mut fresh, Some(params.clone())).unwrap();
    assert_eq!(net.mode(), SelectionMode::Max);
    assert_eq!(fresh.data(alpha).unwrap(), &params[alpha]);
    assert_eq!(fresh.data("tiny/stem_conv_1/W").unwrap(), &params["tiny/stem_conv_1/W"]);

    let (_, join) = net
        .arch_modules()
        .into_iter()
        .find(|(_, j)| j.alpha_key() == alpha)
        .unwrap();
    assert_eq!(join.state().active_index(), Some(3));

    let modules = net.net_modules(true).unwrap();
    let identity = net.graph().find("tiny/cell_0/zoph_block_1/candidate_3").unwrap();
    let avg_pool = net.graph().find("tiny/cell_0/zoph_block_1/candidate_2").unwrap();
    assert!(modules.contains(&identity));
    assert!(!modules.contains(&avg_pool));

    let mut ctx = Context::new(&mut fresh, false, 0);
    let (images, _) = common::random_images(2, 3);
    let x = ctx.input(images);
    let y = net.forward(&mut ctx, x).unwrap();
    assert_eq!(ctx.value(y).shape(), &[2, 3]);
}
