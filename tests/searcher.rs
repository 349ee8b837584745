use nas_rs::autograd::{OptimizerConfig, ParameterKind, ParameterStore, SolverConfig};
use nas_rs::io::load_parameters;
use nas_rs::runner::{DartsSearcher, InMemoryDataSource, SearcherConfig};
use nas_rs::search::{is_architecture_key, SearchNet, SelectionMode};
use nas_rs::NasError;
use ndarray::{ArrayD, IxDyn};
use std::collections::BTreeMap;

mod common;

fn searcher_config() -> SearcherConfig {
    SearcherConfig {
        train_optimizer: OptimizerConfig {
            solver: SolverConfig::Sgd,
            learning_rate: 0.1,
            ..OptimizerConfig::default()
        },
        valid_optimizer: OptimizerConfig {
            solver: SolverConfig::Sgd,
            learning_rate: 0.5,
            ..OptimizerConfig::default()
        },
        ..SearcherConfig::default()
    }
}

fn searcher(
    mode: SelectionMode,
    config: SearcherConfig,
) -> DartsSearcher<SearchNet, InMemoryDataSource, InMemoryDataSource> {
    let net = SearchNet::new(common::tiny_config(mode)).unwrap();
    DartsSearcher::new(
        net,
        ParameterStore::new(0),
        common::data_source(6, 2, 1),
        common::data_source(6, 2, 2),
        config,
    )
    .unwrap()
}

fn weights(store: &ParameterStore) -> BTreeMap<String, ArrayD<f64>> {
    store
        .iter()
        .filter(|(_, p)| p.kind == ParameterKind::Weight)
        .map(|(k, p)| (k.clone(), p.data.clone()))
        .collect()
}

fn assert_phases_are_isolated(mode: SelectionMode) {
    let mut searcher = searcher(mode, searcher_config());
    searcher.callback_on_start().unwrap();

    let before = weights(searcher.store());
    searcher.train_on_batch().unwrap();
    let after_train = weights(searcher.store());
    assert_eq!(
        common::values_where(&before, is_architecture_key),
        common::values_where(&after_train, is_architecture_key)
    );
    assert_ne!(
        common::values_where(&before, |k| !is_architecture_key(k)),
        common::values_where(&after_train, |k| !is_architecture_key(k))
    );

    searcher.valid_on_batch().unwrap();
    let after_valid = weights(searcher.store());
    assert_eq!(
        common::values_where(&after_train, |k| !is_architecture_key(k)),
        common::values_where(&after_valid, |k| !is_architecture_key(k))
    );
    assert_ne!(
        common::values_where(&after_train, is_architecture_key),
        common::values_where(&after_valid, is_architecture_key)
    );
}

#[test]
fn test_full_mode_phases_are_isolated() {
    assert_phases_are_isolated(SelectionMode::Full);
}

#[test]
fn test_sample_mode_phases_are_isolated() {
    assert_phases_are_isolated(SelectionMode::Sample);
}

#[test]
fn test_max_mode_phases_are_isolated() {
    assert_phases_are_isolated(SelectionMode::Max);
}

#[test]
fn test_run_with_warmup_and_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("search/params.json");
    let config = SearcherConfig {
        epochs: 2,
        iters_per_epoch: 2,
        warmup_epochs: 1,
        accum_train: 2,
        label_smoothing: 0.1,
        checkpoint: Some(checkpoint.clone()),
        ..searcher_config()
    };
    let mut searcher = searcher(SelectionMode::Sample, config);
    let summaries = searcher.run().unwrap();
    assert_eq!(summaries.len(), 2);
    assert!(summaries[0].metrics.contains_key("train_loss"));
    assert!(!summaries[0].metrics.contains_key("valid_loss"));
    assert!(summaries[1].metrics.contains_key("valid_err"));
    assert!(summaries[1].metrics["train_loss"].is_finite());

    let saved = load_parameters(&checkpoint).unwrap();
    assert_eq!(saved, searcher.store().snapshot());
}

#[test]
fn test_non_finite_loss_is_reported() {
    let mut images = ArrayD::zeros(IxDyn(&[2, 3, 8, 8]));
    images[[0, 0, 0, 0]] = f64::NAN;
    let poisoned = InMemoryDataSource::new(images, vec![0, 1], 2).unwrap();
    let net = SearchNet::new(common::tiny_config(SelectionMode::Full)).unwrap();
    let mut searcher = DartsSearcher::new(
        net,
        ParameterStore::new(0),
        poisoned,
        common::data_source(4, 2, 0),
        searcher_config(),
    )
    .unwrap();
    assert!(matches!(
        searcher.train_on_batch(),
        Err(NasError::Numeric { .. })
    ));
}
