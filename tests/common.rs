#![allow(dead_code)]
use nas_rs::runner::InMemoryDataSource;
use nas_rs::search::{SearchNetConfig, SelectionMode, ZophCandidate};
use ndarray::{Array, ArrayD, IxDyn};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use std::collections::BTreeMap;

pub fn tiny_config(mode: SelectionMode) -> SearchNetConfig {
    SearchNetConfig {
        name: "tiny".to_string(),
        input_shape: (3, 8, 8),
        n_classes: 3,
        stem_channels: 4,
        cell_depth: vec![2, 1],
        cell_channels: vec![4, 4],
        reducing: vec![false, true],
        candidates: vec![
            ZophCandidate::SepConv3x3,
            ZophCandidate::DilSepConv3x3,
            ZophCandidate::AveragePool3x3,
            ZophCandidate::Identity,
            ZophCandidate::Zero,
        ],
        mode,
        ..SearchNetConfig::default()
    }
}

pub fn random_images(n: usize, seed: u64) -> (ArrayD<f64>, Vec<usize>) {
    let mut rng = Pcg64::seed_from_u64(seed);
    let images = Array::random_using(IxDyn(&[n, 3, 8, 8]), Normal::new(0., 1.).unwrap(), &mut rng);
    let labels = (0..n).map(|_| rng.gen_range(0..3)).collect();
    (images, labels)
}

pub fn data_source(n: usize, batch_size: usize, seed: u64) -> InMemoryDataSource {
    let (images, labels) = random_images(n, seed);
    InMemoryDataSource::new(images, labels, batch_size).unwrap()
}

/// Values of the parameters whose key satisfies `filter`.
pub fn values_where(
    snapshot: &BTreeMap<String, ArrayD<f64>>,
    filter: impl Fn(&str) -> bool,
) -> BTreeMap<String, ArrayD<f64>> {
    snapshot
        .iter()
        .filter(|(k, _)| filter(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
