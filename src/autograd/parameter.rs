//! Hierarchically keyed parameter storage.
//!
//! Keys are `/`-separated scopes, e.g. `cell_0/block_2/join/alpha`. Architecture
//! parameters are recognised by a scope marker (see `search::partition`), so the
//! naming scheme is load-bearing.
use crate::{NasError, NasFloat};
use log::trace;
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Learnable, receives gradients while `need_grad` is set.
    Weight,
    /// State updated by forward passes (running statistics), never by the optimizer.
    Buffer,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Initializer {
    Constant(NasFloat),
    /// Uniform in `±sqrt(6 / (fan_in + fan_out))`.
    GlorotUniform { fan_in: usize, fan_out: usize },
    Normal { std: NasFloat },
}

impl Initializer {
    /// Glorot limits for a conv weight. `fan_in = C_in * k_h * k_w`, `fan_out = C_out * k_h * k_w`.
    pub const fn conv(in_channels: usize, out_channels: usize, kernel: (usize, usize)) -> Self {
        let area = kernel.0 * kernel.1;
        Self::GlorotUniform {
            fan_in: in_channels * area,
            fan_out: out_channels * area,
        }
    }

    fn sample(self, shape: &[usize], rng: &mut StdRng) -> Result<ArrayD<NasFloat>, NasError> {
        let dim = IxDyn(shape);
        match self {
            Self::Constant(v) => Ok(ArrayD::from_elem(dim, v)),
            Self::GlorotUniform { fan_in, fan_out } => {
                let lim = (6. / (fan_in + fan_out).max(1) as NasFloat).sqrt();
                Ok(ArrayD::random_using(dim, Uniform::new(-lim, lim), rng))
            }
            Self::Normal { std } => {
                let dist = Normal::new(0., std)
                    .map_err(|e| NasError::configuration(format!("normal initializer: {}", e)))?;
                Ok(ArrayD::random_using(dim, dist, rng))
            }
        }
    }
}

/// What an operation needs allocated before its first forward pass.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterSpec {
    pub key: String,
    pub shape: Vec<usize>,
    pub init: Initializer,
    pub kind: ParameterKind,
}

impl ParameterSpec {
    pub fn weight<S: Into<String>>(key: S, shape: Vec<usize>, init: Initializer) -> Self {
        Self {
            key: key.into(),
            shape,
            init,
            kind: ParameterKind::Weight,
        }
    }

    pub fn buffer<S: Into<String>>(key: S, shape: Vec<usize>, init: Initializer) -> Self {
        Self {
            key: key.into(),
            shape,
            init,
            kind: ParameterKind::Buffer,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Parameter {
    pub data: ArrayD<NasFloat>,
    pub grad: ArrayD<NasFloat>,
    pub need_grad: bool,
    pub kind: ParameterKind,
}

impl Parameter {
    pub fn new(data: ArrayD<NasFloat>, kind: ParameterKind) -> Self {
        let grad = ArrayD::zeros(data.raw_dim());
        Self {
            data,
            grad,
            need_grad: kind == ParameterKind::Weight,
            kind,
        }
    }

    pub fn is_trainable(&self) -> bool {
        self.kind == ParameterKind::Weight && self.need_grad
    }
}

#[derive(Clone, Debug)]
pub struct ParameterStore {
    params: BTreeMap<String, Parameter>,
    rng: StdRng,
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ParameterStore {
    pub fn new(seed: u64) -> Self {
        Self {
            params: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Parameter> {
        self.params.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Parameter> {
        self.params.get_mut(key)
    }

    /// # Errors
    /// If `key` is absent.
    pub fn data(&self, key: &str) -> Result<&ArrayD<NasFloat>, NasError> {
        self.params
            .get(key)
            .map(|p| &p.data)
            .ok_or_else(|| NasError::invalid_state(format!("parameter {} does not exist", key)))
    }

    /// Returns the parameter under `spec.key`, creating it when absent.
    ///
    /// # Errors
    /// If a parameter already exists under the key with another shape.
    pub fn get_or_create(&mut self, spec: &ParameterSpec) -> Result<&Parameter, NasError> {
        if let Some(existing) = self.params.get(&spec.key) {
            if existing.data.shape() != spec.shape.as_slice() {
                return Err(NasError::configuration(format!(
                    "parameter {} exists with shape {:?}, requested {:?}",
                    spec.key,
                    existing.data.shape(),
                    spec.shape
                )));
            }
        } else {
            let data = spec.init.sample(&spec.shape, &mut self.rng)?;
            trace!("create parameter {} {:?}", spec.key, spec.shape);
            self.params
                .insert(spec.key.clone(), Parameter::new(data, spec.kind));
        }
        self.params
            .get(&spec.key)
            .ok_or_else(|| NasError::invalid_state(format!("parameter {} vanished", spec.key)))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.params.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Parameter)> {
        self.params.iter()
    }

    /// Copies of every parameter value.
    pub fn snapshot(&self) -> BTreeMap<String, ArrayD<NasFloat>> {
        self.params
            .iter()
            .map(|(k, p)| (k.clone(), p.data.clone()))
            .collect()
    }

    /// Overwrites values from `values`. Unknown keys are created as weights.
    ///
    /// # Errors
    /// If a known key is given a value of another shape.
    pub fn load(&mut self, values: BTreeMap<String, ArrayD<NasFloat>>) -> Result<(), NasError> {
        for (key, value) in values {
            match self.params.get_mut(&key) {
                Some(p) => {
                    if p.data.shape() != value.shape() {
                        return Err(NasError::shape_mismatch(format!(
                            "cannot load {:?} into parameter {} of shape {:?}",
                            value.shape(),
                            key,
                            p.data.shape()
                        )));
                    }
                    p.data = value;
                }
                None => {
                    let kind = if key.ends_with("/mean") || key.ends_with("/var") {
                        ParameterKind::Buffer
                    } else {
                        ParameterKind::Weight
                    };
                    self.params.insert(key, Parameter::new(value, kind));
                }
            }
        }
        Ok(())
    }

    /// Toggles gradient computation. Buffers are never trainable and are left alone.
    pub fn set_need_grad(&mut self, key: &str, need_grad: bool) {
        if let Some(p) = self.params.get_mut(key) {
            if p.kind == ParameterKind::Weight {
                p.need_grad = need_grad;
            }
        }
    }

    pub fn zero_grad(&mut self) {
        for p in self.params.values_mut() {
            p.grad.fill(0.);
        }
    }

    /// # Errors
    /// If `key` is absent or `grad` has the wrong shape.
    pub fn accumulate_grad(&mut self, key: &str, grad: &ArrayD<NasFloat>) -> Result<(), NasError> {
        let p = self
            .params
            .get_mut(key)
            .ok_or_else(|| NasError::invalid_state(format!("parameter {} does not exist", key)))?;
        if p.grad.shape() != grad.shape() {
            return Err(NasError::shape_mismatch(format!(
                "gradient {:?} for parameter {} of shape {:?}",
                grad.shape(),
                key,
                p.grad.shape()
            )));
        }
        p.grad += grad;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let mut store = ParameterStore::new(3);
        let spec = ParameterSpec::weight("conv/W", vec![4, 3, 3, 3], Initializer::conv(3, 4, (3, 3)));
        let first = store.get_or_create(&spec).unwrap().data.clone();
        let second = store.get_or_create(&spec).unwrap().data.clone();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);

        let wrong = ParameterSpec::weight("conv/W", vec![4, 3], Initializer::Constant(0.));
        assert!(store.get_or_create(&wrong).is_err());
    }

    #[test]
    fn test_buffers_stay_frozen() {
        let mut store = ParameterStore::default();
        store
            .get_or_create(&ParameterSpec::buffer("bn/mean", vec![2], Initializer::Constant(0.)))
            .unwrap();
        assert!(!store.get("bn/mean").unwrap().need_grad);
        store.set_need_grad("bn/mean", true);
        assert!(!store.get("bn/mean").unwrap().is_trainable());
    }

    #[test]
    fn test_load_checks_shapes() {
        let mut store = ParameterStore::default();
        store
            .get_or_create(&ParameterSpec::weight("a", vec![2], Initializer::Constant(1.)))
            .unwrap();
        let mut values = store.snapshot();
        values.insert("a".to_string(), ArrayD::zeros(IxDyn(&[3])));
        assert!(store.load(values).is_err());
    }
}
