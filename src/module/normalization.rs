use super::{scoped, single_input, single_shape};
use crate::autograd::{BatchNormConfig, Context, Initializer, ParameterSpec, VarId};
use crate::graph::Operation;
use crate::tensorshape::TensorShape;
use crate::{NasError, NasFloat};
use serde::{Deserialize, Serialize};

/// Batch normalization over axis 1. Keys: `beta`, `gamma` (learnable when `affine`),
/// running `mean` and `var` buffers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchNorm {
    name: String,
    channels: usize,
    config: BatchNormConfig,
    affine: bool,
}

impl BatchNorm {
    pub fn new<S: Into<String>>(name: S, channels: usize) -> Self {
        Self {
            name: name.into(),
            channels,
            config: BatchNormConfig::default(),
            affine: true,
        }
    }

    /// Fixes `gamma = 1` and `beta = 0`.
    pub const fn without_affine(mut self) -> Self {
        self.affine = false;
        self
    }

    pub const fn with_config(mut self, config: BatchNormConfig) -> Self {
        self.config = config;
        self
    }

    pub const fn channels(&self) -> usize {
        self.channels
    }

    fn spec(&self, child: &str, value: NasFloat, learnable: bool) -> ParameterSpec {
        let key = scoped(&self.name, child);
        let init = Initializer::Constant(value);
        if learnable {
            ParameterSpec::weight(key, vec![self.channels], init)
        } else {
            ParameterSpec::buffer(key, vec![self.channels], init)
        }
    }

    fn specs(&self) -> [ParameterSpec; 4] {
        [
            self.spec("beta", 0., self.affine),
            self.spec("gamma", 1., self.affine),
            self.spec("mean", 0., false),
            self.spec("var", 1., false),
        ]
    }
}

impl Operation for BatchNorm {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        let shape = single_shape(&self.name, inputs)?;
        if !matches!(shape.rank(), 2 | 4) || shape[1] != Some(self.channels) {
            return Err(NasError::shape_mismatch(format!(
                "batch norm over {} channels got {}",
                self.channels, shape
            )));
        }
        Ok(shape.clone())
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        let input = single_input(&self.name, inputs)?;
        let [beta, gamma, mean, var] = self.specs();
        let beta = ctx.parameter(&beta)?;
        let gamma = ctx.parameter(&gamma)?;
        ctx.store_mut().get_or_create(&mean)?;
        ctx.store_mut().get_or_create(&var)?;

        let dims = ctx.value(input).shape().to_vec();
        if dims.len() == 2 {
            let x = ctx.reshape(input, &[dims[0], dims[1], 1, 1])?;
            let y = ctx.batch_norm(x, gamma, beta, &mean.key, &var.key, &self.config)?;
            ctx.reshape(y, &dims)
        } else {
            ctx.batch_norm(input, gamma, beta, &mean.key, &var.key, &self.config)
        }
    }

    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        self.specs().to_vec()
    }

    fn macs(&self, inputs: &[TensorShape]) -> Result<NasFloat, NasError> {
        Ok(single_shape(&self.name, inputs)?.num_elements_or(1) as NasFloat)
    }
}
