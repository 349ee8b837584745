use super::{single_input, single_shape};
use crate::autograd::{Context, Pool2dConfig, VarId};
use crate::graph::Operation;
use crate::tensorshape::TensorShape;
use crate::{NasError, NasFloat};
use serde::{Deserialize, Serialize};

fn pooled_shape(config: &Pool2dConfig, shape: &TensorShape) -> Result<TensorShape, NasError> {
    let (h, w) = config.output_hw(shape.spatial()?)?;
    Ok(TensorShape::new(vec![shape[0], shape[1], Some(h), Some(w)]))
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaxPool {
    name: String,
    config: Pool2dConfig,
}

impl MaxPool {
    pub fn new<S: Into<String>>(name: S, config: Pool2dConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub const fn config(&self) -> &Pool2dConfig {
        &self.config
    }
}

impl Operation for MaxPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        pooled_shape(&self.config, single_shape(&self.name, inputs)?)
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        let input = single_input(&self.name, inputs)?;
        ctx.max_pool(input, &self.config)
    }
}

/// Average pooling; padded positions count towards the divisor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AvgPool {
    name: String,
    config: Pool2dConfig,
}

impl AvgPool {
    pub fn new<S: Into<String>>(name: S, config: Pool2dConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

impl Operation for AvgPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        pooled_shape(&self.config, single_shape(&self.name, inputs)?)
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        let input = single_input(&self.name, inputs)?;
        ctx.avg_pool(input, &self.config)
    }

    fn macs(&self, inputs: &[TensorShape]) -> Result<NasFloat, NasError> {
        let out = self.output_shape(inputs)?;
        let (kh, kw) = self.config.kernel;
        Ok((out.num_elements_or(1) * kh * kw) as NasFloat)
    }
}

/// Mean over the spatial axes, keeping them as unit axes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GlobalAvgPool {
    name: String,
}

impl GlobalAvgPool {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }
}

impl Operation for GlobalAvgPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        let shape = single_shape(&self.name, inputs)?;
        shape.spatial()?;
        Ok(TensorShape::new(vec![shape[0], shape[1], Some(1), Some(1)]))
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        let input = single_input(&self.name, inputs)?;
        ctx.global_avg_pool(input)
    }

    fn macs(&self, inputs: &[TensorShape]) -> Result<NasFloat, NasError> {
        Ok(single_shape(&self.name, inputs)?.num_elements_or(1) as NasFloat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_shapes() {
        let max = MaxPool::new("p", Pool2dConfig::new((3, 3), (2, 2), (1, 1)));
        assert_eq!(
            max.output_shape(&[TensorShape::nchw(4, 8, 8)]).unwrap(),
            TensorShape::nchw(4, 4, 4)
        );
        let gap = GlobalAvgPool::new("g");
        assert_eq!(
            gap.output_shape(&[TensorShape::nchw(4, 8, 6)]).unwrap(),
            TensorShape::nchw(4, 1, 1)
        );
        assert!(gap.output_shape(&[TensorShape::features(4)]).is_err());
    }
}
