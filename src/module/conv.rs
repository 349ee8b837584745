use super::{scoped, single_input, single_shape};
use crate::autograd::kernels::conv2d_output_hw;
use crate::autograd::{Context, Conv2dConfig, Initializer, ParameterSpec, VarId};
use crate::graph::Operation;
use crate::tensorshape::TensorShape;
use crate::util::min_divisible_value;
use crate::{NasError, NasFloat};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvParams {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub pad: (usize, usize),
    pub dilation: (usize, usize),
    pub groups: usize,
    pub with_bias: bool,
}

impl ConvParams {
    /// Unit stride, no padding, no bias.
    pub const fn new(in_channels: usize, out_channels: usize, kernel: (usize, usize)) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel,
            stride: (1, 1),
            pad: (0, 0),
            dilation: (1, 1),
            groups: 1,
            with_bias: false,
        }
    }

    pub const fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    pub const fn with_pad(mut self, pad: (usize, usize)) -> Self {
        self.pad = pad;
        self
    }

    pub const fn with_dilation(mut self, dilation: (usize, usize)) -> Self {
        self.dilation = dilation;
        self
    }

    pub const fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub const fn with_bias(mut self, with_bias: bool) -> Self {
        self.with_bias = with_bias;
        self
    }

    const fn config(&self) -> Conv2dConfig {
        Conv2dConfig {
            stride: self.stride,
            pad: self.pad,
            dilation: self.dilation,
            groups: self.groups,
        }
    }
}

/// 2-D convolution. Parameters: `W (C_out, C_in / groups, K_h, K_w)` and, with a bias,
/// `b (C_out)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conv {
    name: String,
    params: ConvParams,
}

impl Conv {
    /// The group count is clamped to the largest divisor of `in_channels` not above the
    /// request.
    ///
    /// # Errors
    /// Zero channels, or output channels the group count does not divide.
    pub fn new<S: Into<String>>(name: S, mut params: ConvParams) -> Result<Self, NasError> {
        let name = name.into();
        if params.in_channels == 0 || params.out_channels == 0 {
            return Err(NasError::configuration(format!(
                "{}: convolution needs channels, got {} -> {}",
                name, params.in_channels, params.out_channels
            )));
        }
        params.groups = min_divisible_value(params.in_channels, params.groups.max(1));
        if params.out_channels % params.groups != 0 {
            return Err(NasError::configuration(format!(
                "{}: {} output channels are not divisible into {} groups",
                name, params.out_channels, params.groups
            )));
        }
        Ok(Self { name, params })
    }

    pub const fn params(&self) -> &ConvParams {
        &self.params
    }

    fn weight_spec(&self) -> ParameterSpec {
        let p = &self.params;
        ParameterSpec::weight(
            scoped(&self.name, "W"),
            vec![p.out_channels, p.in_channels / p.groups, p.kernel.0, p.kernel.1],
            Initializer::conv(p.in_channels / p.groups, p.out_channels, p.kernel),
        )
    }

    fn bias_spec(&self) -> Option<ParameterSpec> {
        self.params.with_bias.then(|| {
            ParameterSpec::weight(
                scoped(&self.name, "b"),
                vec![self.params.out_channels],
                Initializer::Constant(0.),
            )
        })
    }
}

impl Operation for Conv {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        let shape = single_shape(&self.name, inputs)?;
        let channels = shape.channels()?;
        if channels != self.params.in_channels {
            return Err(NasError::shape_mismatch(format!(
                "expected {} channels, got {}",
                self.params.in_channels, shape
            )));
        }
        let (h, w) = conv2d_output_hw(shape.spatial()?, self.params.kernel, &self.params.config())?;
        Ok(TensorShape::new(vec![
            shape[0],
            Some(self.params.out_channels),
            Some(h),
            Some(w),
        ]))
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        let input = single_input(&self.name, inputs)?;
        let weight = ctx.parameter(&self.weight_spec())?;
        let bias = match self.bias_spec() {
            Some(spec) => Some(ctx.parameter(&spec)?),
            None => None,
        };
        ctx.conv2d(input, weight, bias, self.params.config())
    }

    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        std::iter::once(self.weight_spec())
            .chain(self.bias_spec())
            .collect()
    }

    fn macs(&self, inputs: &[TensorShape]) -> Result<NasFloat, NasError> {
        let out = self.output_shape(inputs)?;
        let (h, w) = out.spatial()?;
        let p = &self.params;
        Ok((h * w * p.out_channels * (p.in_channels / p.groups) * p.kernel.0 * p.kernel.1)
            as NasFloat)
    }
}

/// Affine map of `(N, F)` features. Parameters: `W (F, O)` and optionally `b (O)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Linear {
    name: String,
    in_features: usize,
    out_features: usize,
    with_bias: bool,
}

impl Linear {
    pub fn new<S: Into<String>>(
        name: S,
        in_features: usize,
        out_features: usize,
        with_bias: bool,
    ) -> Self {
        Self {
            name: name.into(),
            in_features,
            out_features,
            with_bias,
        }
    }

    fn weight_spec(&self) -> ParameterSpec {
        ParameterSpec::weight(
            scoped(&self.name, "W"),
            vec![self.in_features, self.out_features],
            Initializer::GlorotUniform {
                fan_in: self.in_features,
                fan_out: self.out_features,
            },
        )
    }

    fn bias_spec(&self) -> Option<ParameterSpec> {
        self.with_bias.then(|| {
            ParameterSpec::weight(
                scoped(&self.name, "b"),
                vec![self.out_features],
                Initializer::Constant(0.),
            )
        })
    }
}

impl Operation for Linear {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        let shape = single_shape(&self.name, inputs)?;
        if shape.rank() != 2 || shape[1] != Some(self.in_features) {
            return Err(NasError::shape_mismatch(format!(
                "expected (?, {}), got {}",
                self.in_features, shape
            )));
        }
        Ok(TensorShape::new(vec![shape[0], Some(self.out_features)]))
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        let input = single_input(&self.name, inputs)?;
        let weight = ctx.parameter(&self.weight_spec())?;
        let bias = match self.bias_spec() {
            Some(spec) => Some(ctx.parameter(&spec)?),
            None => None,
        };
        ctx.linear(input, weight, bias)
    }

    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        std::iter::once(self.weight_spec())
            .chain(self.bias_spec())
            .collect()
    }

    fn macs(&self, _inputs: &[TensorShape]) -> Result<NasFloat, NasError> {
        Ok((self.in_features * self.out_features) as NasFloat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::ParameterStore;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn test_groups_clamp_to_divisor() {
        let conv = Conv::new("dw", ConvParams::new(6, 6, (3, 3)).with_groups(4)).unwrap();
        assert_eq!(conv.params().groups, 3);
        assert_eq!(conv.parameter_specs()[0].shape, vec![6, 2, 3, 3]);
        assert!(Conv::new("bad", ConvParams::new(6, 5, (3, 3)).with_groups(3)).is_err());
    }

    #[test]
    fn test_output_shape_and_macs() {
        let conv = Conv::new(
            "c",
            ConvParams::new(3, 8, (3, 3))
                .with_stride((2, 2))
                .with_pad((1, 1))
                .with_bias(true),
        )
        .unwrap();
        let input = [TensorShape::nchw(3, 8, 8)];
        assert_eq!(conv.output_shape(&input).unwrap(), TensorShape::nchw(8, 4, 4));
        assert_eq!(conv.macs(&input).unwrap(), (4 * 4 * 8 * 3 * 9) as NasFloat);
        assert_eq!(conv.parameter_keys(), vec!["c/W".to_string(), "c/b".to_string()]);
        assert!(conv.output_shape(&[TensorShape::nchw(4, 8, 8)]).is_err());
    }

    #[test]
    fn test_forward_creates_parameters() {
        let conv = Conv::new("c", ConvParams::new(2, 4, (1, 1))).unwrap();
        let mut store = ParameterStore::new(1);
        let mut ctx = Context::new(&mut store, true, 0);
        let x = ctx.input(ArrayD::ones(IxDyn(&[2, 2, 3, 3])));
        let y = conv.forward(&mut ctx, &[x]).unwrap();
        assert_eq!(ctx.value(y).shape(), &[2, 4, 3, 3]);
        assert!(store.contains("c/W"));
        assert!(!store.contains("c/b"));
    }
}
