//! Catalog of operations. Composite layers are built out of the primitive ones and
//! scope their parameters under their own name.

/// Implements [`crate::graph::Operation`] for a layer by forwarding to its `body`.
macro_rules! delegate_to_body {
    ($layer:ty) => {
        impl Operation for $layer {
            fn name(&self) -> &str {
                &self.name
            }

            fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
                self.body.output_shape(inputs)
            }

            fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
                self.body.forward(ctx, inputs)
            }

            fn parameter_specs(&self) -> Vec<ParameterSpec> {
                self.body.parameter_specs()
            }

            fn macs(&self, inputs: &[TensorShape]) -> Result<NasFloat, NasError> {
                self.body.macs(inputs)
            }
        }
    };
}

mod basic;
mod conv;
mod layers;
mod normalization;
mod pooling;
mod segmentation;
mod sequential;

pub use basic::{
    Activation, Collapse, DropPath, Dropout, Identity, Input, Interpolate, MergeMode, Merging,
    Zero,
};
pub use conv::{Conv, ConvParams, Linear};
pub use layers::{
    build_activation, AuxiliaryHeadCifar, ConvLayer, ConvLayerConfig, LayerConfig, LinearLayer,
    LinearLayerConfig, MBConvLayer, MBConvLayerConfig, ReLUConvBN, ResidualBlock,
    ResidualBlockConfig, SEModule, SepConv, SeparableConvBn, SeparableConvBnConfig,
    XceptionLayer, XceptionLayerConfig,
};
pub use normalization::BatchNorm;
pub use pooling::{AvgPool, GlobalAvgPool, MaxPool};
pub use segmentation::{Aspp, AsppConfig, ConcatProjection, ConcatProjectionConfig, Decoder, DecoderConfig};
pub use sequential::Sequential;

use crate::autograd::VarId;
use crate::tensorshape::TensorShape;
use crate::NasError;

pub(crate) fn scoped(name: &str, child: &str) -> String {
    format!("{}/{}", name, child)
}

pub(crate) fn single_shape<'a>(
    name: &str,
    inputs: &'a [TensorShape],
) -> Result<&'a TensorShape, NasError> {
    match inputs {
        [shape] => Ok(shape),
        _ => Err(NasError::configuration(format!(
            "{} takes one input, got {}",
            name,
            inputs.len()
        ))),
    }
}

pub(crate) fn single_input(name: &str, inputs: &[VarId]) -> Result<VarId, NasError> {
    match inputs {
        [id] => Ok(*id),
        _ => Err(NasError::invalid_state(format!(
            "{} takes one input, got {}",
            name,
            inputs.len()
        ))),
    }
}
