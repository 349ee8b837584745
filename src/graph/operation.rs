use crate::autograd::{Context, ParameterSpec, VarId};
use crate::module::{
    Activation, Aspp, AuxiliaryHeadCifar, AvgPool, BatchNorm, Collapse, ConcatProjection, Conv,
    ConvLayer, Decoder, DropPath, Dropout, GlobalAvgPool, Identity, Input, Interpolate, Linear,
    LinearLayer, MBConvLayer, MaxPool, Merging, ReLUConvBN, ResidualBlock, SEModule, SepConv,
    SeparableConvBn, Sequential, XceptionLayer, Zero,
};
use crate::search::{Join, MixedOp};
use crate::tensorshape::TensorShape;
use crate::{NasError, NasFloat};
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Operations are deterministic given the context's mode and random state. Everything
/// learnable lives in the [`crate::autograd::ParameterStore`] under the keys reported
/// by `parameter_specs`, never inside the operation.
#[enum_dispatch]
pub trait Operation: Clone + Debug {
    /// Scope of the operation's parameters.
    fn name(&self) -> &str;

    /// # Errors
    /// Input shapes the operation cannot consume.
    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError>;

    /// Records the operation on the context's tape. `inputs` holds the values of the
    /// parents listed by `active_inputs`, in that order.
    ///
    /// # Errors
    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError>;

    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        vec![]
    }

    fn parameter_keys(&self) -> Vec<String> {
        self.parameter_specs().into_iter().map(|s| s.key).collect()
    }

    /// Positions of the inputs the next forward pass reads. All of them unless the
    /// operation selects among its inputs.
    ///
    /// # Errors
    /// If the selection that decides it has not been made.
    fn active_inputs(&self, n_inputs: usize) -> Result<Vec<usize>, NasError> {
        Ok((0..n_inputs).collect())
    }

    /// Multiply-accumulate count for one sample.
    ///
    /// # Errors
    fn macs(&self, _inputs: &[TensorShape]) -> Result<NasFloat, NasError> {
        Ok(0.)
    }
}

#[enum_dispatch(Operation)]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PhysicalOp {
    Input(Input),
    Conv(Conv),
    BatchNorm(BatchNorm),
    Activation(Activation),
    MaxPool(MaxPool),
    AvgPool(AvgPool),
    GlobalAvgPool(GlobalAvgPool),
    Collapse(Collapse),
    Identity(Identity),
    Zero(Zero),
    Merging(Merging),
    Linear(Linear),
    Dropout(Dropout),
    DropPath(DropPath),
    Interpolate(Interpolate),
    Sequential(Sequential),
    ConvLayer(ConvLayer),
    SepConv(SepConv),
    SeparableConvBn(SeparableConvBn),
    ReLUConvBN(ReLUConvBN),
    SEModule(SEModule),
    MBConvLayer(MBConvLayer),
    XceptionLayer(XceptionLayer),
    ResidualBlock(ResidualBlock),
    LinearLayer(LinearLayer),
    AuxiliaryHeadCifar(AuxiliaryHeadCifar),
    Aspp(Aspp),
    ConcatProjection(ConcatProjection),
    Decoder(Decoder),
    MixedOp(MixedOp),
    Join(Join),
}

impl PhysicalOp {
    /// Kind of the operation, as used to group latency profiles.
    pub fn kind(&self) -> &str {
        match self {
            Self::Input(_) => "Input",
            Self::Conv(_) => "Conv",
            Self::BatchNorm(_) => "BatchNorm",
            Self::Activation(_) => "Activation",
            Self::MaxPool(_) => "MaxPool",
            Self::AvgPool(_) => "AvgPool",
            Self::GlobalAvgPool(_) => "GlobalAvgPool",
            Self::Collapse(_) => "Collapse",
            Self::Identity(_) => "Identity",
            Self::Zero(_) => "Zero",
            Self::Merging(_) => "Merging",
            Self::Linear(_) => "Linear",
            Self::Dropout(_) => "Dropout",
            Self::DropPath(_) => "DropPath",
            Self::Interpolate(_) => "Interpolate",
            Self::Sequential(seq) => seq.label(),
            Self::ConvLayer(_) => "ConvLayer",
            Self::SepConv(_) => "SepConv",
            Self::SeparableConvBn(_) => "SeparableConvBn",
            Self::ReLUConvBN(_) => "ReLUConvBN",
            Self::SEModule(_) => "SEModule",
            Self::MBConvLayer(_) => "MBConvLayer",
            Self::XceptionLayer(_) => "XceptionLayer",
            Self::ResidualBlock(_) => "ResidualBlock",
            Self::LinearLayer(_) => "LinearLayer",
            Self::AuxiliaryHeadCifar(_) => "AuxiliaryHeadCifar",
            Self::Aspp(_) => "Aspp",
            Self::ConcatProjection(_) => "ConcatProjection",
            Self::Decoder(_) => "Decoder",
            Self::MixedOp(_) => "MixedOp",
            Self::Join(_) => "Join",
        }
    }

    /// Whether the operation chooses among candidates from architecture parameters.
    pub const fn is_selection(&self) -> bool {
        matches!(self, Self::MixedOp(_) | Self::Join(_))
    }
}
