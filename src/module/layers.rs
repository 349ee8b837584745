//! Composite layers of the mobile search spaces and their serialized configurations.
use super::segmentation::{AsppConfig, ConcatProjectionConfig, DecoderConfig};
use super::{
    scoped, single_input, single_shape, Activation, AvgPool, BatchNorm, Collapse, Conv,
    ConvParams, Dropout, Identity, Linear, Sequential,
};
use crate::autograd::{ActivationKind, Context, ParameterSpec, Pool2dConfig, VarId};
use crate::graph::{Operation, PhysicalOp};
use crate::tensorshape::TensorShape;
use crate::util::{make_divisible, min_divisible_value, same_padding2};
use crate::{NasError, NasFloat};
use serde::{Deserialize, Serialize};

/// Maps an activation name of a layer configuration to its kind. `none` means no
/// activation.
///
/// # Errors
/// Names other than `relu`, `relu6`, `h_swish` and `none`.
pub fn build_activation(name: &str) -> Result<Option<ActivationKind>, NasError> {
    match name {
        "relu" => Ok(Some(ActivationKind::Relu)),
        "relu6" => Ok(Some(ActivationKind::Relu6)),
        "h_swish" => Ok(Some(ActivationKind::HSwish)),
        "none" => Ok(None),
        other => Err(NasError::configuration(format!(
            "do not support activation {}",
            other
        ))),
    }
}

fn push_activation(ops: &mut Vec<PhysicalOp>, name: &str, act: &str) -> Result<(), NasError> {
    if let Some(kind) = build_activation(act)? {
        ops.push(Activation::new(scoped(name, "act"), kind).into());
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvLayerConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub dilation: (usize, usize),
    pub group: usize,
    pub with_bias: bool,
    pub use_bn: bool,
    pub act_func: String,
}

impl Default for ConvLayerConfig {
    fn default() -> Self {
        Self {
            in_channels: 0,
            out_channels: 0,
            kernel: (3, 3),
            stride: (1, 1),
            dilation: (1, 1),
            group: 1,
            with_bias: false,
            use_bn: true,
            act_func: "relu".to_string(),
        }
    }
}

/// Convolution with same padding, optionally followed by batch normalization and an
/// activation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConvLayer {
    name: String,
    config: ConvLayerConfig,
    body: Sequential,
}

impl ConvLayer {
    /// # Errors
    /// Even kernels, unknown activations, or channel counts the groups do not divide.
    pub fn new<S: Into<String>>(name: S, config: ConvLayerConfig) -> Result<Self, NasError> {
        let name = name.into();
        let c = &config;
        let pad = same_padding2(c.kernel, c.dilation)?;
        let mut ops: Vec<PhysicalOp> = vec![Conv::new(
            scoped(&name, "conv"),
            ConvParams::new(c.in_channels, c.out_channels, c.kernel)
                .with_stride(c.stride)
                .with_pad(pad)
                .with_dilation(c.dilation)
                .with_groups(c.group)
                .with_bias(c.with_bias),
        )?
        .into()];
        if c.use_bn {
            ops.push(BatchNorm::new(scoped(&name, "bn"), c.out_channels).into());
        }
        push_activation(&mut ops, &name, &c.act_func)?;
        let body = Sequential::new(name.clone(), "ConvLayer", ops);
        Ok(Self { name, config, body })
    }

    pub const fn config(&self) -> &ConvLayerConfig {
        &self.config
    }
}

delegate_to_body!(ConvLayer);

/// Depthwise `k x k` convolution followed by a pointwise `1 x 1` convolution, neither
/// with a bias.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SepConv {
    name: String,
    body: Sequential,
}

impl SepConv {
    /// # Errors
    pub fn new<S: Into<String>>(
        name: S,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        dilation: (usize, usize),
    ) -> Result<Self, NasError> {
        let name = name.into();
        let pad = same_padding2(kernel, dilation)?;
        let ops = vec![
            Conv::new(
                scoped(&name, "dw"),
                ConvParams::new(in_channels, in_channels, kernel)
                    .with_pad(pad)
                    .with_dilation(dilation)
                    .with_groups(in_channels),
            )?
            .into(),
            Conv::new(
                scoped(&name, "pw"),
                ConvParams::new(in_channels, out_channels, (1, 1)),
            )?
            .into(),
        ];
        let body = Sequential::new(name.clone(), "SepConv", ops);
        Ok(Self { name, body })
    }
}

delegate_to_body!(SepConv);

/// ReLU, convolution without a bias, then batch normalization. Without `affine` the
/// normalization keeps `gamma = 1` and `beta = 0`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReLUConvBN {
    name: String,
    body: Sequential,
}

impl ReLUConvBN {
    /// # Errors
    pub fn new<S: Into<String>>(
        name: S,
        params: ConvParams,
        affine: bool,
    ) -> Result<Self, NasError> {
        let name = name.into();
        let out_channels = params.out_channels;
        let bn = BatchNorm::new(scoped(&name, "bn"), out_channels);
        let bn = if affine { bn } else { bn.without_affine() };
        let ops = vec![
            Activation::new(scoped(&name, "relu"), ActivationKind::Relu).into(),
            Conv::new(scoped(&name, "conv"), params.with_bias(false))?.into(),
            bn.into(),
        ];
        let body = Sequential::new(name.clone(), "ReLUConvBN", ops);
        Ok(Self { name, body })
    }
}

delegate_to_body!(ReLUConvBN);

/// Auxiliary classifier on an `8 x 8` feature map: ReLU, `5 x 5` average pooling with
/// stride 3, `1 x 1` conv to 128 and `2 x 2` conv to 768 channels (each with BN and
/// ReLU), then a linear layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuxiliaryHeadCifar {
    name: String,
    n_classes: usize,
    body: Sequential,
}

impl AuxiliaryHeadCifar {
    const HIDDEN: usize = 128;
    const FEATURES: usize = 768;

    /// # Errors
    pub fn new<S: Into<String>>(
        name: S,
        channels: usize,
        n_classes: usize,
    ) -> Result<Self, NasError> {
        let name = name.into();
        let relu = |child: &str| -> PhysicalOp {
            Activation::new(scoped(&name, child), ActivationKind::Relu).into()
        };
        let ops: Vec<PhysicalOp> = vec![
            relu("relu"),
            AvgPool::new(
                scoped(&name, "pool"),
                Pool2dConfig::new((5, 5), (3, 3), (0, 0)),
            )
            .into(),
            Conv::new(
                scoped(&name, "conv_1"),
                ConvParams::new(channels, Self::HIDDEN, (1, 1)),
            )?
            .into(),
            BatchNorm::new(scoped(&name, "bn_1"), Self::HIDDEN).into(),
            relu("relu_1"),
            Conv::new(
                scoped(&name, "conv_2"),
                ConvParams::new(Self::HIDDEN, Self::FEATURES, (2, 2)),
            )?
            .into(),
            BatchNorm::new(scoped(&name, "bn_2"), Self::FEATURES).into(),
            relu("relu_2"),
            Collapse::new(scoped(&name, "collapse")).into(),
            Linear::new(scoped(&name, "classifier"), Self::FEATURES, n_classes, true).into(),
        ];
        let body = Sequential::new(name.clone(), "AuxiliaryHeadCifar", ops);
        Ok(Self {
            name,
            n_classes,
            body,
        })
    }

    pub const fn n_classes(&self) -> usize {
        self.n_classes
    }
}

delegate_to_body!(AuxiliaryHeadCifar);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparableConvBnConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub depth: usize,
    pub stride: (usize, usize),
    pub dilation: (usize, usize),
    pub with_bias: bool,
    pub act_func: String,
}

impl Default for SeparableConvBnConfig {
    fn default() -> Self {
        Self {
            in_channels: 0,
            out_channels: 0,
            depth: 0,
            stride: (1, 1),
            dilation: (1, 1),
            with_bias: false,
            act_func: "relu".to_string(),
        }
    }
}

/// `3 x 3` (dilated) grouped convolution to `out_channels`, then a pointwise convolution
/// to `depth`, each followed by batch normalization and the activation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeparableConvBn {
    name: String,
    config: SeparableConvBnConfig,
    body: Sequential,
}

impl SeparableConvBn {
    /// # Errors
    pub fn new<S: Into<String>>(name: S, config: SeparableConvBnConfig) -> Result<Self, NasError> {
        let name = name.into();
        let c = &config;
        let mut ops: Vec<PhysicalOp> = vec![
            Conv::new(
                scoped(&name, "dep_conv"),
                ConvParams::new(c.in_channels, c.out_channels, (3, 3))
                    .with_stride(c.stride)
                    .with_pad(c.dilation)
                    .with_dilation(c.dilation)
                    .with_groups(min_divisible_value(c.in_channels, c.out_channels))
                    .with_bias(c.with_bias),
            )?
            .into(),
            BatchNorm::new(scoped(&name, "bn1"), c.out_channels).into(),
        ];
        push_activation(&mut ops, &scoped(&name, "bn1"), &c.act_func)?;
        ops.push(
            Conv::new(
                scoped(&name, "point_conv"),
                ConvParams::new(c.out_channels, c.depth, (1, 1)),
            )?
            .into(),
        );
        ops.push(BatchNorm::new(scoped(&name, "bn2"), c.depth).into());
        push_activation(&mut ops, &scoped(&name, "bn2"), &c.act_func)?;
        let body = Sequential::new(name.clone(), "SeparableConvBn", ops);
        Ok(Self { name, config, body })
    }

    pub const fn config(&self) -> &SeparableConvBnConfig {
        &self.config
    }
}

delegate_to_body!(SeparableConvBn);

/// Squeeze-and-excitation: global pooling, a bottleneck of two `1 x 1` convolutions and
/// a hard-sigmoid gate that rescales every channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SEModule {
    name: String,
    channels: usize,
    reduce: Conv,
    expand: Conv,
}

impl SEModule {
    pub const REDUCTION: usize = 4;

    /// # Errors
    pub fn new<S: Into<String>>(name: S, channels: usize) -> Result<Self, NasError> {
        let name = name.into();
        let mid = make_divisible(channels as NasFloat / Self::REDUCTION as NasFloat, 8, None);
        let reduce = Conv::new(
            scoped(&name, "reduce"),
            ConvParams::new(channels, mid, (1, 1)).with_bias(true),
        )?;
        let expand = Conv::new(
            scoped(&name, "expand"),
            ConvParams::new(mid, channels, (1, 1)).with_bias(true),
        )?;
        Ok(Self {
            name,
            channels,
            reduce,
            expand,
        })
    }
}

impl Operation for SEModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        let shape = single_shape(&self.name, inputs)?;
        if shape.channels()? != self.channels {
            return Err(NasError::shape_mismatch(format!(
                "squeeze-and-excitation over {} channels got {}",
                self.channels, shape
            )));
        }
        Ok(shape.clone())
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        let x = single_input(&self.name, inputs)?;
        let y = ctx.global_avg_pool(x)?;
        let y = self.reduce.forward(ctx, &[y])?;
        let y = ctx.activation(y, ActivationKind::Relu);
        let y = self.expand.forward(ctx, &[y])?;
        let gate = ctx.activation(y, ActivationKind::HSigmoid);
        ctx.channel_scale(x, gate)
    }

    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        let mut specs = self.reduce.parameter_specs();
        specs.extend(self.expand.parameter_specs());
        specs
    }

    fn macs(&self, inputs: &[TensorShape]) -> Result<NasFloat, NasError> {
        let pooled = [TensorShape::new(vec![None, Some(self.channels), Some(1), Some(1)])];
        let reduced = self.reduce.output_shape(&pooled)?;
        Ok(self.reduce.macs(&pooled)?
            + self.expand.macs(&[reduced])?
            + single_shape(&self.name, inputs)?.num_elements_or(1) as NasFloat)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MBConvLayerConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub expand_ratio: usize,
    pub mid_channels: Option<usize>,
    pub act_func: String,
    pub use_se: bool,
    pub group: Option<usize>,
}

impl Default for MBConvLayerConfig {
    fn default() -> Self {
        Self {
            in_channels: 0,
            out_channels: 0,
            kernel: (3, 3),
            stride: (1, 1),
            expand_ratio: 6,
            mid_channels: None,
            act_func: "relu6".to_string(),
            use_se: false,
            group: None,
        }
    }
}

impl MBConvLayerConfig {
    pub fn feature_dim(&self) -> usize {
        self.mid_channels
            .unwrap_or(self.in_channels * self.expand_ratio)
    }
}

/// Inverted residual body: optional `1 x 1` expansion, depthwise convolution with
/// optional squeeze-and-excitation, then a linear `1 x 1` projection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MBConvLayer {
    name: String,
    config: MBConvLayerConfig,
    body: Sequential,
}

impl MBConvLayer {
    /// # Errors
    pub fn new<S: Into<String>>(name: S, config: MBConvLayerConfig) -> Result<Self, NasError> {
        let name = name.into();
        let c = &config;
        let feature = c.feature_dim();
        let mut ops: Vec<PhysicalOp> = vec![];

        if c.expand_ratio != 1 {
            let scope = scoped(&name, "inverted_bottleneck");
            ops.push(
                Conv::new(
                    scoped(&scope, "conv"),
                    ConvParams::new(c.in_channels, feature, (1, 1)),
                )?
                .into(),
            );
            ops.push(BatchNorm::new(scoped(&scope, "bn"), feature).into());
            push_activation(&mut ops, &scope, &c.act_func)?;
        }

        let scope = scoped(&name, "depth_conv");
        let depth_in = if c.expand_ratio == 1 {
            c.in_channels
        } else {
            feature
        };
        let group = c
            .group
            .map_or(feature, |g| min_divisible_value(feature, g));
        ops.push(
            Conv::new(
                scoped(&scope, "conv"),
                ConvParams::new(depth_in, feature, c.kernel)
                    .with_stride(c.stride)
                    .with_pad(same_padding2(c.kernel, (1, 1))?)
                    .with_groups(group),
            )?
            .into(),
        );
        ops.push(BatchNorm::new(scoped(&scope, "bn"), feature).into());
        push_activation(&mut ops, &scope, &c.act_func)?;
        if c.use_se {
            ops.push(SEModule::new(scoped(&scope, "se"), feature)?.into());
        }

        let scope = scoped(&name, "point_linear");
        ops.push(
            Conv::new(
                scoped(&scope, "conv"),
                ConvParams::new(feature, c.out_channels, (1, 1)),
            )?
            .into(),
        );
        ops.push(BatchNorm::new(scoped(&scope, "bn"), c.out_channels).into());

        let body = Sequential::new(name.clone(), "MBConvLayer", ops);
        Ok(Self { name, config, body })
    }

    pub const fn config(&self) -> &MBConvLayerConfig {
        &self.config
    }
}

delegate_to_body!(MBConvLayer);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XceptionLayerConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub expand_ratio: usize,
    pub mid_channels: Option<usize>,
    pub group: Option<usize>,
}

impl Default for XceptionLayerConfig {
    fn default() -> Self {
        Self {
            in_channels: 0,
            out_channels: 0,
            kernel: (3, 3),
            stride: (1, 1),
            expand_ratio: 6,
            mid_channels: None,
            group: None,
        }
    }
}

/// Two grouped `k x k` convolutions with batch normalization and ReLU, then a linear
/// `1 x 1` projection. Only the first convolution is strided.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct XceptionLayer {
    name: String,
    config: XceptionLayerConfig,
    body: Sequential,
}

impl XceptionLayer {
    /// # Errors
    pub fn new<S: Into<String>>(name: S, config: XceptionLayerConfig) -> Result<Self, NasError> {
        let name = name.into();
        let c = &config;
        let feature = c
            .mid_channels
            .unwrap_or(c.in_channels * c.expand_ratio);
        let pad = same_padding2(c.kernel, (1, 1))?;
        let group = c
            .group
            .map_or(feature, |g| min_divisible_value(feature, g));
        let scope = scoped(&name, "depth_conv");
        let mut ops: Vec<PhysicalOp> = vec![];
        for (i, (in_c, stride)) in [(c.in_channels, c.stride), (feature, (1, 1))]
            .into_iter()
            .enumerate()
        {
            let unit = scoped(&scope, &i.to_string());
            ops.push(
                Conv::new(
                    scoped(&unit, "conv"),
                    ConvParams::new(in_c, feature, c.kernel)
                        .with_stride(stride)
                        .with_pad(pad)
                        .with_groups(group),
                )?
                .into(),
            );
            ops.push(BatchNorm::new(scoped(&unit, "bn"), feature).into());
            ops.push(Activation::relu(scoped(&unit, "act")).into());
        }
        let scope = scoped(&name, "point_linear");
        ops.push(
            Conv::new(
                scoped(&scope, "conv"),
                ConvParams::new(feature, c.out_channels, (1, 1)),
            )?
            .into(),
        );
        ops.push(BatchNorm::new(scoped(&scope, "bn"), c.out_channels).into());
        let body = Sequential::new(name.clone(), "XceptionLayer", ops);
        Ok(Self { name, config, body })
    }
}

delegate_to_body!(XceptionLayer);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearLayerConfig {
    pub in_features: usize,
    pub out_features: usize,
    pub bias: bool,
    pub drop_rate: NasFloat,
}

impl Default for LinearLayerConfig {
    fn default() -> Self {
        Self {
            in_features: 0,
            out_features: 0,
            bias: true,
            drop_rate: 0.,
        }
    }
}

/// Dropout followed by a fully connected layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinearLayer {
    name: String,
    body: Sequential,
}

impl LinearLayer {
    /// # Errors
    pub fn new<S: Into<String>>(name: S, config: &LinearLayerConfig) -> Result<Self, NasError> {
        let name = name.into();
        let ops = vec![
            Dropout::new(scoped(&name, "dropout"), config.drop_rate)?.into(),
            Linear::new(
                scoped(&name, "linear"),
                config.in_features,
                config.out_features,
                config.bias,
            )
            .into(),
        ];
        let body = Sequential::new(name.clone(), "LinearLayer", ops);
        Ok(Self { name, body })
    }
}

delegate_to_body!(LinearLayer);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResidualBlockConfig {
    #[serde(alias = "mobile_inverted_conv")]
    pub conv: Option<Box<LayerConfig>>,
}

/// `conv(x) + x`. Without a convolution the block is the identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResidualBlock {
    name: String,
    conv: Option<Box<PhysicalOp>>,
    shortcut: Option<Identity>,
}

impl ResidualBlock {
    pub fn new<S: Into<String>>(name: S, conv: Option<PhysicalOp>, with_shortcut: bool) -> Self {
        let name = name.into();
        let shortcut = with_shortcut.then(|| Identity::new(scoped(&name, "shortcut")));
        Self {
            name,
            conv: conv.map(Box::new),
            shortcut,
        }
    }
}

impl Operation for ResidualBlock {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        let input = single_shape(&self.name, inputs)?;
        let conv = match &self.conv {
            None => return Ok(input.clone()),
            Some(conv) => conv.output_shape(inputs)?,
        };
        if self.shortcut.is_some() && !conv.is_compatible_with(input) {
            return Err(NasError::shape_mismatch(format!(
                "residual branch {} does not match shortcut {}",
                conv, input
            )));
        }
        Ok(conv)
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        let x = single_input(&self.name, inputs)?;
        match (&self.conv, &self.shortcut) {
            (None, _) => Ok(x),
            (Some(conv), None) => conv.forward(ctx, &[x]),
            (Some(conv), Some(shortcut)) => {
                let res = conv.forward(ctx, &[x])?;
                let short = shortcut.forward(ctx, &[x])?;
                ctx.add(res, short)
            }
        }
    }

    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        self.conv
            .as_ref()
            .map_or_else(Vec::new, |conv| conv.parameter_specs())
    }

    fn macs(&self, inputs: &[TensorShape]) -> Result<NasFloat, NasError> {
        self.conv.as_ref().map_or(Ok(0.), |conv| conv.macs(inputs))
    }
}

/// Serialized description of a layer, tagged by the layer name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum LayerConfig {
    ConvLayer(ConvLayerConfig),
    #[serde(alias = "MBInvertedConvLayer")]
    MBConvLayer(MBConvLayerConfig),
    XceptionLayer(XceptionLayerConfig),
    LinearLayer(LinearLayerConfig),
    ResidualBlock(ResidualBlockConfig),
    SeparableConvBn(SeparableConvBnConfig),
    Aspp(AsppConfig),
    ConcatProjection(ConcatProjectionConfig),
    Decoder(DecoderConfig),
}

impl LayerConfig {
    /// Builds the layer with its parameters scoped under `name`.
    ///
    /// # Errors
    /// Whatever the layer constructor rejects.
    pub fn build(&self, name: &str) -> Result<PhysicalOp, NasError> {
        Ok(match self {
            Self::ConvLayer(c) => ConvLayer::new(name, c.clone())?.into(),
            Self::MBConvLayer(c) => MBConvLayer::new(name, c.clone())?.into(),
            Self::XceptionLayer(c) => XceptionLayer::new(name, c.clone())?.into(),
            Self::LinearLayer(c) => LinearLayer::new(name, c)?.into(),
            Self::ResidualBlock(c) => {
                let conv = match &c.conv {
                    Some(conv) => Some(conv.build(&scoped(name, "conv"))?),
                    None => None,
                };
                ResidualBlock::new(name, conv, true).into()
            }
            Self::SeparableConvBn(c) => SeparableConvBn::new(name, c.clone())?.into(),
            Self::Aspp(c) => super::Aspp::new(name, c.clone())?.into(),
            Self::ConcatProjection(c) => super::ConcatProjection::new(name, c)?.into(),
            Self::Decoder(c) => super::Decoder::new(name, c.clone())?.into(),
        })
    }
}
