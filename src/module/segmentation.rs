//! Encoder head and decoder of the DeepLabV3+ style segmentation space.
use super::{
    scoped, single_input, single_shape, Activation, BatchNorm, Conv, ConvParams, GlobalAvgPool,
    Sequential,
};
use crate::autograd::{Context, ParameterSpec, VarId};
use crate::graph::{Operation, PhysicalOp};
use crate::tensorshape::TensorShape;
use crate::{NasError, NasFloat};
use serde::{Deserialize, Serialize};

fn conv_bn_relu(
    name: &str,
    in_channels: usize,
    out_channels: usize,
) -> Result<Vec<PhysicalOp>, NasError> {
    Ok(vec![
        Conv::new(
            scoped(name, "conv"),
            ConvParams::new(in_channels, out_channels, (1, 1)),
        )?
        .into(),
        BatchNorm::new(scoped(name, "bn"), out_channels).into(),
        Activation::relu(scoped(name, "relu")).into(),
    ])
}

/// Depthwise `3 x 3` convolution dilated by `rate` and a pointwise convolution to
/// `depth`, each followed by batch normalization and ReLU.
fn separable_conv_with_bn(
    name: &str,
    in_channels: usize,
    depth: usize,
    rate: usize,
) -> Result<Sequential, NasError> {
    let dw = scoped(name, "depthwise");
    let pw = scoped(name, "pointwise");
    let mut ops: Vec<PhysicalOp> = vec![
        Conv::new(
            scoped(&dw, "conv"),
            ConvParams::new(in_channels, in_channels, (3, 3))
                .with_pad((rate, rate))
                .with_dilation((rate, rate))
                .with_groups(in_channels),
        )?
        .into(),
        BatchNorm::new(scoped(&dw, "bn"), in_channels).into(),
        Activation::relu(scoped(&dw, "relu")).into(),
    ];
    ops.extend(conv_bn_relu(&pw, in_channels, depth)?);
    Ok(Sequential::new(name, "SeparableConvWithBn", ops))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsppConfig {
    pub in_channels: usize,
    pub depth: usize,
    pub output_stride: usize,
    pub atrous_rates: [usize; 3],
}

impl Default for AsppConfig {
    fn default() -> Self {
        Self {
            in_channels: 0,
            depth: 256,
            output_stride: 16,
            atrous_rates: [6, 12, 18],
        }
    }
}

/// Atrous spatial pyramid pooling. Concatenates, in order, the image pooling branch,
/// a `1 x 1` branch and three dilated separable branches, giving `5 * depth` channels.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Aspp {
    name: String,
    config: AsppConfig,
    image_pooling: Sequential,
    branches: Vec<Sequential>,
}

impl Aspp {
    /// # Errors
    /// An output stride that does not divide 16.
    pub fn new<S: Into<String>>(name: S, config: AsppConfig) -> Result<Self, NasError> {
        let name = name.into();
        let c = &config;
        if c.output_stride == 0 || 16 % c.output_stride != 0 {
            return Err(NasError::configuration(format!(
                "{}: output stride {} does not divide 16",
                name, c.output_stride
            )));
        }
        let factor = 16 / c.output_stride;

        let pool_scope = scoped(&name, "image_pooling");
        let mut pool_ops: Vec<PhysicalOp> =
            vec![GlobalAvgPool::new(scoped(&pool_scope, "pool")).into()];
        pool_ops.extend(conv_bn_relu(&pool_scope, c.in_channels, c.depth)?);
        let image_pooling = Sequential::new(pool_scope, "ImagePooling", pool_ops);

        let aspp0 = scoped(&name, "aspp0");
        let mut branches = vec![Sequential::new(
            aspp0.clone(),
            "ConvBnRelu",
            conv_bn_relu(&aspp0, c.in_channels, c.depth)?,
        )];
        for (i, rate) in c.atrous_rates.iter().enumerate() {
            branches.push(separable_conv_with_bn(
                &scoped(&name, &format!("aspp{}", i + 1)),
                c.in_channels,
                c.depth,
                factor * rate,
            )?);
        }
        Ok(Self {
            name,
            config,
            image_pooling,
            branches,
        })
    }

    pub const fn out_channels(&self) -> usize {
        5 * self.config.depth
    }
}

impl Operation for Aspp {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        let shape = single_shape(&self.name, inputs)?;
        for branch in &self.branches {
            branch.output_shape(inputs)?;
        }
        Ok(TensorShape::new(vec![
            shape[0],
            Some(self.out_channels()),
            shape[2],
            shape[3],
        ]))
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        let x = single_input(&self.name, inputs)?;
        let dims = ctx.value(x).shape().to_vec();
        let pooled = self.image_pooling.forward(ctx, &[x])?;
        let mut outputs = vec![ctx.interpolate(pooled, (dims[2], dims[3]))?];
        for branch in &self.branches {
            outputs.push(branch.forward(ctx, &[x])?);
        }
        ctx.concat(&outputs, 1)
    }

    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        self.image_pooling
            .parameter_specs()
            .into_iter()
            .chain(self.branches.iter().flat_map(|b| b.parameter_specs()))
            .collect()
    }

    fn macs(&self, inputs: &[TensorShape]) -> Result<NasFloat, NasError> {
        let mut total = self.image_pooling.macs(inputs)?;
        for branch in &self.branches {
            total += branch.macs(inputs)?;
        }
        Ok(total)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcatProjectionConfig {
    pub in_channels: usize,
    pub out_channels: usize,
}

impl Default for ConcatProjectionConfig {
    fn default() -> Self {
        Self {
            in_channels: 0,
            out_channels: 256,
        }
    }
}

/// Reduces the concatenated pyramid to `out_channels`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConcatProjection {
    name: String,
    body: Sequential,
}

impl ConcatProjection {
    /// # Errors
    pub fn new<S: Into<String>>(name: S, config: &ConcatProjectionConfig) -> Result<Self, NasError> {
        let name = name.into();
        let scope = scoped(&name, "concat_projection");
        let body = Sequential::new(
            name.clone(),
            "ConcatProjection",
            conv_bn_relu(&scope, config.in_channels, config.out_channels)?,
        );
        Ok(Self { name, body })
    }
}

delegate_to_body!(ConcatProjection);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub in_channels: usize,
    pub low_level_channels: usize,
    pub n_classes: usize,
    pub image_hw: (usize, usize),
    pub projection_channels: usize,
    pub decoder_channels: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            in_channels: 256,
            low_level_channels: 0,
            n_classes: 0,
            image_hw: (0, 0),
            projection_channels: 48,
            decoder_channels: 256,
        }
    }
}

/// Upsamples the encoder output to the low-level feature, fuses both and predicts
/// per-pixel logits at the image resolution. Inputs: `[encoder_output, low_level_feature]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Decoder {
    name: String,
    config: DecoderConfig,
    projection: Sequential,
    convs: Vec<Sequential>,
    logits: Conv,
}

impl Decoder {
    /// # Errors
    pub fn new<S: Into<String>>(name: S, config: DecoderConfig) -> Result<Self, NasError> {
        let name = name.into();
        let c = &config;
        let projection = Sequential::new(
            scoped(&name, "feature_projection0"),
            "ConvBnRelu",
            conv_bn_relu(
                &scoped(&name, "feature_projection0"),
                c.low_level_channels,
                c.projection_channels,
            )?,
        );
        let convs = vec![
            separable_conv_with_bn(
                &scoped(&name, "decoder_conv0"),
                c.in_channels + c.projection_channels,
                c.decoder_channels,
                1,
            )?,
            separable_conv_with_bn(
                &scoped(&name, "decoder_conv1"),
                c.decoder_channels,
                c.decoder_channels,
                1,
            )?,
        ];
        let logits = Conv::new(
            scoped(&name, "logits/affine"),
            ConvParams::new(c.decoder_channels, c.n_classes, (1, 1)).with_bias(true),
        )?;
        Ok(Self {
            name,
            config,
            projection,
            convs,
            logits,
        })
    }

    fn low_level_hw(&self, inputs: &[TensorShape]) -> Result<(usize, usize), NasError> {
        match inputs {
            [encoder, low] => {
                if encoder.channels()? != self.config.in_channels {
                    return Err(NasError::shape_mismatch(format!(
                        "decoder expects {} encoder channels, got {}",
                        self.config.in_channels, encoder
                    )));
                }
                self.projection.output_shape(std::slice::from_ref(low))?;
                low.spatial()
            }
            _ => Err(NasError::configuration(format!(
                "{} takes the encoder output and a low-level feature",
                self.name
            ))),
        }
    }
}

impl Operation for Decoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        self.low_level_hw(inputs)?;
        Ok(TensorShape::new(vec![
            inputs[0][0],
            Some(self.config.n_classes),
            Some(self.config.image_hw.0),
            Some(self.config.image_hw.1),
        ]))
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        let (encoder, low) = match inputs {
            [encoder, low] => (*encoder, *low),
            _ => {
                return Err(NasError::invalid_state(format!(
                    "{} takes two inputs, got {}",
                    self.name,
                    inputs.len()
                )))
            }
        };
        let low_dims = ctx.value(low).shape().to_vec();
        let upsampled = ctx.interpolate(encoder, (low_dims[2], low_dims[3]))?;
        let projected = self.projection.forward(ctx, &[low])?;
        let mut h = ctx.concat(&[upsampled, projected], 1)?;
        for conv in &self.convs {
            h = conv.forward(ctx, &[h])?;
        }
        let h = self.logits.forward(ctx, &[h])?;
        ctx.interpolate(h, self.config.image_hw)
    }

    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        self.projection
            .parameter_specs()
            .into_iter()
            .chain(self.convs.iter().flat_map(|c| c.parameter_specs()))
            .chain(self.logits.parameter_specs())
            .collect()
    }

    fn macs(&self, inputs: &[TensorShape]) -> Result<NasFloat, NasError> {
        let (h, w) = self.low_level_hw(inputs)?;
        let mut shape = TensorShape::new(vec![
            None,
            Some(self.config.in_channels + self.config.projection_channels),
            Some(h),
            Some(w),
        ]);
        let mut total = self.projection.macs(&inputs[1..])?;
        for conv in &self.convs {
            total += conv.macs(std::slice::from_ref(&shape))?;
            shape = conv.output_shape(std::slice::from_ref(&shape))?;
        }
        Ok(total + self.logits.macs(&[shape])?)
    }
}
