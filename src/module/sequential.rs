use super::{single_input, single_shape};
use crate::autograd::{Context, ParameterSpec, VarId};
use crate::graph::{Operation, PhysicalOp};
use crate::tensorshape::TensorShape;
use crate::{NasError, NasFloat};
use serde::{Deserialize, Serialize};

/// Chain of single-input operations. `label` names the kind of the chain (e.g.
/// `SepConv3x3`) for summaries and latency profiles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sequential {
    name: String,
    label: String,
    ops: Vec<PhysicalOp>,
}

impl Sequential {
    pub fn new<S: Into<String>, L: Into<String>>(name: S, label: L, ops: Vec<PhysicalOp>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            ops,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn ops(&self) -> &[PhysicalOp] {
        &self.ops
    }

    pub fn push<O: Into<PhysicalOp>>(&mut self, op: O) {
        self.ops.push(op.into());
    }

    /// Input shape of every operation followed by the output shape.
    ///
    /// # Errors
    pub fn shapes(&self, input: &TensorShape) -> Result<Vec<TensorShape>, NasError> {
        let mut shapes = vec![input.clone()];
        for op in &self.ops {
            let next = op
                .output_shape(std::slice::from_ref(&shapes[shapes.len() - 1]))
                .map_err(|e| match e {
                    NasError::ShapeMismatch { message } => {
                        NasError::shape_mismatch(format!("{}: {}", op.name(), message))
                    }
                    other => other,
                })?;
            shapes.push(next);
        }
        Ok(shapes)
    }
}

impl Operation for Sequential {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        let input = single_shape(&self.name, inputs)?;
        let mut shapes = self.shapes(input)?;
        shapes
            .pop()
            .ok_or_else(|| NasError::invalid_state(format!("{} has no shapes", self.name)))
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        self.ops
            .iter()
            .try_fold(single_input(&self.name, inputs)?, |x, op| op.forward(ctx, &[x]))
    }

    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        self.ops.iter().flat_map(|op| op.parameter_specs()).collect()
    }

    fn macs(&self, inputs: &[TensorShape]) -> Result<NasFloat, NasError> {
        let shapes = self.shapes(single_shape(&self.name, inputs)?)?;
        self.ops
            .iter()
            .zip(shapes.iter())
            .map(|(op, shape)| op.macs(std::slice::from_ref(shape)))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::ParameterStore;
    use crate::module::{Activation, BatchNorm, Conv, ConvParams};
    use ndarray::{ArrayD, IxDyn};

    fn conv_bn_relu() -> Sequential {
        Sequential::new(
            "block",
            "ConvBnRelu",
            vec![
                Conv::new("block/conv", ConvParams::new(3, 4, (3, 3)).with_pad((1, 1)))
                    .unwrap()
                    .into(),
                BatchNorm::new("block/bn", 4).into(),
                Activation::relu("block/relu").into(),
            ],
        )
    }

    #[test]
    fn test_chain_shape_and_keys() {
        let seq = conv_bn_relu();
        assert_eq!(
            seq.output_shape(&[TensorShape::nchw(3, 5, 5)]).unwrap(),
            TensorShape::nchw(4, 5, 5)
        );
        assert_eq!(seq.parameter_keys().len(), 5);
        let err = seq.output_shape(&[TensorShape::nchw(2, 5, 5)]).unwrap_err();
        assert!(format!("{}", err).contains("block/conv"));
    }

    #[test]
    fn test_forward_is_non_negative() {
        let seq = conv_bn_relu();
        let mut store = ParameterStore::new(5);
        let mut ctx = Context::new(&mut store, true, 0);
        let x = ctx.input(ArrayD::from_shape_fn(IxDyn(&[2, 3, 5, 5]), |i| {
            (i[0] + i[1] * 3 + i[2] * i[3]) as f64 * 0.1 - 0.5
        }));
        let y = seq.forward(&mut ctx, &[x]).unwrap();
        assert_eq!(ctx.value(y).shape(), &[2, 4, 5, 5]);
        assert!(ctx.value(y).iter().all(|&v| v >= 0.));
    }
}
