//! Cost estimation of single network modules.
use crate::autograd::ParameterKind;
use crate::graph::{Graph, NodeId, Operation};
use crate::tensorshape::TensorShape;
use crate::{NasError, NasFloat};
use serde::{Deserialize, Serialize};

/// Static description of one module, as handed to an estimator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleProfile {
    pub name: String,
    pub kind: String,
    pub input_shapes: Vec<TensorShape>,
    pub output_shape: TensorShape,
    pub macs: NasFloat,
    pub n_parameters: usize,
}

impl ModuleProfile {
    /// # Errors
    pub fn from_node(graph: &Graph, id: NodeId) -> Result<Self, NasError> {
        let node = graph.get_node(id)?;
        let input_shapes = graph.input_shapes(id)?;
        let op = node.operation();
        let n_parameters = op
            .parameter_specs()
            .iter()
            .filter(|s| s.kind == ParameterKind::Weight)
            .map(|s| s.shape.iter().product::<usize>())
            .sum();
        Ok(Self {
            name: node.name().to_string(),
            kind: op.kind().to_string(),
            macs: op.macs(&input_shapes)?,
            input_shapes,
            output_shape: node.shape().clone(),
            n_parameters,
        })
    }
}

pub trait LatencyEstimator {
    /// # Errors
    fn predict(&self, profile: &ModuleProfile) -> Result<NasFloat, NasError>;
}

/// Latency proportional to the multiply-accumulate count plus a fixed cost per module.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MacsEstimator {
    pub macs_per_second: NasFloat,
    pub overhead: NasFloat,
}

impl Default for MacsEstimator {
    fn default() -> Self {
        Self {
            macs_per_second: 1e9,
            overhead: 0.,
        }
    }
}

impl LatencyEstimator for MacsEstimator {
    fn predict(&self, profile: &ModuleProfile) -> Result<NasFloat, NasError> {
        if self.macs_per_second <= 0. {
            return Err(NasError::configuration(format!(
                "{} MACs per second",
                self.macs_per_second
            )));
        }
        Ok(self.overhead + profile.macs / self.macs_per_second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Conv, ConvParams};

    #[test]
    fn test_conv_profile() {
        let mut graph = Graph::default();
        let x = graph.add_input("x", TensorShape::nchw(2, 4, 4)).unwrap();
        let conv = graph
            .append(
                "conv",
                Conv::new("conv", ConvParams::new(2, 3, (1, 1)).with_bias(true)).unwrap(),
                &[x],
            )
            .unwrap();
        let profile = ModuleProfile::from_node(&graph, conv).unwrap();
        assert_eq!(profile.kind, "Conv");
        assert_eq!(profile.n_parameters, 2 * 3 + 3);
        assert_eq!(profile.macs, (16 * 3 * 2) as NasFloat);
        let estimator = MacsEstimator {
            macs_per_second: 96.,
            overhead: 0.5,
        };
        assert_eq!(estimator.predict(&profile).unwrap(), 1.5);
    }
}
