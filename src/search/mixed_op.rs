use super::selection::{inject_policy_gradient, probabilities, SelectionMode, SelectionState};
use crate::autograd::{Context, Initializer, ParameterSpec, ParameterStore, VarId};
use crate::graph::{Operation, PhysicalOp};
use crate::module::scoped;
use crate::tensorshape::TensorShape;
use crate::{NasError, NasFloat};
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// One input, N candidate operations, one output. In `full` mode the output is the
/// softmax-weighted sum of every candidate; otherwise only the active candidate runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MixedOp {
    name: String,
    ops: Vec<PhysicalOp>,
    state: SelectionState,
    alpha_key: String,
}

impl MixedOp {
    /// Architecture weights default to a zero vector under `<name>/join/alpha`.
    pub fn new<S: Into<String>>(
        name: S,
        ops: Vec<PhysicalOp>,
        mode: SelectionMode,
        alpha_key: Option<String>,
    ) -> Self {
        let name = name.into();
        let alpha_key = alpha_key.unwrap_or_else(|| scoped(&name, "join/alpha"));
        Self {
            name,
            ops,
            state: SelectionState::new(mode),
            alpha_key,
        }
    }

    pub fn ops(&self) -> &[PhysicalOp] {
        &self.ops
    }

    pub const fn state(&self) -> &SelectionState {
        &self.state
    }

    pub fn alpha_key(&self) -> &str {
        &self.alpha_key
    }

    pub fn set_mode(&mut self, mode: SelectionMode) {
        self.state.set_mode(mode);
    }

    fn alpha_spec(&self) -> ParameterSpec {
        ParameterSpec::weight(
            self.alpha_key.clone(),
            vec![self.ops.len()],
            Initializer::Constant(0.),
        )
    }

    fn active(&self) -> Result<usize, NasError> {
        self.state
            .active_index()
            .ok_or_else(|| NasError::selection_not_initialized(&self.name))
    }

    /// Chooses the active candidate and freezes the weights of every other one.
    ///
    /// # Errors
    /// In `full` mode or without candidates.
    pub fn update_active_index<R: Rng>(
        &mut self,
        store: &mut ParameterStore,
        rng: &mut R,
    ) -> Result<usize, NasError> {
        store.get_or_create(&self.alpha_spec())?;
        let probs = probabilities(store, &self.alpha_key)?;
        let index = self.state.select(probs.view(), rng)?;
        for (i, op) in self.ops.iter().enumerate() {
            for key in op.parameter_keys() {
                store.set_need_grad(&key, i == index);
            }
        }
        debug!("{}: selected candidate {} with p={:.3}", self.name, index, probs[index]);
        Ok(index)
    }

    /// Adds `scale * (one_hot(active) - softmax(alpha))` to the gradient of the
    /// architecture weights.
    ///
    /// # Errors
    pub fn inject_architecture_gradient(
        &self,
        store: &mut ParameterStore,
        scale: NasFloat,
    ) -> Result<(), NasError> {
        inject_policy_gradient(store, &self.alpha_key, self.active()?, scale)
    }
}

impl Operation for MixedOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        let mut shapes = self.ops.iter().map(|op| op.output_shape(inputs));
        let first = shapes.next().ok_or_else(|| {
            NasError::configuration(format!("{} has no candidate operations", self.name))
        })??;
        for shape in shapes {
            let shape = shape?;
            if !shape.is_compatible_with(&first) {
                return Err(NasError::shape_mismatch(format!(
                    "candidates of {} disagree: {} and {}",
                    self.name, first, shape
                )));
            }
        }
        Ok(first)
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        if self.state.mode().is_discrete() {
            let op = &self.ops[self.active()?];
            return op.forward(ctx, inputs);
        }
        let alpha = ctx.parameter(&self.alpha_spec())?;
        let probs = ctx.softmax(alpha)?;
        let outputs = self
            .ops
            .iter()
            .map(|op| op.forward(ctx, inputs))
            .collect::<Result<Vec<_>, _>>()?;
        ctx.weighted_sum(probs, &outputs)
    }

    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        std::iter::once(self.alpha_spec())
            .chain(self.ops.iter().flat_map(|op| op.parameter_specs()))
            .collect()
    }

    fn macs(&self, inputs: &[TensorShape]) -> Result<NasFloat, NasError> {
        if self.state.mode().is_discrete() {
            return self.ops[self.active()?].macs(inputs);
        }
        self.ops.iter().map(|op| op.macs(inputs)).sum()
    }
}
