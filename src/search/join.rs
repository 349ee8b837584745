use super::selection::{inject_policy_gradient, probabilities, SelectionMode, SelectionState};
use crate::autograd::{Context, Initializer, ParameterSpec, ParameterStore, VarId};
use crate::graph::Operation;
use crate::module::scoped;
use crate::tensorshape::TensorShape;
use crate::{util, NasError, NasFloat};
use log::debug;
use ndarray::Array1;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Combines K parent nodes. In `full` mode the output is the softmax-weighted sum of
/// the parents; in a discrete mode exactly one parent passes through and only that
/// parent is reported as an active input, so the others are never evaluated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Join {
    name: String,
    n_parents: usize,
    state: SelectionState,
    alpha_key: String,
}

impl Join {
    /// The join lives under `<scope>/join`. Without `shared` the weights are a zero
    /// vector under `<scope>/join/alpha`; with it, the weights of another join.
    pub fn new(
        scope: &str,
        n_parents: usize,
        mode: SelectionMode,
        shared: Option<String>,
    ) -> Self {
        let name = scoped(scope, "join");
        let alpha_key = shared.unwrap_or_else(|| scoped(&name, "alpha"));
        Self {
            name,
            n_parents,
            state: SelectionState::new(mode),
            alpha_key,
        }
    }

    pub const fn n_parents(&self) -> usize {
        self.n_parents
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
            vec![self.n_parents],
            Initializer::Constant(0.),
        )
    }

    fn active(&self) -> Result<usize, NasError> {
        self.state
            .active_index()
            .ok_or_else(|| NasError::selection_not_initialized(&self.name))
    }

    /// # Errors
    pub fn probabilities(&self, store: &mut ParameterStore) -> Result<Array1<NasFloat>, NasError> {
        store.get_or_create(&self.alpha_spec())?;
        probabilities(store, &self.alpha_key)
    }

    /// The most probable parent and its probability.
    ///
    /// # Errors
    pub fn selection(&self, store: &mut ParameterStore) -> Result<(usize, NasFloat), NasError> {
        let probs = self.probabilities(store)?;
        let index = util::argmax(probs.view())?;
        Ok((index, probs[index]))
    }

    /// Chooses the parent that passes through. Freezing the parents themselves is left
    /// to the owner of the graph.
    ///
    /// # Errors
    /// In `full` mode or without parents.
    pub fn update_active_index<R: Rng>(
        &mut self,
        store: &mut ParameterStore,
        rng: &mut R,
    ) -> Result<usize, NasError> {
        let probs = self.probabilities(store)?;
        let index = self.state.select(probs.view(), rng)?;
        debug!("{}: selected parent {} with p={:.3}", self.name, index, probs[index]);
        Ok(index)
    }

    /// Selects `index` without consulting the weights.
    pub fn set_active_index(&mut self, index: usize) {
        self.state.set_active_index(index);
    }

    /// # Errors
    pub fn inject_architecture_gradient(
        &self,
        store: &mut ParameterStore,
        scale: NasFloat,
    ) -> Result<(), NasError> {
        inject_policy_gradient(store, &self.alpha_key, self.active()?, scale)
    }
}

impl Operation for Join {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        if inputs.len() != self.n_parents || inputs.is_empty() {
            return Err(NasError::configuration(format!(
                "{} joins {} parents, got {}",
                self.name,
                self.n_parents,
                inputs.len()
            )));
        }
        if let Some(bad) = inputs.iter().find(|s| !s.is_compatible_with(&inputs[0])) {
            return Err(NasError::shape_mismatch(format!(
                "cannot join {} and {}",
                inputs[0], bad
            )));
        }
        Ok(inputs[0].clone())
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        if self.state.mode().is_discrete() {
            return match inputs {
                [selected] => Ok(*selected),
                _ => Err(NasError::invalid_state(format!(
                    "{} passes one parent through, got {}",
                    self.name,
                    inputs.len()
                ))),
            };
        }
        let alpha = ctx.parameter(&self.alpha_spec())?;
        let probs = ctx.softmax(alpha)?;
        ctx.weighted_sum(probs, inputs)
    }

    fn parameter_specs(&self) -> Vec<ParameterSpec> {
        vec![self.alpha_spec()]
    }

    fn active_inputs(&self, n_inputs: usize) -> Result<Vec<usize>, NasError> {
        if self.state.mode().is_discrete() {
            Ok(vec![self.active()?])
        } else {
            Ok((0..n_inputs).collect())
        }
    }

    fn macs(&self, inputs: &[TensorShape]) -> Result<NasFloat, NasError> {
        if self.state.mode().is_discrete() {
            return Ok(0.);
        }
        let n = inputs.first().map_or(0, |s| s.num_elements_or(1));
        Ok((n * inputs.len()) as NasFloat)
    }
}
