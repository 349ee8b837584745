//! Selection of one candidate among several from architecture weights.
use crate::autograd::ParameterStore;
use crate::{util, NasError, NasFloat};
use ndarray::{Array1, ArrayView1, Ix1};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    /// Softmax-weighted sum of every candidate.
    Full,
    /// One candidate drawn from the softmax distribution.
    Sample,
    /// The candidate with the largest architecture weight.
    Max,
}

impl Default for SelectionMode {
    fn default() -> Self {
        Self::Full
    }
}

impl SelectionMode {
    pub const fn is_discrete(self) -> bool {
        !matches!(self, Self::Full)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Sample => "sample",
            Self::Max => "max",
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionMode {
    type Err = NasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "sample" => Ok(Self::Sample),
            "max" => Ok(Self::Max),
            other => Err(NasError::configuration(format!(
                "selection mode {} is not supported",
                other
            ))),
        }
    }
}

/// Mode plus the candidate chosen for the next discrete forward pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionState {
    active_index: Option<usize>,
    mode: SelectionMode,
}

impl SelectionState {
    pub const fn new(mode: SelectionMode) -> Self {
        Self {
            active_index: None,
            mode,
        }
    }

    pub const fn mode(&self) -> SelectionMode {
        self.mode
    }

    pub const fn active_index(&self) -> Option<usize> {
        self.active_index
    }

    /// Changing the mode keeps the current choice.
    pub fn set_mode(&mut self, mode: SelectionMode) {
        self.mode = mode;
    }

    pub fn set_active_index(&mut self, index: usize) {
        self.active_index = Some(index);
    }

    /// Chooses a candidate from the softmax probabilities `probs` and stores the choice.
    ///
    /// # Errors
    /// In `Full` mode, or when there is nothing to choose from.
    pub fn select<R: Rng>(
        &mut self,
        probs: ArrayView1<NasFloat>,
        rng: &mut R,
    ) -> Result<usize, NasError> {
        if probs.is_empty() {
            return Err(NasError::invalid_state("selection among no candidates"));
        }
        let index = match self.mode {
            SelectionMode::Full => {
                return Err(NasError::invalid_state(
                    "full mode evaluates every candidate and has no active index",
                ))
            }
            SelectionMode::Sample => WeightedIndex::new(probs.iter())
                .map_err(|e| NasError::numeric(format!("cannot sample candidates: {}", e)))?
                .sample(rng),
            SelectionMode::Max => util::argmax(probs)?,
        };
        self.active_index = Some(index);
        Ok(index)
    }
}

/// REINFORCE surrogate gradient of the log-probability of `selected` with respect to
/// the logits: `scale * (one_hot(selected) - probs)`.
pub fn compute_policy_gradient(
    probs: ArrayView1<NasFloat>,
    selected: usize,
    scale: NasFloat,
) -> Array1<NasFloat> {
    Array1::from_shape_fn(probs.len(), |i| {
        let hot = if i == selected { 1. } else { 0. };
        scale * (hot - probs[i])
    })
}

/// Softmax of the architecture weights stored under `key`.
///
/// # Errors
pub fn probabilities(store: &ParameterStore, key: &str) -> Result<Array1<NasFloat>, NasError> {
    let alpha = store.data(key)?.view().into_dimensionality::<Ix1>()?;
    Ok(util::softmax(alpha))
}

/// Adds the policy gradient of the current selection to the gradient of `key`.
///
/// # Errors
pub fn inject_policy_gradient(
    store: &mut ParameterStore,
    key: &str,
    selected: usize,
    scale: NasFloat,
) -> Result<(), NasError> {
    let probs = probabilities(store, key)?;
    let grad = compute_policy_gradient(probs.view(), selected, scale).into_dyn();
    store.accumulate_grad(key, &grad)
}
