use crate::autograd::{OptimizerConfig, SolverConfig};
use crate::{NasError, NasFloat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Multiplier of the surrogate architecture gradient in the discrete modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchGradientScaling {
    /// `one_hot - probs`, as if the log-probability itself were maximised.
    Unit,
    /// `loss * (one_hot - probs)`: selections that led to a high validation loss are
    /// made less likely.
    Loss,
}

impl Default for ArchGradientScaling {
    fn default() -> Self {
        Self::Unit
    }
}

impl ArchGradientScaling {
    /// Scale applied to one micro-batch.
    pub fn scale(self, loss: NasFloat, accum: usize) -> NasFloat {
        let per_batch = 1. / accum.max(1) as NasFloat;
        match self {
            Self::Unit => per_batch,
            Self::Loss => loss * per_batch,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearcherConfig {
    pub epochs: usize,
    pub iters_per_epoch: usize,
    /// Epochs at the start that only train the network weights.
    pub warmup_epochs: usize,
    pub accum_train: usize,
    pub accum_valid: usize,
    pub label_smoothing: NasFloat,
    pub train_optimizer: OptimizerConfig,
    pub valid_optimizer: OptimizerConfig,
    pub gradient_scaling: ArchGradientScaling,
    /// Parameters are written here after every epoch.
    pub checkpoint: Option<PathBuf>,
    pub seed: u64,
}

impl Default for SearcherConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            iters_per_epoch: 1,
            warmup_epochs: 0,
            accum_train: 1,
            accum_valid: 1,
            label_smoothing: 0.,
            train_optimizer: OptimizerConfig {
                learning_rate: 0.025,
                weight_decay: 3e-4,
                grad_clip: Some(5.),
                ..OptimizerConfig::default()
            },
            valid_optimizer: OptimizerConfig {
                solver: SolverConfig::Adam {
                    beta1: 0.5,
                    beta2: 0.999,
                    eps: 1e-8,
                },
                learning_rate: 3e-4,
                weight_decay: 1e-3,
                ..OptimizerConfig::default()
            },
            gradient_scaling: ArchGradientScaling::default(),
            checkpoint: None,
            seed: 0,
        }
    }
}

impl SearcherConfig {
    /// # Errors
    pub fn from_json(json: &str) -> Result<Self, NasError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, NasError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// # Errors
    pub fn validate(&self) -> Result<(), NasError> {
        if self.accum_train == 0 || self.accum_valid == 0 {
            return Err(NasError::configuration(format!(
                "accumulation over {} train and {} valid batches",
                self.accum_train, self.accum_valid
            )));
        }
        if !(0. ..1.).contains(&self.label_smoothing) {
            return Err(NasError::configuration(format!(
                "label smoothing {}",
                self.label_smoothing
            )));
        }
        if self.warmup_epochs > self.epochs {
            return Err(NasError::configuration(format!(
                "{} warmup epochs out of {}",
                self.warmup_epochs, self.epochs
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SearcherConfig::from_json(
            r#"{"epochs": 3, "warmup_epochs": 1, "gradient_scaling": "loss"}"#,
        )
        .unwrap();
        assert_eq!(config.epochs, 3);
        assert_eq!(config.accum_train, 1);
        assert_eq!(config.gradient_scaling, ArchGradientScaling::Loss);
        assert_eq!(config.valid_optimizer, SearcherConfig::default().valid_optimizer);
    }

    #[test]
    fn test_invalid_values() {
        assert!(SearcherConfig::from_json(r#"{"accum_valid": 0}"#).is_err());
        assert!(SearcherConfig::from_json(r#"{"label_smoothing": 1.0}"#).is_err());
        assert!(SearcherConfig::from_json(r#"{"epochs": 1, "warmup_epochs": 2}"#).is_err());
    }

    #[test]
    fn test_scaling() {
        assert_eq!(ArchGradientScaling::Unit.scale(3., 2), 0.5);
        assert_eq!(ArchGradientScaling::Loss.scale(3., 2), 1.5);
    }
}
