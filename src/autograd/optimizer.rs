//! First-order solvers over a subset of a [`ParameterStore`].
use super::parameter::ParameterStore;
use crate::{NasError, NasFloat};
use log::debug;
use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::PI;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SolverConfig {
    Sgd,
    Momentum {
        momentum: NasFloat,
    },
    Adam {
        beta1: NasFloat,
        beta2: NasFloat,
        eps: NasFloat,
    },
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self::Momentum { momentum: 0.9 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LrScheduler {
    Constant,
    /// Multiplies the rate by `gamma` every `step_size` updates.
    Step { step_size: usize, gamma: NasFloat },
    /// Cosine annealing from the base rate to `min_lr` over `total_steps` updates.
    Cosine { total_steps: usize, min_lr: NasFloat },
}

impl Default for LrScheduler {
    fn default() -> Self {
        Self::Constant
    }
}

impl LrScheduler {
    pub fn learning_rate(&self, base: NasFloat, step: usize) -> NasFloat {
        match *self {
            Self::Constant => base,
            Self::Step { step_size, gamma } => {
                base * gamma.powi((step / step_size.max(1)) as i32)
            }
            Self::Cosine {
                total_steps,
                min_lr,
            } => {
                let t = (step.min(total_steps) as NasFloat) / total_steps.max(1) as NasFloat;
                min_lr + (base - min_lr) * 0.5 * (1. + (PI * t).cos())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub solver: SolverConfig,
    pub learning_rate: NasFloat,
    pub weight_decay: NasFloat,
    /// Rescales the gradients when their global L2 norm exceeds this value.
    pub grad_clip: Option<NasFloat>,
    pub lr_scheduler: LrScheduler,
    /// Keep per-parameter solver state across `set_parameters` calls.
    pub retain_state: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            solver: SolverConfig::default(),
            learning_rate: 0.025,
            weight_decay: 0.,
            grad_clip: None,
            lr_scheduler: LrScheduler::default(),
            retain_state: true,
        }
    }
}

#[derive(Clone, Debug)]
enum SolverState {
    Momentum { velocity: ArrayD<NasFloat> },
    Adam { m: ArrayD<NasFloat>, v: ArrayD<NasFloat>, t: i32 },
}

#[derive(Clone, Debug)]
pub struct Optimizer {
    config: OptimizerConfig,
    keys: Vec<String>,
    state: HashMap<String, SolverState>,
    step: usize,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            keys: vec![],
            state: HashMap::new(),
            step: 0,
        }
    }

    pub const fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub const fn num_updates(&self) -> usize {
        self.step
    }

    pub fn learning_rate(&self) -> NasFloat {
        self.config
            .lr_scheduler
            .learning_rate(self.config.learning_rate, self.step)
    }

    /// Replaces the set of parameters this optimizer updates.
    pub fn set_parameters<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        if self.config.retain_state {
            let keys = &self.keys;
            self.state.retain(|k, _| keys.contains(k));
        } else {
            self.state.clear();
        }
        debug!("optimizer holds {} parameters", self.keys.len());
    }

    pub fn clear_parameters(&mut self) {
        self.keys.clear();
        self.state.clear();
    }

    pub fn zero_grad(&self, store: &mut ParameterStore) {
        for key in &self.keys {
            if let Some(p) = store.get_mut(key) {
                p.grad.fill(0.);
            }
        }
    }

    /// One solver step over the held parameters. Frozen parameters and buffers are skipped.
    ///
    /// # Errors
    /// If a held key is missing from `store`.
    pub fn update(&mut self, store: &mut ParameterStore) -> Result<(), NasError> {
        let lr = self.learning_rate();
        let mut trainable = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            let p = store
                .get(key)
                .ok_or_else(|| NasError::invalid_state(format!("parameter {} does not exist", key)))?;
            if p.is_trainable() {
                trainable.push(key.clone());
            }
        }

        let clip_scale = match self.config.grad_clip {
            Some(max_norm) => {
                let norm = trainable
                    .iter()
                    .filter_map(|k| store.get(k))
                    .map(|p| p.grad.fold(0., |acc, g| acc + g * g))
                    .sum::<NasFloat>()
                    .sqrt();
                if norm > max_norm && norm > 0. {
                    max_norm / norm
                } else {
                    1.
                }
            }
            None => 1.,
        };

        for key in &trainable {
            let p = match store.get_mut(key) {
                Some(p) => p,
                None => continue,
            };
            let mut grad = &p.grad * clip_scale;
            if self.config.weight_decay != 0. {
                grad.scaled_add(self.config.weight_decay, &p.data);
            }
            match self.config.solver {
                SolverConfig::Sgd => p.data.scaled_add(-lr, &grad),
                SolverConfig::Momentum { momentum } => {
                    let state = self
                        .state
                        .entry(key.clone())
                        .or_insert_with(|| SolverState::Momentum {
                            velocity: ArrayD::zeros(grad.raw_dim()),
                        });
                    if let SolverState::Momentum { velocity } = state {
                        Zip::from(&mut *velocity)
                            .and(&grad)
                            .for_each(|v, &g| *v = momentum * *v - lr * g);
                        p.data += &*velocity;
                    }
                }
                SolverConfig::Adam { beta1, beta2, eps } => {
                    let state = self
                        .state
                        .entry(key.clone())
                        .or_insert_with(|| SolverState::Adam {
                            m: ArrayD::zeros(grad.raw_dim()),
                            v: ArrayD::zeros(grad.raw_dim()),
                            t: 0,
                        });
                    if let SolverState::Adam { m, v, t } = state {
                        *t += 1;
                        let bias1 = 1. - beta1.powi(*t);
                        let bias2 = 1. - beta2.powi(*t);
                        Zip::from(&mut p.data)
                            .and(&mut *m)
                            .and(&mut *v)
                            .and(&grad)
                            .for_each(|w, m, v, &g| {
                                *m = beta1 * *m + (1. - beta1) * g;
                                *v = beta2 * *v + (1. - beta2) * g * g;
                                *w -= lr * (*m / bias1) / ((*v / bias2).sqrt() + eps);
                            });
                    }
                }
            }
        }
        self.step += 1;
        Ok(())
    }
}
