use super::config::SearcherConfig;
use super::data::DataSource;
use super::monitor::Monitor;
use super::SearchModel;
use crate::autograd::{Context, Optimizer, ParameterStore};
use crate::io::save_parameters;
use crate::search::{is_architecture_key, SelectionMode};
use crate::{NasError, NasFloat};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub metrics: BTreeMap<String, NasFloat>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Train,
    Valid,
}

impl Phase {
    const fn prefix(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Valid => "valid",
        }
    }

    fn owns(self, key: &str) -> bool {
        match self {
            Self::Train => !is_architecture_key(key),
            Self::Valid => is_architecture_key(key),
        }
    }
}

/// DARTS: alternates one update of the network weights on a training batch with one
/// update of the architecture weights on a validation batch. Each phase back-propagates
/// into its own half of the parameter partition only.
pub struct DartsSearcher<M, T, V> {
    model: M,
    store: ParameterStore,
    train_data: T,
    valid_data: V,
    train_optimizer: Optimizer,
    valid_optimizer: Optimizer,
    config: SearcherConfig,
    monitor: Monitor,
    rng: StdRng,
    started: bool,
}

impl<M, T, V> DartsSearcher<M, T, V>
where
    M: SearchModel,
    T: DataSource,
    V: DataSource,
{
    /// # Errors
    pub fn new(
        model: M,
        store: ParameterStore,
        train_data: T,
        valid_data: V,
        config: SearcherConfig,
    ) -> Result<Self, NasError> {
        config.validate()?;
        Ok(Self {
            model,
            store,
            train_data,
            valid_data,
            train_optimizer: Optimizer::new(config.train_optimizer.clone()),
            valid_optimizer: Optimizer::new(config.valid_optimizer.clone()),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            monitor: Monitor::default(),
            started: false,
        })
    }

    pub const fn model(&self) -> &M {
        &self.model
    }

    pub const fn store(&self) -> &ParameterStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ParameterStore {
        &mut self.store
    }

    pub const fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn into_parts(self) -> (M, ParameterStore) {
        (self.model, self.store)
    }

    /// Creates the parameters, hands the network weights to the train optimizer and the
    /// architecture weights to the valid optimizer, and makes the first selection in the
    /// discrete modes.
    ///
    /// # Errors
    pub fn callback_on_start(&mut self) -> Result<(), NasError> {
        self.model.initialize(&mut self.store)?;
        let partition = self.model.parameter_partition();
        info!(
            "search over {} network and {} architecture parameters",
            partition.network.len(),
            partition.architecture.len()
        );
        self.train_optimizer.set_parameters(partition.network);
        self.valid_optimizer.set_parameters(partition.architecture);
        if self.model.mode().is_discrete() {
            self.model
                .update_active_indices(&mut self.store, &mut self.rng)?;
        }
        self.started = true;
        Ok(())
    }

    fn ensure_started(&mut self) -> Result<(), NasError> {
        if self.started {
            Ok(())
        } else {
            self.callback_on_start()
        }
    }

    /// Forward, loss and backward of one micro-batch. Returns the unscaled loss.
    fn step(&mut self, phase: Phase, accum: usize) -> Result<NasFloat, NasError> {
        let batch = match phase {
            Phase::Train => self.train_data.next_batch()?,
            Phase::Valid => self.valid_data.next_batch()?,
        };
        let seed = self.rng.gen();
        let mut ctx = Context::new(&mut self.store, true, seed);
        let x = ctx.input(batch.inputs);
        let logits = self.model.forward(&mut ctx, x)?;
        let loss = ctx.cross_entropy(logits, &batch.targets, self.config.label_smoothing)?;
        ctx.check_finite(loss, &format!("{} loss", phase.prefix()))?;
        let value = ctx.value(loss).sum();
        let err = ctx.top1_error(logits, &batch.targets)?;
        ctx.backward(loss, 1. / accum as NasFloat, |key| phase.owns(key))?;

        let n = batch.targets.len();
        self.monitor
            .update(&format!("{}_loss", phase.prefix()), value, n);
        self.monitor.update(&format!("{}_err", phase.prefix()), err, n);
        Ok(value)
    }

    fn reselect(&mut self) -> Result<(), NasError> {
        if self.model.mode() == SelectionMode::Sample {
            self.model
                .update_active_indices(&mut self.store, &mut self.rng)?;
        }
        Ok(())
    }

    /// One update of the network weights over `accum_train` micro-batches.
    ///
    /// # Errors
    /// [`NasError::Numeric`] on a non-finite loss.
    pub fn train_on_batch(&mut self) -> Result<(), NasError> {
        self.ensure_started()?;
        self.reselect()?;
        self.train_optimizer.zero_grad(&mut self.store);
        let accum = self.config.accum_train;
        for _ in 0..accum {
            self.step(Phase::Train, accum)?;
        }
        self.train_optimizer.update(&mut self.store)
    }

    /// One update of the architecture weights over `accum_valid` micro-batches. In the
    /// discrete modes the architecture weights are not on the tape and receive the
    /// surrogate gradient of the current selection instead.
    ///
    /// # Errors
    /// [`NasError::Numeric`] on a non-finite loss.
    pub fn valid_on_batch(&mut self) -> Result<(), NasError> {
        self.ensure_started()?;
        self.reselect()?;
        self.valid_optimizer.zero_grad(&mut self.store);
        let accum = self.config.accum_valid;
        for _ in 0..accum {
            let loss = self.step(Phase::Valid, accum)?;
            if self.model.mode().is_discrete() {
                let scale = self.config.gradient_scaling.scale(loss, accum);
                self.model
                    .inject_architecture_gradients(&mut self.store, scale)?;
            }
        }
        self.valid_optimizer.update(&mut self.store)
    }

    /// Runs `epochs` epochs of `iters_per_epoch` steps. The valid phase is skipped
    /// during the warmup epochs.
    ///
    /// # Errors
    pub fn run(&mut self) -> Result<Vec<EpochSummary>, NasError> {
        self.ensure_started()?;
        let mut summaries = Vec::with_capacity(self.config.epochs);
        for epoch in 0..self.config.epochs {
            self.monitor.reset();
            let warmup = epoch < self.config.warmup_epochs;
            for iter in 0..self.config.iters_per_epoch {
                self.train_on_batch()?;
                if !warmup {
                    self.valid_on_batch()?;
                }
                debug!("epoch {} iter {} done", epoch, iter);
            }
            self.monitor.write(epoch);
            if let Some(path) = &self.config.checkpoint {
                save_parameters(path, &self.store)?;
                info!("checkpoint written to {}", path.display());
            }
            summaries.push(EpochSummary {
                epoch,
                metrics: self.monitor.averages(),
            });
        }
        Ok(summaries)
    }
}
