//! Bi-level search over a [`SearchModel`].
pub mod config;
pub mod data;
pub mod monitor;
mod searcher;

pub use config::{ArchGradientScaling, SearcherConfig};
pub use data::{Batch, DataSource, InMemoryDataSource};
pub use monitor::{AverageMeter, Monitor};
pub use searcher::{DartsSearcher, EpochSummary};

use crate::autograd::{Context, ParameterStore, VarId};
use crate::search::{ParameterPartition, SearchNet, SelectionMode};
use crate::{NasError, NasFloat};
use rand::rngs::StdRng;

/// What the searcher needs from a model with architecture parameters.
pub trait SearchModel {
    /// Creates every parameter of the model in `store`.
    ///
    /// # Errors
    fn initialize(&self, store: &mut ParameterStore) -> Result<(), NasError>;

    /// # Errors
    fn forward(&self, ctx: &mut Context, input: VarId) -> Result<VarId, NasError>;

    fn parameter_partition(&self) -> ParameterPartition;

    fn mode(&self) -> SelectionMode;

    /// # Errors
    fn update_active_indices(
        &mut self,
        store: &mut ParameterStore,
        rng: &mut StdRng,
    ) -> Result<(), NasError>;

    /// # Errors
    fn inject_architecture_gradients(
        &self,
        store: &mut ParameterStore,
        scale: NasFloat,
    ) -> Result<(), NasError>;
}

impl SearchModel for SearchNet {
    fn initialize(&self, store: &mut ParameterStore) -> Result<(), NasError> {
        SearchNet::initialize(self, store)
    }

    fn forward(&self, ctx: &mut Context, input: VarId) -> Result<VarId, NasError> {
        SearchNet::forward(self, ctx, input)
    }

    fn parameter_partition(&self) -> ParameterPartition {
        SearchNet::parameter_partition(self)
    }

    fn mode(&self) -> SelectionMode {
        SearchNet::mode(self)
    }

    fn update_active_indices(
        &mut self,
        store: &mut ParameterStore,
        rng: &mut StdRng,
    ) -> Result<(), NasError> {
        SearchNet::update_active_indices(self, store, rng)
    }

    fn inject_architecture_gradients(
        &self,
        store: &mut ParameterStore,
        scale: NasFloat,
    ) -> Result<(), NasError> {
        SearchNet::inject_architecture_gradients(self, store, scale)
    }
}
