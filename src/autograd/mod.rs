//! Minimal reverse-mode differentiation over `ndarray`.
pub mod context;
pub mod kernels;
pub mod optimizer;
pub mod parameter;
pub mod tape;

pub use context::Context;
pub use kernels::{ActivationKind, BatchNormConfig, Conv2dConfig, Pool2dConfig};
pub use optimizer::{LrScheduler, Optimizer, OptimizerConfig, SolverConfig};
pub use parameter::{Initializer, Parameter, ParameterKind, ParameterSpec, ParameterStore};
pub use tape::{Gradients, Tape, TapeOp, VarId};
