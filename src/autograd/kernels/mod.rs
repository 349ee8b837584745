//! Forward and backward kernels of the tape primitives.
pub mod activation;
pub mod conv;
pub mod interpolate;
pub mod loss;
pub mod normalization;
pub mod pooling;

pub use activation::ActivationKind;
pub use conv::{conv2d_output_hw, window_output_size, Conv2dConfig};
pub use normalization::{BatchNormCache, BatchNormConfig};
pub use pooling::Pool2dConfig;
