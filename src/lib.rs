#![allow(clippy::must_use_candidate)]
//! Differentiable neural architecture search on `ndarray`.
//!
//! A search space is a [`graph::Graph`] of [`graph::PhysicalOp`]s in which
//! [`search::Join`] and [`search::MixedOp`] nodes choose among candidates from
//! architecture weights. [`search::SearchNet`] assembles the Zoph et al. space and
//! [`runner::DartsSearcher`] trains its network and architecture weights in
//! alternation.
extern crate ndarray;
extern crate rand;

pub mod autograd;
pub mod error;
pub mod graph;
pub mod io;
pub mod logging;
pub mod module;
pub mod runner;
pub mod search;
pub mod tensorshape;
pub mod util;

#[cfg(test)]
mod test_graphs;
#[cfg(test)]
mod test_util;

pub use error::NasError;
pub use tensorshape::TensorShape;

pub type NasFloat = f64;
