//! Parameter-free operations.
use super::{single_input, single_shape};
use crate::autograd::{ActivationKind, Context, VarId};
use crate::graph::Operation;
use crate::tensorshape::TensorShape;
use crate::{NasError, NasFloat};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Placeholder for a value fed from outside the graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Input {
    name: String,
    shape: TensorShape,
}

impl Input {
    pub fn new<S: Into<String>>(name: S, shape: TensorShape) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }
}

impl Operation for Input {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, _inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        Ok(self.shape.clone())
    }

    fn forward(&self, _ctx: &mut Context, _inputs: &[VarId]) -> Result<VarId, NasError> {
        Err(NasError::invalid_state(format!(
            "input {} was not fed",
            self.name
        )))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Identity {
    name: String,
}

impl Identity {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }
}

impl Operation for Identity {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        single_shape(&self.name, inputs).map(Clone::clone)
    }

    fn forward(&self, _ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        single_input(&self.name, inputs)
    }
}

/// Outputs zeros shaped like the (optionally strided) input. Gradients do not flow
/// through it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Zero {
    name: String,
    stride: (usize, usize),
}

impl Zero {
    pub fn new<S: Into<String>>(name: S, stride: (usize, usize)) -> Self {
        Self {
            name: name.into(),
            stride: (stride.0.max(1), stride.1.max(1)),
        }
    }

    fn strided(&self, dims: &[usize]) -> Vec<usize> {
        let mut dims = dims.to_vec();
        if dims.len() == 4 {
            dims[2] = (dims[2] + self.stride.0 - 1) / self.stride.0;
            dims[3] = (dims[3] + self.stride.1 - 1) / self.stride.1;
        }
        dims
    }
}

impl Operation for Zero {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        let shape = single_shape(&self.name, inputs)?;
        if shape.rank() != 4 {
            return Ok(shape.clone());
        }
        let (h, w) = shape.spatial()?;
        let dims = self.strided(&[0, 0, h, w]);
        Ok(TensorShape::new(vec![
            shape[0],
            shape[1],
            Some(dims[2]),
            Some(dims[3]),
        ]))
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        let input = single_input(&self.name, inputs)?;
        let dims = self.strided(ctx.value(input).shape());
        Ok(ctx.input(ArrayD::zeros(IxDyn(&dims))))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    Concat,
    Add,
}

impl FromStr for MergeMode {
    type Err = NasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "concat" => Ok(Self::Concat),
            "add" => Ok(Self::Add),
            other => Err(NasError::configuration(format!(
                "merging mode {} is not supported",
                other
            ))),
        }
    }
}

/// Concatenates or sums its inputs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Merging {
    name: String,
    mode: MergeMode,
    axis: usize,
}

impl Merging {
    /// # Errors
    /// Unknown `mode`.
    pub fn new<S: Into<String>>(name: S, mode: &str, axis: usize) -> Result<Self, NasError> {
        Ok(Self {
            name: name.into(),
            mode: mode.parse()?,
            axis,
        })
    }

    pub fn concat<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            mode: MergeMode::Concat,
            axis: 1,
        }
    }

    pub const fn mode(&self) -> MergeMode {
        self.mode
    }
}

impl Operation for Merging {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        let first = inputs.first().ok_or_else(|| {
            NasError::configuration(format!("{} needs at least one input", self.name))
        })?;
        match self.mode {
            MergeMode::Add => {
                if let Some(bad) = inputs.iter().find(|s| !s.is_compatible_with(first)) {
                    return Err(NasError::shape_mismatch(format!(
                        "cannot add {} and {}",
                        first, bad
                    )));
                }
                Ok(first.clone())
            }
            MergeMode::Concat => {
                let mut dims = first.dims().to_vec();
                if self.axis >= dims.len() {
                    return Err(NasError::shape_mismatch(format!(
                        "concat axis {} for {}",
                        self.axis, first
                    )));
                }
                let mut total = 0;
                for shape in inputs {
                    let same_elsewhere = shape.rank() == dims.len()
                        && shape
                            .dims()
                            .iter()
                            .zip(first.dims().iter())
                            .enumerate()
                            .all(|(i, (a, b))| i == self.axis || i == 0 || a == b);
                    if !same_elsewhere {
                        return Err(NasError::shape_mismatch(format!(
                            "cannot concatenate {} and {} along axis {}",
                            first, shape, self.axis
                        )));
                    }
                    total += shape.extent(self.axis)?;
                }
                dims[self.axis] = Some(total);
                Ok(TensorShape::new(dims))
            }
        }
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        match (self.mode, inputs.len()) {
            (_, 1) => Ok(inputs[0]),
            (MergeMode::Concat, _) => ctx.concat(inputs, self.axis),
            (MergeMode::Add, _) => ctx.sum(inputs),
        }
    }
}

/// Drops the trailing unit axes of a `(N, C, 1, 1)` input.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Collapse {
    name: String,
}

impl Collapse {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }
}

impl Operation for Collapse {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        let shape = single_shape(&self.name, inputs)?;
        if shape.spatial()? != (1, 1) {
            return Err(NasError::shape_mismatch(format!(
                "cannot collapse {}",
                shape
            )));
        }
        Ok(TensorShape::new(vec![shape[0], shape[1]]))
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        let input = single_input(&self.name, inputs)?;
        let dims = ctx.value(input).shape().to_vec();
        ctx.reshape(input, &dims[..2])
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Activation {
    name: String,
    kind: ActivationKind,
}

impl Activation {
    pub fn new<S: Into<String>>(name: S, kind: ActivationKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn relu<S: Into<String>>(name: S) -> Self {
        Self::new(name, ActivationKind::Relu)
    }

    pub const fn kind(&self) -> ActivationKind {
        self.kind
    }
}

impl Operation for Activation {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        single_shape(&self.name, inputs).map(Clone::clone)
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        let input = single_input(&self.name, inputs)?;
        Ok(ctx.activation(input, self.kind))
    }
}

fn check_probability(name: &str, p: NasFloat) -> Result<NasFloat, NasError> {
    if (0. ..1.).contains(&p) {
        Ok(p)
    } else {
        Err(NasError::configuration(format!(
            "{}: drop probability {} outside [0, 1)",
            name, p
        )))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dropout {
    name: String,
    p: NasFloat,
}

impl Dropout {
    /// # Errors
    pub fn new<S: Into<String>>(name: S, p: NasFloat) -> Result<Self, NasError> {
        let name = name.into();
        let p = check_probability(&name, p)?;
        Ok(Self { name, p })
    }
}

impl Operation for Dropout {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        single_shape(&self.name, inputs).map(Clone::clone)
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        let input = single_input(&self.name, inputs)?;
        ctx.dropout(input, self.p)
    }
}

/// Zeroes whole samples during training; survivors are rescaled by `1 / (1 - p)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DropPath {
    name: String,
    p: NasFloat,
}

impl DropPath {
    /// # Errors
    pub fn new<S: Into<String>>(name: S, p: NasFloat) -> Result<Self, NasError> {
        let name = name.into();
        let p = check_probability(&name, p)?;
        Ok(Self { name, p })
    }
}

impl Operation for DropPath {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        single_shape(&self.name, inputs).map(Clone::clone)
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        let input = single_input(&self.name, inputs)?;
        ctx.drop_path(input, self.p)
    }
}

/// Bilinear resize to a fixed spatial extent, corners aligned.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Interpolate {
    name: String,
    output_hw: (usize, usize),
}

impl Interpolate {
    pub fn new<S: Into<String>>(name: S, output_hw: (usize, usize)) -> Self {
        Self {
            name: name.into(),
            output_hw,
        }
    }
}

impl Operation for Interpolate {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape, NasError> {
        let shape = single_shape(&self.name, inputs)?;
        shape.spatial()?;
        Ok(TensorShape::new(vec![
            shape[0],
            shape[1],
            Some(self.output_hw.0),
            Some(self.output_hw.1),
        ]))
    }

    fn forward(&self, ctx: &mut Context, inputs: &[VarId]) -> Result<VarId, NasError> {
        let input = single_input(&self.name, inputs)?;
        ctx.interpolate(input, self.output_hw)
    }

    fn macs(&self, inputs: &[TensorShape]) -> Result<NasFloat, NasError> {
        let c = single_shape(&self.name, inputs)?.channels()?;
        Ok((4 * c * self.output_hw.0 * self.output_hw.1) as NasFloat)
    }
}
