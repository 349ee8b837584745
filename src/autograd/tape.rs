//! Reverse-mode tape over dynamically shaped arrays.
//!
//! Every value computed during a forward pass is pushed as a node together with the
//! operation that produced it. `backward` walks the nodes in reverse push order, which
//! is a valid reverse topological order because a node can only refer to earlier nodes.
use super::kernels::conv::conv2d_backward;
use super::kernels::interpolate::bilinear_backward;
use super::kernels::normalization::batch_norm_backward;
use super::kernels::pooling::{avg_pool2d_backward, global_avg_pool_backward, max_pool2d_backward};
use super::kernels::{ActivationKind, BatchNormCache, Conv2dConfig, Pool2dConfig};
use crate::{NasError, NasFloat};
use ndarray::{Array2, ArrayD, Axis, Ix1, Ix2, Ix4, IxDyn, Slice};
use std::collections::BTreeMap;

pub type VarId = usize;

#[derive(Clone, Debug)]
pub enum TapeOp {
    Leaf,
    Parameter {
        key: String,
    },
    Add {
        lhs: VarId,
        rhs: VarId,
    },
    Sum {
        inputs: Vec<VarId>,
    },
    Scale {
        input: VarId,
        factor: NasFloat,
    },
    /// `sum_i weights[i] * inputs[i]` with a 1-D `weights` variable.
    WeightedSum {
        weights: VarId,
        inputs: Vec<VarId>,
    },
    Softmax {
        input: VarId,
    },
    Conv2d {
        input: VarId,
        weight: VarId,
        bias: Option<VarId>,
        config: Conv2dConfig,
    },
    BatchNorm {
        input: VarId,
        gamma: VarId,
        beta: VarId,
        cache: BatchNormCache,
    },
    Activation {
        input: VarId,
        kind: ActivationKind,
    },
    MaxPool {
        input: VarId,
        winners: Vec<Option<usize>>,
    },
    AvgPool {
        input: VarId,
        config: Pool2dConfig,
    },
    GlobalAvgPool {
        input: VarId,
    },
    Reshape {
        input: VarId,
    },
    Concat {
        inputs: Vec<VarId>,
        axis: usize,
    },
    /// `(N, C, H, W) * (N, C, 1, 1)`
    ChannelScale {
        input: VarId,
        scale: VarId,
    },
    /// `(N, F) x (F, O) + (O)`
    Linear {
        input: VarId,
        weight: VarId,
        bias: Option<VarId>,
    },
    Mask {
        input: VarId,
        mask: ArrayD<NasFloat>,
    },
    Interpolate {
        input: VarId,
    },
    /// Scalar loss; the logits gradient is computed by the forward kernel.
    CrossEntropy {
        logits: VarId,
        grad: Array2<NasFloat>,
    },
}

#[derive(Clone, Debug)]
struct TapeNode {
    value: ArrayD<NasFloat>,
    op: TapeOp,
    requires_grad: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Tape {
    nodes: Vec<TapeNode>,
}

/// Result of a backward pass.
#[derive(Clone, Debug, Default)]
pub struct Gradients {
    by_var: Vec<Option<ArrayD<NasFloat>>>,
    by_key: BTreeMap<String, ArrayD<NasFloat>>,
}

impl Gradients {
    pub fn var(&self, id: VarId) -> Option<&ArrayD<NasFloat>> {
        self.by_var.get(id).and_then(Option::as_ref)
    }

    pub fn key(&self, key: &str) -> Option<&ArrayD<NasFloat>> {
        self.by_key.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.by_key.keys()
    }

    pub fn into_key_map(self) -> BTreeMap<String, ArrayD<NasFloat>> {
        self.by_key
    }
}

impl Tape {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// # Panics
    /// If `id` was not produced by this tape.
    pub fn value(&self, id: VarId) -> &ArrayD<NasFloat> {
        &self.nodes[id].value
    }

    pub fn requires_grad(&self, id: VarId) -> bool {
        self.nodes.get(id).map_or(false, |n| n.requires_grad)
    }

    pub fn op(&self, id: VarId) -> Option<&TapeOp> {
        self.nodes.get(id).map(|n| &n.op)
    }

    pub fn leaf(&mut self, value: ArrayD<NasFloat>, requires_grad: bool) -> VarId {
        self.push_raw(value, TapeOp::Leaf, requires_grad)
    }

    pub fn parameter(&mut self, key: &str, value: ArrayD<NasFloat>, requires_grad: bool) -> VarId {
        self.push_raw(
            value,
            TapeOp::Parameter {
                key: key.to_string(),
            },
            requires_grad,
        )
    }

    /// Records `value` as the output of `op`. The node needs a gradient iff one of its
    /// inputs does.
    pub fn push(&mut self, value: ArrayD<NasFloat>, op: TapeOp) -> VarId {
        let requires_grad = Self::op_inputs(&op)
            .into_iter()
            .any(|id| self.requires_grad(id));
        self.push_raw(value, op, requires_grad)
    }

    fn push_raw(&mut self, value: ArrayD<NasFloat>, op: TapeOp, requires_grad: bool) -> VarId {
        self.nodes.push(TapeNode {
            value,
            op,
            requires_grad,
        });
        self.nodes.len() - 1
    }

    fn op_inputs(op: &TapeOp) -> Vec<VarId> {
        match op {
            TapeOp::Leaf | TapeOp::Parameter { .. } => vec![],
            TapeOp::Add { lhs, rhs } => vec![*lhs, *rhs],
            TapeOp::Sum { inputs } | TapeOp::Concat { inputs, .. } => inputs.clone(),
            TapeOp::WeightedSum { weights, inputs } => {
                let mut ids = inputs.clone();
                ids.push(*weights);
                ids
            }
            TapeOp::Conv2d {
                input,
                weight,
                bias,
                ..
            }
            | TapeOp::Linear {
                input,
                weight,
                bias,
            } => {
                let mut ids = vec![*input, *weight];
                ids.extend(bias.iter().copied());
                ids
            }
            TapeOp::BatchNorm {
                input, gamma, beta, ..
            } => vec![*input, *gamma, *beta],
            TapeOp::ChannelScale { input, scale } => vec![*input, *scale],
            TapeOp::Scale { input, .. }
            | TapeOp::Softmax { input }
            | TapeOp::Activation { input, .. }
            | TapeOp::MaxPool { input, .. }
            | TapeOp::AvgPool { input, .. }
            | TapeOp::GlobalAvgPool { input }
            | TapeOp::Reshape { input }
            | TapeOp::Mask { input, .. }
            | TapeOp::Interpolate { input } => vec![*input],
            TapeOp::CrossEntropy { logits, .. } => vec![*logits],
        }
    }

    /// Back-propagates `seed * d(loss)` through the tape.
    ///
    /// # Errors
    /// If a recorded value does not have the rank its operation expects.
    pub fn backward(&self, loss: VarId, seed: NasFloat) -> Result<Gradients, NasError> {
        let node = self
            .nodes
            .get(loss)
            .ok_or_else(|| NasError::invalid_state(format!("variable {} is not on the tape", loss)))?;
        let mut grads: Vec<Option<ArrayD<NasFloat>>> = vec![None; loss + 1];
        grads[loss] = Some(ArrayD::from_elem(node.value.raw_dim(), seed));
        let mut by_key = BTreeMap::new();

        for id in (0..=loss).rev() {
            let node = &self.nodes[id];
            if !node.requires_grad {
                continue;
            }
            let g = match grads[id].take() {
                Some(g) => g,
                None => continue,
            };
            if let TapeOp::Parameter { key } = &node.op {
                by_key
                    .entry(key.clone())
                    .and_modify(|acc: &mut ArrayD<NasFloat>| *acc += &g)
                    .or_insert_with(|| g.clone());
            }
            for (input, input_grad) in self.backward_node(id, &g)? {
                self.accumulate(&mut grads, input, input_grad);
            }
            grads[id] = Some(g);
        }
        Ok(Gradients {
            by_var: grads,
            by_key,
        })
    }

    fn accumulate(
        &self,
        grads: &mut [Option<ArrayD<NasFloat>>],
        id: VarId,
        g: ArrayD<NasFloat>,
    ) {
        if !self.requires_grad(id) {
            return;
        }
        match &mut grads[id] {
            Some(acc) => *acc += &g,
            slot @ None => *slot = Some(g),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn backward_node(
        &self,
        id: VarId,
        g: &ArrayD<NasFloat>,
    ) -> Result<Vec<(VarId, ArrayD<NasFloat>)>, NasError> {
        let value = |v: VarId| &self.nodes[v].value;
        let out = match &self.nodes[id].op {
            TapeOp::Leaf | TapeOp::Parameter { .. } => vec![],
            TapeOp::Add { lhs, rhs } => vec![(*lhs, g.clone()), (*rhs, g.clone())],
            TapeOp::Sum { inputs } => inputs.iter().map(|&i| (i, g.clone())).collect(),
            TapeOp::Scale { input, factor } => vec![(*input, g * *factor)],
            TapeOp::WeightedSum { weights, inputs } => {
                let w = value(*weights).view().into_dimensionality::<Ix1>()?;
                let mut res: Vec<(VarId, ArrayD<NasFloat>)> = inputs
                    .iter()
                    .zip(w.iter())
                    .map(|(&i, &wi)| (i, g * wi))
                    .collect();
                let gw = inputs
                    .iter()
                    .map(|&i| (g * value(i)).sum())
                    .collect::<Vec<_>>();
                res.push((*weights, ArrayD::from_shape_vec(IxDyn(&[gw.len()]), gw)?));
                res
            }
            TapeOp::Softmax { input } => {
                let s = &self.nodes[id].value;
                let dot = (g * s).sum();
                vec![(*input, s * &g.mapv(|v| v - dot))]
            }
            TapeOp::Conv2d {
                input,
                weight,
                bias,
                config,
            } => {
                let (gi, gw, gb) = conv2d_backward(
                    value(*input).view().into_dimensionality::<Ix4>()?,
                    value(*weight).view().into_dimensionality::<Ix4>()?,
                    g.view().into_dimensionality::<Ix4>()?,
                    config,
                )?;
                let mut res = vec![(*input, gi.into_dyn()), (*weight, gw.into_dyn())];
                if let Some(b) = bias {
                    res.push((*b, gb.into_dyn()));
                }
                res
            }
            TapeOp::BatchNorm {
                input,
                gamma,
                beta,
                cache,
            } => {
                let (gi, gg, gb) = batch_norm_backward(
                    g.view().into_dimensionality::<Ix4>()?,
                    value(*gamma).view().into_dimensionality::<Ix1>()?,
                    cache,
                );
                vec![
                    (*input, gi.into_dyn()),
                    (*gamma, gg.into_dyn()),
                    (*beta, gb.into_dyn()),
                ]
            }
            TapeOp::Activation { input, kind } => {
                vec![(*input, kind.backward(value(*input).view(), g.view()))]
            }
            TapeOp::MaxPool { input, winners } => {
                let dim = value(*input).view().into_dimensionality::<Ix4>()?.dim();
                let gi = max_pool2d_backward(dim, g.view().into_dimensionality::<Ix4>()?, winners)?;
                vec![(*input, gi.into_dyn())]
            }
            TapeOp::AvgPool { input, config } => {
                let dim = value(*input).view().into_dimensionality::<Ix4>()?.dim();
                let gi = avg_pool2d_backward(dim, g.view().into_dimensionality::<Ix4>()?, config)?;
                vec![(*input, gi.into_dyn())]
            }
            TapeOp::GlobalAvgPool { input } => {
                let dim = value(*input).view().into_dimensionality::<Ix4>()?.dim();
                let gi = global_avg_pool_backward(dim, g.view().into_dimensionality::<Ix4>()?);
                vec![(*input, gi.into_dyn())]
            }
            TapeOp::Reshape { input } => {
                let shape = value(*input).shape().to_vec();
                let gi = ArrayD::from_shape_vec(IxDyn(&shape), g.iter().copied().collect())?;
                vec![(*input, gi)]
            }
            TapeOp::Concat { inputs, axis } => {
                let mut start = 0;
                inputs
                    .iter()
                    .map(|&i| {
                        let len = value(i).len_of(Axis(*axis));
                        let slice = g
                            .slice_axis(Axis(*axis), Slice::from(start..start + len))
                            .to_owned();
                        start += len;
                        (i, slice)
                    })
                    .collect()
            }
            TapeOp::ChannelScale { input, scale } => {
                let x = value(*input).view().into_dimensionality::<Ix4>()?;
                let s = value(*scale).view().into_dimensionality::<Ix4>()?;
                let g4 = g.view().into_dimensionality::<Ix4>()?;
                let gi = &g4 * &s;
                let gs = (&g4 * &x)
                    .sum_axis(Axis(3))
                    .sum_axis(Axis(2))
                    .insert_axis(Axis(2))
                    .insert_axis(Axis(3));
                vec![(*input, gi.into_dyn()), (*scale, gs.into_dyn())]
            }
            TapeOp::Linear {
                input,
                weight,
                bias,
            } => {
                let x = value(*input).view().into_dimensionality::<Ix2>()?;
                let w = value(*weight).view().into_dimensionality::<Ix2>()?;
                let g2 = g.view().into_dimensionality::<Ix2>()?;
                let mut res = vec![
                    (*input, g2.dot(&w.t()).into_dyn()),
                    (*weight, x.t().dot(&g2).into_dyn()),
                ];
                if let Some(b) = bias {
                    res.push((*b, g2.sum_axis(Axis(0)).into_dyn()));
                }
                res
            }
            TapeOp::Mask { input, mask } => vec![(*input, g * mask)],
            TapeOp::Interpolate { input } => {
                let dim = value(*input).view().into_dimensionality::<Ix4>()?.dim();
                let gi = bilinear_backward(dim, g.view().into_dimensionality::<Ix4>()?);
                vec![(*input, gi.into_dyn())]
            }
            TapeOp::CrossEntropy { logits, grad } => {
                let scale = g.sum();
                vec![(*logits, (grad * scale).into_dyn())]
            }
        };
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, ArrayD};

    #[test]
    fn test_shared_input_accumulates() {
        let mut tape = Tape::default();
        let x = tape.parameter("x", arr1(&[2., 3.]).into_dyn(), true);
        let y = tape.push(
            tape.value(x) + tape.value(x),
            TapeOp::Add { lhs: x, rhs: x },
        );
        let grads = tape.backward(y, 1.).unwrap();
        assert_eq!(grads.key("x").unwrap(), &arr1(&[2., 2.]).into_dyn());
    }

    #[test]
    fn test_frozen_leaf_gets_no_gradient() {
        let mut tape = Tape::default();
        let a = tape.parameter("a", arr1(&[1.]).into_dyn(), true);
        let b = tape.parameter("b", arr1(&[1.]).into_dyn(), false);
        let s = tape.push(
            tape.value(a) + tape.value(b),
            TapeOp::Sum { inputs: vec![a, b] },
        );
        let grads = tape.backward(s, 0.5).unwrap();
        assert_abs_diff_eq!(grads.key("a").unwrap()[[0]], 0.5);
        assert!(grads.key("b").is_none());
    }

    #[test]
    fn test_weighted_sum_gradient() {
        let mut tape = Tape::default();
        let w = tape.parameter("w", arr1(&[0.25, 0.75]).into_dyn(), true);
        let x0 = tape.leaf(ArrayD::from_elem(IxDyn(&[3]), 2.), true);
        let x1 = tape.leaf(ArrayD::from_elem(IxDyn(&[3]), -1.), true);
        let value = tape.value(x0) * 0.25 + tape.value(x1) * 0.75;
        let y = tape.push(
            value,
            TapeOp::WeightedSum {
                weights: w,
                inputs: vec![x0, x1],
            },
        );
        let grads = tape.backward(y, 1.).unwrap();
        let gw = grads.key("w").unwrap();
        assert_abs_diff_eq!(gw[[0]], 6.);
        assert_abs_diff_eq!(gw[[1]], -3.);
        assert_abs_diff_eq!(grads.var(x1).unwrap()[[2]], 0.75);
    }
}
