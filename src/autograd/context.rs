//! Forward-pass context: the tape being recorded plus access to the parameters.
use super::kernels::conv::conv2d_forward;
use super::kernels::interpolate::bilinear_forward;
use super::kernels::loss::{smooth_targets, softmax_cross_entropy, top1_error};
use super::kernels::normalization::{batch_norm_eval, batch_norm_train};
use super::kernels::pooling::{avg_pool2d_forward, global_avg_pool_forward, max_pool2d_forward};
use super::kernels::{ActivationKind, BatchNormConfig, Conv2dConfig, Pool2dConfig};
use super::parameter::{ParameterSpec, ParameterStore};
use super::tape::{Gradients, Tape, TapeOp, VarId};
use crate::{util, NasError, NasFloat};
use log::trace;
use ndarray::{concatenate, ArrayD, ArrayView, Axis, Ix1, Ix2, Ix4, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

pub struct Context<'a> {
    tape: Tape,
    store: &'a mut ParameterStore,
    training: bool,
    rng: StdRng,
    params: HashMap<String, VarId>,
}

impl<'a> Context<'a> {
    pub fn new(store: &'a mut ParameterStore, training: bool, seed: u64) -> Self {
        Self {
            tape: Tape::default(),
            store,
            training,
            rng: StdRng::seed_from_u64(seed),
            params: HashMap::new(),
        }
    }

    pub const fn is_training(&self) -> bool {
        self.training
    }

    pub fn store(&self) -> &ParameterStore {
        self.store
    }

    pub fn store_mut(&mut self) -> &mut ParameterStore {
        self.store
    }

    pub const fn tape(&self) -> &Tape {
        &self.tape
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// # Panics
    /// If `id` does not belong to this context.
    pub fn value(&self, id: VarId) -> &ArrayD<NasFloat> {
        self.tape.value(id)
    }

    pub fn input(&mut self, value: ArrayD<NasFloat>) -> VarId {
        self.tape.leaf(value, false)
    }

    /// A leaf whose gradient is tracked, for inspecting input sensitivities.
    pub fn variable(&mut self, value: ArrayD<NasFloat>) -> VarId {
        self.tape.leaf(value, true)
    }

    /// Tape variable holding the parameter under `spec.key`, created on first use.
    /// Repeated calls in one context return the same variable.
    ///
    /// # Errors
    pub fn parameter(&mut self, spec: &ParameterSpec) -> Result<VarId, NasError> {
        if let Some(&id) = self.params.get(&spec.key) {
            return Ok(id);
        }
        let p = self.store.get_or_create(spec)?;
        let (data, trainable) = (p.data.clone(), p.is_trainable());
        let id = self.tape.parameter(&spec.key, data, trainable);
        self.params.insert(spec.key.clone(), id);
        Ok(id)
    }

    /// # Errors
    /// If the shapes differ.
    pub fn add(&mut self, lhs: VarId, rhs: VarId) -> Result<VarId, NasError> {
        let (a, b) = (self.value(lhs), self.value(rhs));
        if a.shape() != b.shape() {
            return Err(NasError::shape_mismatch(format!(
                "cannot add {:?} and {:?}",
                a.shape(),
                b.shape()
            )));
        }
        let v = a + b;
        Ok(self.tape.push(v, TapeOp::Add { lhs, rhs }))
    }

    /// # Errors
    pub fn sum(&mut self, inputs: &[VarId]) -> Result<VarId, NasError> {
        let first = inputs
            .first()
            .ok_or_else(|| NasError::invalid_state("sum of no inputs"))?;
        let mut acc = self.value(*first).clone();
        for &i in &inputs[1..] {
            let v = self.value(i);
            if v.shape() != acc.shape() {
                return Err(NasError::shape_mismatch(format!(
                    "cannot sum {:?} and {:?}",
                    acc.shape(),
                    v.shape()
                )));
            }
            acc += v;
        }
        Ok(self.tape.push(
            acc,
            TapeOp::Sum {
                inputs: inputs.to_vec(),
            },
        ))
    }

    pub fn scale(&mut self, input: VarId, factor: NasFloat) -> VarId {
        let v = self.value(input) * factor;
        self.tape.push(v, TapeOp::Scale { input, factor })
    }

    /// 1-D softmax.
    ///
    /// # Errors
    pub fn softmax(&mut self, input: VarId) -> Result<VarId, NasError> {
        let x = self.value(input).view().into_dimensionality::<Ix1>()?;
        let v = util::softmax(x).into_dyn();
        Ok(self.tape.push(v, TapeOp::Softmax { input }))
    }

    /// `sum_i weights[i] * inputs[i]`.
    ///
    /// # Errors
    pub fn weighted_sum(&mut self, weights: VarId, inputs: &[VarId]) -> Result<VarId, NasError> {
        let w = self.value(weights).view().into_dimensionality::<Ix1>()?;
        if w.len() != inputs.len() || inputs.is_empty() {
            return Err(NasError::shape_mismatch(format!(
                "{} weights for {} inputs",
                w.len(),
                inputs.len()
            )));
        }
        let mut acc = ArrayD::<NasFloat>::zeros(self.value(inputs[0]).raw_dim());
        for (&i, &wi) in inputs.iter().zip(w.iter()) {
            let v = self.value(i);
            if v.shape() != acc.shape() {
                return Err(NasError::shape_mismatch(format!(
                    "cannot mix {:?} and {:?}",
                    acc.shape(),
                    v.shape()
                )));
            }
            acc.scaled_add(wi, v);
        }
        Ok(self.tape.push(
            acc,
            TapeOp::WeightedSum {
                weights,
                inputs: inputs.to_vec(),
            },
        ))
    }

    /// # Errors
    pub fn conv2d(
        &mut self,
        input: VarId,
        weight: VarId,
        bias: Option<VarId>,
        config: Conv2dConfig,
    ) -> Result<VarId, NasError> {
        let v = conv2d_forward(
            self.value(input).view().into_dimensionality::<Ix4>()?,
            self.value(weight).view().into_dimensionality::<Ix4>()?,
            match bias {
                Some(b) => Some(self.value(b).view().into_dimensionality::<Ix1>()?),
                None => None,
            },
            &config,
        )?;
        Ok(self.tape.push(
            v.into_dyn(),
            TapeOp::Conv2d {
                input,
                weight,
                bias,
                config,
            },
        ))
    }

    /// Batch normalisation; training contexts use and update batch statistics.
    ///
    /// # Errors
    pub fn batch_norm(
        &mut self,
        input: VarId,
        gamma: VarId,
        beta: VarId,
        mean_key: &str,
        var_key: &str,
        config: &BatchNormConfig,
    ) -> Result<VarId, NasError> {
        let x = self.tape.value(input).view().into_dimensionality::<Ix4>()?;
        let g = self.tape.value(gamma).view().into_dimensionality::<Ix1>()?;
        let b = self.tape.value(beta).view().into_dimensionality::<Ix1>()?;
        let (out, cache) = if self.training {
            let mut mean = self.store.data(mean_key)?.clone();
            let mut var = self.store.data(var_key)?.clone();
            let res = batch_norm_train(
                x,
                g,
                b,
                mean.view_mut().into_dimensionality::<Ix1>()?,
                var.view_mut().into_dimensionality::<Ix1>()?,
                config,
            )?;
            if let Some(p) = self.store.get_mut(mean_key) {
                p.data = mean;
            }
            if let Some(p) = self.store.get_mut(var_key) {
                p.data = var;
            }
            res
        } else {
            batch_norm_eval(
                x,
                g,
                b,
                self.store.data(mean_key)?.view().into_dimensionality::<Ix1>()?,
                self.store.data(var_key)?.view().into_dimensionality::<Ix1>()?,
                config,
            )?
        };
        Ok(self.tape.push(
            out.into_dyn(),
            TapeOp::BatchNorm {
                input,
                gamma,
                beta,
                cache,
            },
        ))
    }

    pub fn activation(&mut self, input: VarId, kind: ActivationKind) -> VarId {
        let v = kind.forward(self.value(input).view());
        self.tape.push(v, TapeOp::Activation { input, kind })
    }

    /// # Errors
    pub fn max_pool(&mut self, input: VarId, config: &Pool2dConfig) -> Result<VarId, NasError> {
        let (v, winners) =
            max_pool2d_forward(self.value(input).view().into_dimensionality::<Ix4>()?, config)?;
        Ok(self
            .tape
            .push(v.into_dyn(), TapeOp::MaxPool { input, winners }))
    }

    /// # Errors
    pub fn avg_pool(&mut self, input: VarId, config: &Pool2dConfig) -> Result<VarId, NasError> {
        let v = avg_pool2d_forward(self.value(input).view().into_dimensionality::<Ix4>()?, config)?;
        Ok(self.tape.push(
            v.into_dyn(),
            TapeOp::AvgPool {
                input,
                config: *config,
            },
        ))
    }

    /// # Errors
    pub fn global_avg_pool(&mut self, input: VarId) -> Result<VarId, NasError> {
        let v = global_avg_pool_forward(self.value(input).view().into_dimensionality::<Ix4>()?);
        Ok(self.tape.push(v.into_dyn(), TapeOp::GlobalAvgPool { input }))
    }

    /// # Errors
    /// If the element counts differ.
    pub fn reshape(&mut self, input: VarId, shape: &[usize]) -> Result<VarId, NasError> {
        let v = ArrayD::from_shape_vec(IxDyn(shape), self.value(input).iter().copied().collect())?;
        Ok(self.tape.push(v, TapeOp::Reshape { input }))
    }

    /// # Errors
    pub fn concat(&mut self, inputs: &[VarId], axis: usize) -> Result<VarId, NasError> {
        let views: Vec<ArrayView<NasFloat, IxDyn>> =
            inputs.iter().map(|&i| self.value(i).view()).collect();
        let v = concatenate(Axis(axis), &views)?;
        Ok(self.tape.push(
            v,
            TapeOp::Concat {
                inputs: inputs.to_vec(),
                axis,
            },
        ))
    }

    /// Scales every channel of `input (N, C, H, W)` by `scale (N, C, 1, 1)`.
    ///
    /// # Errors
    pub fn channel_scale(&mut self, input: VarId, scale: VarId) -> Result<VarId, NasError> {
        let x = self.value(input).view().into_dimensionality::<Ix4>()?;
        let s = self.value(scale).view().into_dimensionality::<Ix4>()?;
        let (n, c, _, _) = x.dim();
        if s.dim() != (n, c, 1, 1) {
            return Err(NasError::shape_mismatch(format!(
                "channel scale {:?} for input {:?}",
                s.dim(),
                x.dim()
            )));
        }
        let v = (&x * &s).into_dyn();
        Ok(self.tape.push(v, TapeOp::ChannelScale { input, scale }))
    }

    /// # Errors
    pub fn linear(
        &mut self,
        input: VarId,
        weight: VarId,
        bias: Option<VarId>,
    ) -> Result<VarId, NasError> {
        let x = self.value(input).view().into_dimensionality::<Ix2>()?;
        let w = self.value(weight).view().into_dimensionality::<Ix2>()?;
        if x.ncols() != w.nrows() {
            return Err(NasError::shape_mismatch(format!(
                "linear input {:?} for weight {:?}",
                x.dim(),
                w.dim()
            )));
        }
        let mut v = x.dot(&w);
        if let Some(b) = bias {
            v += &self.value(b).view().into_dimensionality::<Ix1>()?;
        }
        Ok(self.tape.push(
            v.into_dyn(),
            TapeOp::Linear {
                input,
                weight,
                bias,
            },
        ))
    }

    /// Element-wise product with a constant mask of the same shape.
    ///
    /// # Errors
    pub fn mask(&mut self, input: VarId, mask: ArrayD<NasFloat>) -> Result<VarId, NasError> {
        if mask.shape() != self.value(input).shape() {
            return Err(NasError::shape_mismatch(format!(
                "mask {:?} for input {:?}",
                mask.shape(),
                self.value(input).shape()
            )));
        }
        let v = self.value(input) * &mask;
        Ok(self.tape.push(v, TapeOp::Mask { input, mask }))
    }

    /// Inverted dropout; the identity outside training.
    ///
    /// # Errors
    pub fn dropout(&mut self, input: VarId, p: NasFloat) -> Result<VarId, NasError> {
        if !self.training || p <= 0. {
            return Ok(input);
        }
        let keep = 1. - p;
        let dim = self.value(input).raw_dim();
        let rng = &mut self.rng;
        let mask = ArrayD::from_shape_simple_fn(dim, || {
            if rng.gen::<NasFloat>() < keep {
                1. / keep
            } else {
                0.
            }
        });
        self.mask(input, mask)
    }

    /// Drops whole samples of the batch with probability `p`.
    ///
    /// # Errors
    pub fn drop_path(&mut self, input: VarId, p: NasFloat) -> Result<VarId, NasError> {
        if !self.training || p <= 0. {
            return Ok(input);
        }
        let keep = 1. - p;
        let dim = self.value(input).raw_dim();
        let batch = dim[0];
        let keeps: Vec<NasFloat> = (0..batch)
            .map(|_| {
                if self.rng.gen::<NasFloat>() < keep {
                    1. / keep
                } else {
                    0.
                }
            })
            .collect();
        let mut mask = ArrayD::<NasFloat>::zeros(dim);
        for (mut sample, k) in mask.axis_iter_mut(Axis(0)).zip(keeps) {
            sample.fill(k);
        }
        self.mask(input, mask)
    }

    /// # Errors
    pub fn interpolate(
        &mut self,
        input: VarId,
        output_hw: (usize, usize),
    ) -> Result<VarId, NasError> {
        let v = bilinear_forward(
            self.value(input).view().into_dimensionality::<Ix4>()?,
            output_hw,
        );
        Ok(self.tape.push(v.into_dyn(), TapeOp::Interpolate { input }))
    }

    /// Mean label-smoothed cross entropy of `(N, K)` logits. Returns a scalar variable.
    ///
    /// # Errors
    pub fn cross_entropy(
        &mut self,
        logits: VarId,
        labels: &[usize],
        smoothing: NasFloat,
    ) -> Result<VarId, NasError> {
        let l = self.value(logits).view().into_dimensionality::<Ix2>()?;
        if l.nrows() != labels.len() {
            return Err(NasError::shape_mismatch(format!(
                "{} labels for {} rows of logits",
                labels.len(),
                l.nrows()
            )));
        }
        let targets = smooth_targets(labels, l.ncols(), smoothing)?;
        let (loss, grad) = softmax_cross_entropy(l, targets.view())?;
        Ok(self.tape.push(
            ndarray::arr0(loss).into_dyn(),
            TapeOp::CrossEntropy { logits, grad },
        ))
    }

    /// # Errors
    pub fn top1_error(&self, logits: VarId, labels: &[usize]) -> Result<NasFloat, NasError> {
        let l = self.value(logits).view().into_dimensionality::<Ix2>()?;
        Ok(top1_error(l, labels))
    }

    /// # Errors
    /// [`NasError::Numeric`] when `id` holds a NaN or an infinity.
    pub fn check_finite(&self, id: VarId, what: &str) -> Result<(), NasError> {
        if self.value(id).iter().all(|v| v.is_finite()) {
            Ok(())
        } else {
            Err(NasError::numeric(format!("{} is not finite", what)))
        }
    }

    /// Back-propagates from `loss` and adds the gradients of the trainable parameters
    /// accepted by `filter` to the store.
    ///
    /// # Errors
    pub fn backward(
        &mut self,
        loss: VarId,
        seed: NasFloat,
        filter: impl Fn(&str) -> bool,
    ) -> Result<Gradients, NasError> {
        let grads = self.tape.backward(loss, seed)?;
        let mut count = 0;
        for key in grads.keys() {
            if !filter(key) {
                continue;
            }
            let trainable = self.store.get(key).map_or(false, |p| p.is_trainable());
            if let (true, Some(g)) = (trainable, grads.key(key)) {
                self.store.accumulate_grad(key, g)?;
                count += 1;
            }
        }
        trace!("backward accumulated {} parameter gradients", count);
        Ok(grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{Initializer, ParameterSpec};
    use crate::test_util::assert_grad_close;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, Array2};

    #[test]
    fn test_conv_gradient_matches_finite_difference() {
        let input = Array::from_shape_fn((2, 2, 5, 5), |(n, c, y, x)| {
            ((n + 1) * (c + 2) * (y + 3) * (x + 1)) as f64 % 7. / 7. - 0.5
        })
        .into_dyn();
        let spec = ParameterSpec::weight("conv/W", vec![3, 2, 3, 3], Initializer::conv(2, 3, (3, 3)));
        let config = Conv2dConfig {
            stride: (2, 2),
            pad: (1, 1),
            ..Conv2dConfig::default()
        };
        assert_grad_close(&input, &spec, |ctx, x| {
            let w = ctx.parameter(&spec)?;
            let y = ctx.conv2d(x, w, None, config)?;
            let y = ctx.activation(y, ActivationKind::Sigmoid);
            ctx.reshape(y, &[2, 27])
        });
    }

    #[test]
    fn test_cross_entropy_backward_through_linear() {
        let mut store = ParameterStore::new(0);
        let mut ctx = Context::new(&mut store, true, 0);
        let spec = ParameterSpec::weight("fc/W", vec![3, 2], Initializer::Constant(0.));
        let x = ctx.input(Array2::<f64>::ones((4, 3)).into_dyn());
        let w = ctx.parameter(&spec).unwrap();
        let logits = ctx.linear(x, w, None).unwrap();
        let loss = ctx.cross_entropy(logits, &[0, 0, 0, 0], 0.).unwrap();
        assert_abs_diff_eq!(ctx.value(loss).sum(), 2f64.ln(), epsilon = 1e-12);
        ctx.backward(loss, 1., |_| true).unwrap();
        let g = &store.get("fc/W").unwrap().grad;
        // pushes class 0 up, class 1 down
        assert_abs_diff_eq!(g[[0, 0]], -0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(g[[0, 1]], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_dropout_is_identity_in_eval() {
        let mut store = ParameterStore::new(0);
        let mut ctx = Context::new(&mut store, false, 0);
        let x = ctx.input(ArrayD::ones(IxDyn(&[2, 3])));
        assert_eq!(ctx.dropout(x, 0.5).unwrap(), x);
        assert_eq!(ctx.drop_path(x, 0.5).unwrap(), x);
    }

    #[test]
    fn test_check_finite() {
        let mut store = ParameterStore::new(0);
        let mut ctx = Context::new(&mut store, false, 0);
        let x = ctx.input(ndarray::arr1(&[1., f64::NAN]).into_dyn());
        assert!(matches!(
            ctx.check_finite(x, "loss"),
            Err(NasError::Numeric { .. })
        ));
    }
}
