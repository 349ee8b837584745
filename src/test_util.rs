#![cfg(test)]
use crate::autograd::{Context, ParameterSpec, ParameterStore, VarId};
use crate::{NasError, NasFloat};
use ndarray::{Array4, ArrayD, Dimension, IxDyn};
use proptest::arbitrary::functor::ArbitraryF1;
use proptest::prelude::*;
use proptest::sample::SizeRange;

prop_compose! {
    pub fn array4(shape: (usize, usize, usize, usize))(v in Vec::lift1_with(-1. .. 1., SizeRange::new(shape.0 * shape.1 * shape.2 * shape.3..=shape.0 * shape.1 * shape.2 * shape.3))) -> Array4<f64> {
        Array4::from_shape_vec(shape, v).unwrap()
    }
}

prop_compose! {
    pub fn logits(len: usize)(v in Vec::lift1_with(-3. .. 3., SizeRange::new(len..=len))) -> ndarray::Array1<f64> {
        ndarray::Array1::from_vec(v)
    }
}

/// Deterministic input in `[-0.5, 0.5)` without a fixed pattern across channels.
pub fn ramp_input(shape: &[usize]) -> ArrayD<NasFloat> {
    let dim = IxDyn(shape);
    let n = dim.size();
    ArrayD::from_shape_vec(
        dim,
        (0..n).map(|i| ((i * 7919) % 97) as NasFloat / 97. - 0.5).collect(),
    )
    .unwrap()
}

pub fn assert_all_close(a: &ArrayD<NasFloat>, b: &ArrayD<NasFloat>, tol: NasFloat) {
    assert_eq!(a.shape(), b.shape());
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() <= tol, "{} vs {} (tol {})", x, y, tol);
    }
}

fn objective(
    store: &mut ParameterStore,
    input: &ArrayD<NasFloat>,
    f: &impl Fn(&mut Context, VarId) -> Result<VarId, NasError>,
) -> NasFloat {
    let mut ctx = Context::new(store, false, 0);
    let x = ctx.input(input.clone());
    let y = f(&mut ctx, x).unwrap();
    let coeffs = ramp_input(ctx.value(y).shape());
    (ctx.value(y) * &coeffs).sum()
}

/// Compares analytic gradients of `sum(c * f(x))` w.r.t. the input and the parameter
/// `spec` against central differences.
pub fn assert_grad_close(
    input: &ArrayD<NasFloat>,
    spec: &ParameterSpec,
    f: impl Fn(&mut Context, VarId) -> Result<VarId, NasError>,
) {
    let mut store = ParameterStore::new(11);
    let (grad_x, grad_w) = {
        let mut ctx = Context::new(&mut store, false, 0);
        let x = ctx.variable(input.clone());
        let y = f(&mut ctx, x).unwrap();
        let coeffs = ramp_input(ctx.value(y).shape());
        let z = ctx.mask(y, coeffs).unwrap();
        let grads = ctx.backward(z, 1., |_| true).unwrap();
        (grads.var(x).unwrap().clone(), grads.key(&spec.key).unwrap().clone())
    };

    let h = 1e-5;
    let stride_x = (input.len() / 7).max(1);
    for idx in (0..input.len()).step_by(stride_x) {
        let mut plus = input.clone();
        let mut minus = input.clone();
        plus.as_slice_mut().unwrap()[idx] += h;
        minus.as_slice_mut().unwrap()[idx] -= h;
        let numeric = (objective(&mut store, &plus, &f) - objective(&mut store, &minus, &f)) / (2. * h);
        let analytic = grad_x.as_slice().unwrap()[idx];
        assert!(
            (numeric - analytic).abs() < 1e-5,
            "input {}: numeric {} analytic {}",
            idx,
            numeric,
            analytic
        );
    }

    let n_w = grad_w.len();
    for idx in (0..n_w).step_by((n_w / 7).max(1)) {
        let original = store.data(&spec.key).unwrap().as_slice().unwrap()[idx];
        let mut eval_at = |v: NasFloat| {
            store.get_mut(&spec.key).unwrap().data.as_slice_mut().unwrap()[idx] = v;
            objective(&mut store, input, &f)
        };
        let numeric = (eval_at(original + h) - eval_at(original - h)) / (2. * h);
        eval_at(original);
        let analytic = grad_w.as_slice().unwrap()[idx];
        assert!(
            (numeric - analytic).abs() < 1e-5,
            "{}[{}]: numeric {} analytic {}",
            spec.key,
            idx,
            numeric,
            analytic
        );
    }
}
