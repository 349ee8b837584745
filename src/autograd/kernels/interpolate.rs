//! Bilinear resizing with aligned corners.
use crate::NasFloat;
use itertools::Itertools;
use ndarray::{Array4, ArrayView4};

/// Source taps `(lo, hi, weight_of_hi)` for every output coordinate along one axis.
fn taps(size_in: usize, size_out: usize) -> Vec<(usize, usize, NasFloat)> {
    let scale = if size_out > 1 {
        (size_in.saturating_sub(1)) as NasFloat / (size_out - 1) as NasFloat
    } else {
        0.
    };
    (0..size_out)
        .map(|o| {
            let src = o as NasFloat * scale;
            let lo = (src.floor() as usize).min(size_in.saturating_sub(1));
            let hi = (lo + 1).min(size_in.saturating_sub(1));
            (lo, hi, src - lo as NasFloat)
        })
        .collect()
}

pub fn bilinear_forward(input: ArrayView4<NasFloat>, output_hw: (usize, usize)) -> Array4<NasFloat> {
    let (n, c, h_in, w_in) = input.dim();
    let ty = taps(h_in, output_hw.0);
    let tx = taps(w_in, output_hw.1);
    Array4::from_shape_fn((n, c, output_hw.0, output_hw.1), |(i, ch, y, x)| {
        let (y0, y1, wy) = ty[y];
        let (x0, x1, wx) = tx[x];
        let top = input[[i, ch, y0, x0]] * (1. - wx) + input[[i, ch, y0, x1]] * wx;
        let bottom = input[[i, ch, y1, x0]] * (1. - wx) + input[[i, ch, y1, x1]] * wx;
        top * (1. - wy) + bottom * wy
    })
}

pub fn bilinear_backward(
    input_dim: (usize, usize, usize, usize),
    grad_output: ArrayView4<NasFloat>,
) -> Array4<NasFloat> {
    let (n, c, h_in, w_in) = input_dim;
    let (_, _, h_out, w_out) = grad_output.dim();
    let ty = taps(h_in, h_out);
    let tx = taps(w_in, w_out);
    let mut grad_input = Array4::<NasFloat>::zeros(input_dim);
    for ((i, ch), (y, x)) in (0..n)
        .cartesian_product(0..c)
        .cartesian_product((0..h_out).cartesian_product(0..w_out))
    {
        let g = grad_output[[i, ch, y, x]];
        let (y0, y1, wy) = ty[y];
        let (x0, x1, wx) = tx[x];
        grad_input[[i, ch, y0, x0]] += g * (1. - wy) * (1. - wx);
        grad_input[[i, ch, y0, x1]] += g * (1. - wy) * wx;
        grad_input[[i, ch, y1, x0]] += g * wy * (1. - wx);
        grad_input[[i, ch, y1, x1]] += g * wy * wx;
    }
    grad_input
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn test_corners_are_preserved() {
        let input = Array::from_shape_fn((1, 1, 2, 2), |(_, _, y, x)| (y * 2 + x) as f64);
        let out = bilinear_forward(input.view(), (3, 3));
        assert_eq!(out[[0, 0, 0, 0]], 0.);
        assert_eq!(out[[0, 0, 2, 2]], 3.);
        assert!((out[[0, 0, 1, 1]] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_backward_conserves_mass() {
        let grad = Array4::<f64>::ones((1, 2, 5, 7));
        let gi = bilinear_backward((1, 2, 3, 4), grad.view());
        assert!((gi.sum() - 70.).abs() < 1e-9);
    }
}
