//! Window pooling over NCHW arrays.
use super::conv::window_output_size;
use crate::{NasError, NasFloat};
use itertools::Itertools;
use ndarray::{Array4, ArrayView4, Axis};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pool2dConfig {
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub pad: (usize, usize),
}

impl Pool2dConfig {
    pub const fn new(kernel: (usize, usize), stride: (usize, usize), pad: (usize, usize)) -> Self {
        Self {
            kernel,
            stride,
            pad,
        }
    }

    /// # Errors
    pub fn output_hw(&self, input_hw: (usize, usize)) -> Result<(usize, usize), NasError> {
        let h = window_output_size(input_hw.0, self.kernel.0, self.stride.0, self.pad.0, 1);
        let w = window_output_size(input_hw.1, self.kernel.1, self.stride.1, self.pad.1, 1);
        h.zip(w).ok_or_else(|| {
            NasError::shape_mismatch(format!(
                "pooling window {:?} does not fit input {:?}",
                self, input_hw
            ))
        })
    }

    /// Input rows (or columns) covered by output position `o` along one axis, padding excluded.
    fn window(o: usize, kernel: usize, stride: usize, pad: usize, size: usize) -> (usize, usize) {
        let start = (o * stride).saturating_sub(pad);
        let end = (o * stride + kernel).saturating_sub(pad).min(size);
        (start, end)
    }
}

/// Max pooling. Padded positions never win. Returns the flat input offset of every winner,
/// which the backward pass scatters into.
///
/// # Errors
pub fn max_pool2d_forward(
    input: ArrayView4<NasFloat>,
    config: &Pool2dConfig,
) -> Result<(Array4<NasFloat>, Vec<Option<usize>>), NasError> {
    let (batch, channels, h_in, w_in) = input.dim();
    let (h_out, w_out) = config.output_hw((h_in, w_in))?;
    let mut output = Array4::<NasFloat>::zeros((batch, channels, h_out, w_out));
    let mut winners = Vec::with_capacity(output.len());
    for (n, c, y, x) in iproduct4(batch, channels, h_out, w_out) {
        let (y0, y1) = Pool2dConfig::window(y, config.kernel.0, config.stride.0, config.pad.0, h_in);
        let (x0, x1) = Pool2dConfig::window(x, config.kernel.1, config.stride.1, config.pad.1, w_in);
        let best = (y0..y1)
            .cartesian_product(x0..x1)
            .map(|(yi, xi)| (yi, xi, input[[n, c, yi, xi]]))
            .fold(None, |acc: Option<(usize, usize, NasFloat)>, cur| match acc {
                Some(best) if best.2 >= cur.2 => Some(best),
                _ => Some(cur),
            });
        match best {
            Some((yi, xi, v)) => {
                output[[n, c, y, x]] = v;
                winners.push(Some(((n * channels + c) * h_in + yi) * w_in + xi));
            }
            None => winners.push(None),
        }
    }
    Ok((output, winners))
}

/// # Errors
pub fn max_pool2d_backward(
    input_dim: (usize, usize, usize, usize),
    grad_output: ArrayView4<NasFloat>,
    winners: &[Option<usize>],
) -> Result<Array4<NasFloat>, NasError> {
    if winners.len() != grad_output.len() {
        return Err(NasError::shape_mismatch(
            "max pool gradient does not match the recorded winners",
        ));
    }
    let mut grad_input = Array4::<NasFloat>::zeros(input_dim);
    let flat = grad_input
        .as_slice_mut()
        .ok_or_else(|| NasError::invalid_state("gradient buffer is not contiguous"))?;
    for (g, winner) in grad_output.iter().zip(winners.iter()) {
        if let Some(idx) = winner {
            flat[*idx] += g;
        }
    }
    Ok(grad_input)
}

/// Average pooling. Padded positions count towards the divisor.
///
/// # Errors
pub fn avg_pool2d_forward(
    input: ArrayView4<NasFloat>,
    config: &Pool2dConfig,
) -> Result<Array4<NasFloat>, NasError> {
    let (batch, channels, h_in, w_in) = input.dim();
    let (h_out, w_out) = config.output_hw((h_in, w_in))?;
    let area = (config.kernel.0 * config.kernel.1) as NasFloat;
    let mut output = Array4::<NasFloat>::zeros((batch, channels, h_out, w_out));
    for (n, c, y, x) in iproduct4(batch, channels, h_out, w_out) {
        let (y0, y1) = Pool2dConfig::window(y, config.kernel.0, config.stride.0, config.pad.0, h_in);
        let (x0, x1) = Pool2dConfig::window(x, config.kernel.1, config.stride.1, config.pad.1, w_in);
        let sum: NasFloat = (y0..y1)
            .cartesian_product(x0..x1)
            .map(|(yi, xi)| input[[n, c, yi, xi]])
            .sum();
        output[[n, c, y, x]] = sum / area;
    }
    Ok(output)
}

/// # Errors
pub fn avg_pool2d_backward(
    input_dim: (usize, usize, usize, usize),
    grad_output: ArrayView4<NasFloat>,
    config: &Pool2dConfig,
) -> Result<Array4<NasFloat>, NasError> {
    let (batch, channels, h_in, w_in) = input_dim;
    let (h_out, w_out) = config.output_hw((h_in, w_in))?;
    if grad_output.dim() != (batch, channels, h_out, w_out) {
        return Err(NasError::shape_mismatch(format!(
            "gradient {:?} does not match pooling output",
            grad_output.dim()
        )));
    }
    let area = (config.kernel.0 * config.kernel.1) as NasFloat;
    let mut grad_input = Array4::<NasFloat>::zeros(input_dim);
    for (n, c, y, x) in iproduct4(batch, channels, h_out, w_out) {
        let g = grad_output[[n, c, y, x]] / area;
        let (y0, y1) = Pool2dConfig::window(y, config.kernel.0, config.stride.0, config.pad.0, h_in);
        let (x0, x1) = Pool2dConfig::window(x, config.kernel.1, config.stride.1, config.pad.1, w_in);
        for (yi, xi) in (y0..y1).cartesian_product(x0..x1) {
            grad_input[[n, c, yi, xi]] += g;
        }
    }
    Ok(grad_input)
}

/// Mean over the spatial axes, keeping them as size one.
pub fn global_avg_pool_forward(input: ArrayView4<NasFloat>) -> Array4<NasFloat> {
    let (batch, channels, h, w) = input.dim();
    let area = (h * w) as NasFloat;
    let means = input.sum_axis(Axis(3)).sum_axis(Axis(2)) / area;
    Array4::from_shape_fn((batch, channels, 1, 1), |(n, c, _, _)| means[[n, c]])
}

pub fn global_avg_pool_backward(
    input_dim: (usize, usize, usize, usize),
    grad_output: ArrayView4<NasFloat>,
) -> Array4<NasFloat> {
    let (_, _, h, w) = input_dim;
    let area = (h * w) as NasFloat;
    Array4::from_shape_fn(input_dim, |(n, c, _, _)| grad_output[[n, c, 0, 0]] / area)
}

fn iproduct4(
    a: usize,
    b: usize,
    c: usize,
    d: usize,
) -> impl Iterator<Item = (usize, usize, usize, usize)> {
    (0..a)
        .cartesian_product(0..b)
        .cartesian_product((0..c).cartesian_product(0..d))
        .map(|((n, ch), (y, x))| (n, ch, y, x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::array4;
    use ndarray::Array;
    use proptest::prelude::*;

    #[test]
    fn test_max_pool_routes_gradient_to_winner() {
        let input = Array::from_shape_fn((1, 1, 4, 4), |(_, _, y, x)| (y * 4 + x) as f64);
        let config = Pool2dConfig::new((2, 2), (2, 2), (0, 0));
        let (out, winners) = max_pool2d_forward(input.view(), &config).unwrap();
        assert_eq!(out.dim(), (1, 1, 2, 2));
        assert_eq!(out[[0, 0, 0, 0]], 5.);
        assert_eq!(out[[0, 0, 1, 1]], 15.);

        let grad = Array4::<f64>::ones((1, 1, 2, 2));
        let gi = max_pool2d_backward(input.dim(), grad.view(), &winners).unwrap();
        assert_eq!(gi.sum(), 4.);
        assert_eq!(gi[[0, 0, 1, 1]], 1.);
        assert_eq!(gi[[0, 0, 0, 0]], 0.);
    }

    #[test]
    fn test_max_pool_ignores_padding() {
        let input = Array4::<f64>::from_elem((1, 1, 3, 3), -2.);
        let config = Pool2dConfig::new((3, 3), (1, 1), (1, 1));
        let (out, _) = max_pool2d_forward(input.view(), &config).unwrap();
        assert_eq!(out.dim(), (1, 1, 3, 3));
        assert!(out.iter().all(|&v| v == -2.));
    }

    #[test]
    fn test_avg_pool_includes_padding() {
        let input = Array4::<f64>::ones((1, 1, 3, 3));
        let config = Pool2dConfig::new((3, 3), (1, 1), (1, 1));
        let out = avg_pool2d_forward(input.view(), &config).unwrap();
        assert!((out[[0, 0, 1, 1]] - 1.).abs() < 1e-12);
        assert!((out[[0, 0, 0, 0]] - 4. / 9.).abs() < 1e-12);
    }

    #[test]
    fn test_global_avg_pool() {
        let input = Array::from_shape_fn((2, 3, 2, 2), |(n, c, _, _)| (n * 3 + c) as f64);
        let out = global_avg_pool_forward(input.view());
        assert_eq!(out.dim(), (2, 3, 1, 1));
        assert_eq!(out[[1, 2, 0, 0]], 5.);
        let grad = Array4::<f64>::ones((2, 3, 1, 1));
        let gi = global_avg_pool_backward(input.dim(), grad.view());
        assert!((gi.sum() - 6.).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn test_tiled_pools_bound_each_other(input in array4((2, 3, 4, 4))) {
            let config = Pool2dConfig::new((2, 2), (2, 2), (0, 0));
            let (max, _) = max_pool2d_forward(input.view(), &config).unwrap();
            let avg = avg_pool2d_forward(input.view(), &config).unwrap();
            prop_assert!(max.iter().zip(avg.iter()).all(|(m, a)| m >= a));
            prop_assert!((avg.sum() * 4. - input.sum()).abs() < 1e-9);
        }
    }
}
