//! Batch normalization over the channel axis of NCHW arrays.
use crate::{NasError, NasFloat};
use ndarray::{Array1, Array4, ArrayView1, ArrayView4, ArrayViewMut1, Axis, Zip};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchNormConfig {
    /// Weight of the previous running statistic in the moving average.
    pub decay_rate: NasFloat,
    pub eps: NasFloat,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        Self {
            decay_rate: 0.9,
            eps: 1e-5,
        }
    }
}

/// What the backward pass needs from the forward pass.
#[derive(Clone, Debug)]
pub struct BatchNormCache {
    pub normalized: Array4<NasFloat>,
    pub inv_std: Array1<NasFloat>,
    /// Whether batch statistics (rather than running statistics) normalised the input.
    pub batch_stat: bool,
}

fn check_channels(
    input: &ArrayView4<NasFloat>,
    others: &[(&str, usize)],
) -> Result<usize, NasError> {
    let channels = input.len_of(Axis(1));
    for (name, len) in others {
        if *len != channels {
            return Err(NasError::shape_mismatch(format!(
                "batch norm {} has {} entries for {} channels",
                name, len, channels
            )));
        }
    }
    Ok(channels)
}

/// Normalises with batch statistics and folds them into the running statistics.
///
/// # Errors
pub fn batch_norm_train(
    input: ArrayView4<NasFloat>,
    gamma: ArrayView1<NasFloat>,
    beta: ArrayView1<NasFloat>,
    mut running_mean: ArrayViewMut1<NasFloat>,
    mut running_var: ArrayViewMut1<NasFloat>,
    config: &BatchNormConfig,
) -> Result<(Array4<NasFloat>, BatchNormCache), NasError> {
    let channels = check_channels(
        &input,
        &[
            ("gamma", gamma.len()),
            ("beta", beta.len()),
            ("running mean", running_mean.len()),
            ("running var", running_var.len()),
        ],
    )?;
    let (n, _, h, w) = input.dim();
    let count = (n * h * w) as NasFloat;
    if count == 0. {
        return Err(NasError::shape_mismatch("batch norm over an empty batch"));
    }
    let mean = Array1::from_shape_fn(channels, |c| input.index_axis(Axis(1), c).sum() / count);
    let var = Array1::from_shape_fn(channels, |c| {
        let m = mean[c];
        input
            .index_axis(Axis(1), c)
            .fold(0., |acc, &v| acc + (v - m) * (v - m))
            / count
    });
    let inv_std = var.mapv(|v| 1. / (v + config.eps).sqrt());

    let normalized = Array4::from_shape_fn(input.raw_dim(), |(i, c, y, x)| {
        (input[[i, c, y, x]] - mean[c]) * inv_std[c]
    });
    let output = Array4::from_shape_fn(input.raw_dim(), |(i, c, y, x)| {
        gamma[c] * normalized[[i, c, y, x]] + beta[c]
    });

    let d = config.decay_rate;
    Zip::from(&mut running_mean)
        .and(&mean)
        .for_each(|r, &m| *r = d * *r + (1. - d) * m);
    Zip::from(&mut running_var)
        .and(&var)
        .for_each(|r, &v| *r = d * *r + (1. - d) * v);

    Ok((
        output,
        BatchNormCache {
            normalized,
            inv_std,
            batch_stat: true,
        },
    ))
}

/// Normalises with the running statistics.
///
/// # Errors
pub fn batch_norm_eval(
    input: ArrayView4<NasFloat>,
    gamma: ArrayView1<NasFloat>,
    beta: ArrayView1<NasFloat>,
    running_mean: ArrayView1<NasFloat>,
    running_var: ArrayView1<NasFloat>,
    config: &BatchNormConfig,
) -> Result<(Array4<NasFloat>, BatchNormCache), NasError> {
    check_channels(
        &input,
        &[
            ("gamma", gamma.len()),
            ("beta", beta.len()),
            ("running mean", running_mean.len()),
            ("running var", running_var.len()),
        ],
    )?;
    let inv_std = running_var.mapv(|v| 1. / (v + config.eps).sqrt());
    let normalized = Array4::from_shape_fn(input.raw_dim(), |(i, c, y, x)| {
        (input[[i, c, y, x]] - running_mean[c]) * inv_std[c]
    });
    let output = Array4::from_shape_fn(input.raw_dim(), |(i, c, y, x)| {
        gamma[c] * normalized[[i, c, y, x]] + beta[c]
    });
    Ok((
        output,
        BatchNormCache {
            normalized,
            inv_std,
            batch_stat: false,
        },
    ))
}

/// Gradients w.r.t. input, gamma and beta.
pub fn batch_norm_backward(
    grad_output: ArrayView4<NasFloat>,
    gamma: ArrayView1<NasFloat>,
    cache: &BatchNormCache,
) -> (Array4<NasFloat>, Array1<NasFloat>, Array1<NasFloat>) {
    let channels = gamma.len();
    let (n, _, h, w) = grad_output.dim();
    let count = (n * h * w) as NasFloat;

    let grad_beta = Array1::from_shape_fn(channels, |c| grad_output.index_axis(Axis(1), c).sum());
    let grad_gamma = Array1::from_shape_fn(channels, |c| {
        Zip::from(grad_output.index_axis(Axis(1), c))
            .and(cache.normalized.index_axis(Axis(1), c))
            .fold(0., |acc, &g, &xh| acc + g * xh)
    });

    let grad_input = if cache.batch_stat {
        Array4::from_shape_fn(grad_output.raw_dim(), |(i, c, y, x)| {
            let dxhat = grad_output[[i, c, y, x]] * gamma[c];
            let xh = cache.normalized[[i, c, y, x]];
            cache.inv_std[c] / count
                * (count * dxhat - gamma[c] * grad_beta[c] - xh * gamma[c] * grad_gamma[c])
        })
    } else {
        Array4::from_shape_fn(grad_output.raw_dim(), |(i, c, y, x)| {
            grad_output[[i, c, y, x]] * gamma[c] * cache.inv_std[c]
        })
    };
    (grad_input, grad_gamma, grad_beta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;

    #[test]
    fn test_train_normalizes_per_channel() {
        let input = Array::from_shape_fn((2, 2, 2, 2), |(n, c, y, x)| {
            (n * 8 + y * 2 + x) as f64 * if c == 0 { 1. } else { 10. }
        });
        let gamma = Array1::<f64>::ones(2);
        let beta = Array1::<f64>::zeros(2);
        let mut rm = Array1::<f64>::zeros(2);
        let mut rv = Array1::<f64>::ones(2);
        let (out, cache) = batch_norm_train(
            input.view(),
            gamma.view(),
            beta.view(),
            rm.view_mut(),
            rv.view_mut(),
            &BatchNormConfig::default(),
        )
        .unwrap();
        for c in 0..2 {
            let channel = out.index_axis(Axis(1), c);
            assert_abs_diff_eq!(channel.sum(), 0., epsilon = 1e-9);
            let var = channel.fold(0., |acc, &v| acc + v * v) / 8.;
            assert_abs_diff_eq!(var, 1., epsilon = 1e-4);
        }
        assert!(cache.batch_stat);
        // mean of channel 0 is 5.5, folded in with weight 0.1
        assert_abs_diff_eq!(rm[0], 0.55, epsilon = 1e-12);
    }

    #[test]
    fn test_eval_uses_running_statistics() {
        let input = Array4::<f64>::from_elem((1, 1, 1, 2), 3.);
        let gamma = Array1::from(vec![2.]);
        let beta = Array1::from(vec![1.]);
        let rm = Array1::from(vec![1.]);
        let rv = Array1::from(vec![4. - 1e-5]);
        let (out, _) = batch_norm_eval(
            input.view(),
            gamma.view(),
            beta.view(),
            rm.view(),
            rv.view(),
            &BatchNormConfig::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(out[[0, 0, 0, 0]], 3., epsilon = 1e-9);
    }
}
