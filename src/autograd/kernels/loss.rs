//! Classification losses over `(N, K)` logits.
use crate::{NasError, NasFloat};
use ndarray::{Array2, ArrayView2, Axis};

/// One-hot targets mixed with a uniform distribution by `smoothing`.
///
/// # Errors
/// Labels outside `0..n_classes`.
pub fn smooth_targets(
    labels: &[usize],
    n_classes: usize,
    smoothing: NasFloat,
) -> Result<Array2<NasFloat>, NasError> {
    if let Some(bad) = labels.iter().find(|&&l| l >= n_classes) {
        return Err(NasError::shape_mismatch(format!(
            "label {} out of range for {} classes",
            bad, n_classes
        )));
    }
    let off = smoothing / n_classes as NasFloat;
    let mut targets = Array2::from_elem((labels.len(), n_classes), off);
    for (row, &label) in labels.iter().enumerate() {
        targets[[row, label]] += 1. - smoothing;
    }
    Ok(targets)
}

fn log_softmax_rows(logits: ArrayView2<NasFloat>) -> Array2<NasFloat> {
    let mut out = logits.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(NasFloat::NEG_INFINITY, |acc, &v| acc.max(v));
        let log_sum = row.mapv(|v| (v - max).exp()).sum().ln() + max;
        row.mapv_inplace(|v| v - log_sum);
    }
    out
}

/// Batch mean of the cross entropy between `softmax(logits)` and soft `targets`.
/// Also returns the gradient w.r.t. the logits.
///
/// # Errors
pub fn softmax_cross_entropy(
    logits: ArrayView2<NasFloat>,
    targets: ArrayView2<NasFloat>,
) -> Result<(NasFloat, Array2<NasFloat>), NasError> {
    if logits.dim() != targets.dim() {
        return Err(NasError::shape_mismatch(format!(
            "logits {:?} and targets {:?}",
            logits.dim(),
            targets.dim()
        )));
    }
    let batch = logits.len_of(Axis(0)).max(1) as NasFloat;
    let log_probs = log_softmax_rows(logits);
    let loss = -(&log_probs * &targets).sum() / batch;
    let grad = (log_probs.mapv(NasFloat::exp) - targets) / batch;
    Ok((loss, grad))
}

/// Fraction of rows whose arg-max differs from the label.
pub fn top1_error(logits: ArrayView2<NasFloat>, labels: &[usize]) -> NasFloat {
    if labels.is_empty() {
        return 0.;
    }
    let wrong = logits
        .axis_iter(Axis(0))
        .zip(labels.iter())
        .filter(|&(ref row, &label)| {
            let best = row
                .iter()
                .enumerate()
                .fold((0, NasFloat::NEG_INFINITY), |acc, (i, &v)| {
                    if v > acc.1 {
                        (i, v)
                    } else {
                        acc
                    }
                })
                .0;
            best != label
        })
        .count();
    wrong as NasFloat / labels.len() as NasFloat
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_uniform_logits_give_log_k() {
        let logits = Array2::<f64>::zeros((2, 4));
        let targets = smooth_targets(&[0, 3], 4, 0.).unwrap();
        let (loss, grad) = softmax_cross_entropy(logits.view(), targets.view()).unwrap();
        assert_abs_diff_eq!(loss, 4f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(grad[[0, 0]], (0.25 - 1.) / 2., epsilon = 1e-12);
        assert_abs_diff_eq!(grad.sum(), 0., epsilon = 1e-12);
    }

    #[test]
    fn test_label_smoothing_rows_sum_to_one() {
        let targets = smooth_targets(&[1, 2], 3, 0.1).unwrap();
        for row in targets.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1., epsilon = 1e-12);
        }
        assert_abs_diff_eq!(targets[[0, 1]], 0.9 + 0.1 / 3., epsilon = 1e-12);
        assert!(smooth_targets(&[3], 3, 0.).is_err());
    }

    #[test]
    fn test_top1_error() {
        let logits = array![[0., 1.], [2., 1.], [0., 5.]];
        assert_abs_diff_eq!(top1_error(logits.view(), &[1, 1, 1]), 1. / 3.);
    }
}
