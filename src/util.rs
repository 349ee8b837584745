//! Utility functions
use crate::{NasError, NasFloat};
use ndarray::{Array1, ArrayView1};
use ndarray_stats::QuantileExt;

/// Padding that keeps the spatial extent for stride 1.
///
/// # Errors
/// Kernel sizes must be odd.
pub fn same_padding(kernel: usize) -> Result<usize, NasError> {
    if kernel % 2 == 0 {
        return Err(NasError::configuration(format!(
            "kernel size should be an odd number, got {}",
            kernel
        )));
    }
    Ok(kernel / 2)
}

/// Same padding for a 2-D kernel, scaled by the dilation.
///
/// # Errors
pub fn same_padding2(
    kernel: (usize, usize),
    dilation: (usize, usize),
) -> Result<(usize, usize), NasError> {
    Ok((
        same_padding(kernel.0)? * dilation.0,
        same_padding(kernel.1)? * dilation.1,
    ))
}

/// Rounds `v` to the nearest multiple of `divisor`, never going more than 10% below `v`.
pub fn make_divisible(v: NasFloat, divisor: usize, min_val: Option<usize>) -> usize {
    let min_val = min_val.unwrap_or(divisor);
    let d = divisor as NasFloat;
    let rounded = ((v + d / 2.) / d).floor() as usize * divisor;
    let mut new_v = rounded.max(min_val);
    if (new_v as NasFloat) < 0.9 * v {
        new_v += divisor;
    }
    new_v
}

/// Largest divisor of `n` that does not exceed `v`.
pub fn min_divisible_value(n: usize, v: usize) -> usize {
    if v >= n {
        return n;
    }
    let mut v = v.max(1);
    while n % v != 0 {
        v -= 1;
    }
    v
}

/// Numerically stable softmax of a vector.
pub fn softmax(x: ArrayView1<NasFloat>) -> Array1<NasFloat> {
    let max = x.fold(NasFloat::NEG_INFINITY, |acc, &v| acc.max(v));
    let exp = x.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    exp / sum
}

/// # Errors
/// Empty input or NaN entries.
pub fn argmax(x: ArrayView1<NasFloat>) -> Result<usize, NasError> {
    x.argmax()
        .map_err(|err| NasError::numeric(format!("argmax is undefined: {:?}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_same_padding_rejects_even_kernels() {
        assert_eq!(same_padding(3).unwrap(), 1);
        assert_eq!(same_padding(7).unwrap(), 3);
        assert!(matches!(
            same_padding(4),
            Err(NasError::Configuration { .. })
        ));
        assert_eq!(same_padding2((3, 5), (2, 1)).unwrap(), (2, 2));
    }

    #[test]
    fn test_min_divisible_value() {
        assert_eq!(min_divisible_value(32, 64), 32);
        assert_eq!(min_divisible_value(24, 16), 12);
        assert_eq!(min_divisible_value(7, 3), 1);
        assert_eq!(min_divisible_value(12, 0), 1);
    }

    #[test]
    fn test_make_divisible() {
        assert_eq!(make_divisible(10., 8, None), 16);
        assert_eq!(make_divisible(32., 8, None), 32);
        assert_eq!(make_divisible(3., 8, None), 8);
        assert_eq!(make_divisible(36., 8, None), 40);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(array![1., 2., 3., 1000.].view());
        assert_abs_diff_eq!(p.sum(), 1., epsilon = 1e-12);
        assert_eq!(argmax(p.view()).unwrap(), 3);
    }
}
