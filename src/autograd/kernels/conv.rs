//! Direct 2-D convolution over NCHW arrays.
//!
//! Weights are laid out as `(C_out, C_in / groups, K_h, K_w)`, the bias as `(C_out)`.
use crate::{NasError, NasFloat};
use itertools::Itertools;
use ndarray::{Array1, Array4, ArrayView1, ArrayView4};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conv2dConfig {
    pub stride: (usize, usize),
    pub pad: (usize, usize),
    pub dilation: (usize, usize),
    pub groups: usize,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            pad: (0, 0),
            dilation: (1, 1),
            groups: 1,
        }
    }
}

/// Output extent of a strided, padded and dilated window along one axis.
pub fn window_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
    dilation: usize,
) -> Option<usize> {
    if kernel == 0 || stride == 0 || dilation == 0 {
        return None;
    }
    let effective = dilation * (kernel - 1) + 1;
    let padded = input + 2 * pad;
    if padded < effective {
        return None;
    }
    Some((padded - effective) / stride + 1)
}

/// Output `(H_out, W_out)` of a convolution.
///
/// # Errors
pub fn conv2d_output_hw(
    input_hw: (usize, usize),
    kernel_hw: (usize, usize),
    config: &Conv2dConfig,
) -> Result<(usize, usize), NasError> {
    let h = window_output_size(
        input_hw.0,
        kernel_hw.0,
        config.stride.0,
        config.pad.0,
        config.dilation.0,
    );
    let w = window_output_size(
        input_hw.1,
        kernel_hw.1,
        config.stride.1,
        config.pad.1,
        config.dilation.1,
    );
    h.zip(w).ok_or_else(|| {
        NasError::shape_mismatch(format!(
            "kernel {:?} with {:?} does not fit input {:?}",
            kernel_hw, config, input_hw
        ))
    })
}

struct Geometry {
    batch: usize,
    c_in: usize,
    h_in: usize,
    w_in: usize,
    c_out: usize,
    c_in_group: usize,
    c_out_group: usize,
    k_h: usize,
    k_w: usize,
    h_out: usize,
    w_out: usize,
}

impl Geometry {
    fn new(
        input: &ArrayView4<NasFloat>,
        weight: &ArrayView4<NasFloat>,
        config: &Conv2dConfig,
    ) -> Result<Self, NasError> {
        let (batch, c_in, h_in, w_in) = input.dim();
        let (c_out, c_in_group, k_h, k_w) = weight.dim();
        if config.groups == 0 || c_in != c_in_group * config.groups || c_out % config.groups != 0
        {
            return Err(NasError::shape_mismatch(format!(
                "weight {:?} with {} groups does not match {} input channels",
                weight.dim(),
                config.groups,
                c_in
            )));
        }
        let (h_out, w_out) = conv2d_output_hw((h_in, w_in), (k_h, k_w), config)?;
        Ok(Self {
            batch,
            c_in,
            h_in,
            w_in,
            c_out,
            c_in_group,
            c_out_group: c_out / config.groups,
            k_h,
            k_w,
            h_out,
            w_out,
        })
    }

    /// Input coordinate hit by kernel tap `k` of output position `o`, if not in padding.
    fn input_index(
        o: usize,
        k: usize,
        stride: usize,
        dilation: usize,
        pad: usize,
        size: usize,
    ) -> Option<usize> {
        let y = o * stride + k * dilation;
        if y < pad || y >= size + pad {
            // Assumption that padding value is 0
            None
        } else {
            Some(y - pad)
        }
    }
}

/// # Errors
/// If improper shapes are passed in
pub fn conv2d_forward(
    input: ArrayView4<NasFloat>,
    weight: ArrayView4<NasFloat>,
    bias: Option<ArrayView1<NasFloat>>,
    config: &Conv2dConfig,
) -> Result<Array4<NasFloat>, NasError> {
    let g = Geometry::new(&input, &weight, config)?;
    if let Some(ref b) = bias {
        if b.len() != g.c_out {
            return Err(NasError::shape_mismatch(format!(
                "bias of length {} for {} output channels",
                b.len(),
                g.c_out
            )));
        }
    }
    let mut output = Array4::<NasFloat>::zeros((g.batch, g.c_out, g.h_out, g.w_out));
    for (n, oc) in (0..g.batch).cartesian_product(0..g.c_out) {
        let group = oc / g.c_out_group;
        let b = bias.as_ref().map_or(0., |b| b[oc]);
        for (y_out, x_out) in (0..g.h_out).cartesian_product(0..g.w_out) {
            let mut acc = b;
            for k_y in 0..g.k_h {
                let y_in = match Geometry::input_index(
                    y_out,
                    k_y,
                    config.stride.0,
                    config.dilation.0,
                    config.pad.0,
                    g.h_in,
                ) {
                    Some(y) => y,
                    None => continue,
                };
                for k_x in 0..g.k_w {
                    let x_in = match Geometry::input_index(
                        x_out,
                        k_x,
                        config.stride.1,
                        config.dilation.1,
                        config.pad.1,
                        g.w_in,
                    ) {
                        Some(x) => x,
                        None => continue,
                    };
                    for f_in in 0..g.c_in_group {
                        let c = group * g.c_in_group + f_in;
                        acc += input[[n, c, y_in, x_in]] * weight[[oc, f_in, k_y, k_x]];
                    }
                }
            }
            output[[n, oc, y_out, x_out]] = acc;
        }
    }
    Ok(output)
}

/// Gradients w.r.t. input, weight and bias of [`conv2d_forward`].
///
/// # Errors
pub fn conv2d_backward(
    input: ArrayView4<NasFloat>,
    weight: ArrayView4<NasFloat>,
    grad_output: ArrayView4<NasFloat>,
    config: &Conv2dConfig,
) -> Result<(Array4<NasFloat>, Array4<NasFloat>, Array1<NasFloat>), NasError> {
    let g = Geometry::new(&input, &weight, config)?;
    if grad_output.dim() != (g.batch, g.c_out, g.h_out, g.w_out) {
        return Err(NasError::shape_mismatch(format!(
            "gradient {:?} does not match convolution output",
            grad_output.dim()
        )));
    }
    let mut grad_input = Array4::<NasFloat>::zeros(input.raw_dim());
    let mut grad_weight = Array4::<NasFloat>::zeros(weight.raw_dim());
    let mut grad_bias = Array1::<NasFloat>::zeros(g.c_out);
    debug_assert_eq!(g.c_in, g.c_in_group * config.groups);

    for (n, oc) in (0..g.batch).cartesian_product(0..g.c_out) {
        let group = oc / g.c_out_group;
        for (y_out, x_out) in (0..g.h_out).cartesian_product(0..g.w_out) {
            let go = grad_output[[n, oc, y_out, x_out]];
            grad_bias[oc] += go;
            if go == 0. {
                continue;
            }
            for k_y in 0..g.k_h {
                let y_in = match Geometry::input_index(
                    y_out,
                    k_y,
                    config.stride.0,
                    config.dilation.0,
                    config.pad.0,
                    g.h_in,
                ) {
                    Some(y) => y,
                    None => continue,
                };
                for k_x in 0..g.k_w {
                    let x_in = match Geometry::input_index(
                        x_out,
                        k_x,
                        config.stride.1,
                        config.dilation.1,
                        config.pad.1,
                        g.w_in,
                    ) {
                        Some(x) => x,
                        None => continue,
                    };
                    for f_in in 0..g.c_in_group {
                        let c = group * g.c_in_group + f_in;
                        grad_input[[n, c, y_in, x_in]] += go * weight[[oc, f_in, k_y, k_x]];
                        grad_weight[[oc, f_in, k_y, k_x]] += go * input[[n, c, y_in, x_in]];
                    }
                }
            }
        }
    }
    Ok((grad_input, grad_weight, grad_bias))
}
