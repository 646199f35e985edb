//! Convolution and activation layers with explicit backward passes
//!
//! Tensors use the `[batch, channels, height, width]` layout throughout.
//! Convolutions are stride 1 with zero "same" padding, so every layer
//! preserves the spatial size of its input.

use std::collections::BTreeMap;

use ndarray::{s, Array1, Array3, Array4, ArrayD, ArrayView3, ArrayViewD, ArrayViewMutD, Axis, Zip};
use rand::Rng;
use rayon::prelude::*;

use crate::{Result, SsmError};

/// Named parameter tensors of a model
pub type StateDict = BTreeMap<String, ArrayD<f32>>;

/// Overlap of an axis of length `len` with itself shifted by `offset`.
///
/// Returns `(dest_start, src_start, count)` such that `dest[i] = src[i + offset]`
/// is valid for `count` consecutive positions.
fn shifted_span(len: usize, offset: isize) -> Option<(usize, usize, usize)> {
    let count = len as isize - offset.abs();
    if count <= 0 {
        return None;
    }
    let dest_start = (-offset).max(0) as usize;
    let src_start = offset.max(0) as usize;
    Some((dest_start, src_start, count as usize))
}

/// Stack per-sample results back into a batch
pub(crate) fn stack_samples(
    samples: &[Array3<f32>],
    shape: (usize, usize, usize, usize),
) -> Result<Array4<f32>> {
    if samples.is_empty() {
        return Ok(Array4::zeros(shape));
    }
    let views: Vec<ArrayView3<f32>> = samples.iter().map(|a| a.view()).collect();
    ndarray::stack(Axis(0), &views).map_err(|e| SsmError::Shape(e.to_string()))
}

/// Gradients produced by [`Conv2d::backward`]
#[derive(Debug, Clone)]
pub struct ConvGrads {
    /// Gradient with respect to the kernel
    pub weight: Array4<f32>,
    /// Gradient with respect to the bias
    pub bias: Array1<f32>,
    /// Gradient with respect to the layer input, when requested
    pub input: Option<Array4<f32>>,
}

impl ConvGrads {
    /// Take the input gradient out of the result
    pub fn take_input(&mut self) -> Result<Array4<f32>> {
        self.input
            .take()
            .ok_or_else(|| SsmError::Shape("input gradient was not computed".to_string()))
    }

    /// Parameter gradients in `[weight, bias]` order
    pub fn into_tensors(self) -> [ArrayD<f32>; 2] {
        [self.weight.into_dyn(), self.bias.into_dyn()]
    }
}

/// 2D convolution, stride 1, zero "same" padding
#[derive(Debug, Clone)]
pub struct Conv2d {
    /// Kernel of shape `[out, in, k, k]`
    pub weight: Array4<f32>,
    /// Per-output-channel bias
    pub bias: Array1<f32>,
}

impl Conv2d {
    /// Create a convolution with He-uniform weights and zero bias
    pub fn new<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if in_channels == 0 || out_channels == 0 {
            return Err(SsmError::InvalidConfig("Conv2d channels must be positive".to_string()));
        }
        if kernel_size % 2 == 0 {
            return Err(SsmError::InvalidConfig(format!(
                "Conv2d kernel size must be odd, got {}",
                kernel_size
            )));
        }

        let fan_in = (in_channels * kernel_size * kernel_size) as f32;
        let bound = (6.0 / fan_in).sqrt();
        let weight = Array4::from_shape_fn(
            (out_channels, in_channels, kernel_size, kernel_size),
            |_| rng.gen_range(-bound..bound),
        );

        Ok(Conv2d {
            weight,
            bias: Array1::zeros(out_channels),
        })
    }

    /// Number of input channels
    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    /// Number of output channels
    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    /// Side of the square kernel
    pub fn kernel_size(&self) -> usize {
        self.weight.dim().2
    }

    fn check_input(&self, input: &Array4<f32>) -> Result<()> {
        if input.dim().1 != self.in_channels() {
            return Err(SsmError::Shape(format!(
                "Conv2d expects {} input channels, got {}",
                self.in_channels(),
                input.dim().1
            )));
        }
        Ok(())
    }

    /// Forward pass over a batch
    pub fn forward(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        self.check_input(input)?;
        let (batch, _, height, width) = input.dim();

        let samples: Vec<Array3<f32>> = (0..batch)
            .into_par_iter()
            .map(|b| self.forward_single(input.index_axis(Axis(0), b)))
            .collect();

        stack_samples(&samples, (batch, self.out_channels(), height, width))
    }

    fn forward_single(&self, x: ArrayView3<f32>) -> Array3<f32> {
        let (_, height, width) = x.dim();
        let (out_c, in_c, k, _) = self.weight.dim();
        let pad = (k / 2) as isize;
        let mut y = Array3::zeros((out_c, height, width));

        for o in 0..out_c {
            y.index_axis_mut(Axis(0), o).fill(self.bias[o]);
            for c in 0..in_c {
                let xc = x.index_axis(Axis(0), c);
                for u in 0..k {
                    let Some((dr, sr, nr)) = shifted_span(height, u as isize - pad) else {
                        continue;
                    };
                    for v in 0..k {
                        let Some((dc, sc, nc)) = shifted_span(width, v as isize - pad) else {
                            continue;
                        };
                        let mut dest = y.slice_mut(s![o, dr..dr + nr, dc..dc + nc]);
                        dest.scaled_add(self.weight[[o, c, u, v]], &xc.slice(s![sr..sr + nr, sc..sc + nc]));
                    }
                }
            }
        }

        y
    }

    /// Backward pass over a batch.
    ///
    /// `input` must be the tensor given to [`Conv2d::forward`] and
    /// `grad_output` the gradient of the loss with respect to its output.
    pub fn backward(
        &self,
        input: &Array4<f32>,
        grad_output: &Array4<f32>,
        need_input_grad: bool,
    ) -> Result<ConvGrads> {
        self.check_input(input)?;
        let (batch, in_c, height, width) = input.dim();
        if grad_output.dim() != (batch, self.out_channels(), height, width) {
            return Err(SsmError::Shape(format!(
                "Conv2d gradient shape {:?} does not match output shape {:?}",
                grad_output.dim(),
                (batch, self.out_channels(), height, width)
            )));
        }

        let per_sample: Vec<_> = (0..batch)
            .into_par_iter()
            .map(|b| {
                self.backward_single(
                    input.index_axis(Axis(0), b),
                    grad_output.index_axis(Axis(0), b),
                    need_input_grad,
                )
            })
            .collect();

        let mut weight = Array4::zeros(self.weight.raw_dim());
        let mut bias = Array1::zeros(self.out_channels());
        let mut input_grads = Vec::with_capacity(batch);
        for (gw, gb, gx) in per_sample {
            weight += &gw;
            bias += &gb;
            if let Some(gx) = gx {
                input_grads.push(gx);
            }
        }

        let input = if need_input_grad {
            Some(stack_samples(&input_grads, (batch, in_c, height, width))?)
        } else {
            None
        };

        Ok(ConvGrads { weight, bias, input })
    }

    fn backward_single(
        &self,
        x: ArrayView3<f32>,
        gy: ArrayView3<f32>,
        need_input_grad: bool,
    ) -> (Array4<f32>, Array1<f32>, Option<Array3<f32>>) {
        let (_, height, width) = x.dim();
        let (out_c, in_c, k, _) = self.weight.dim();
        let pad = (k / 2) as isize;

        let mut gw = Array4::zeros(self.weight.raw_dim());
        let mut gb = Array1::zeros(out_c);
        let mut gx = if need_input_grad {
            Some(Array3::zeros(x.raw_dim()))
        } else {
            None
        };

        for o in 0..out_c {
            let gyo = gy.index_axis(Axis(0), o);
            gb[o] = gyo.sum();
            for c in 0..in_c {
                let xc = x.index_axis(Axis(0), c);
                for u in 0..k {
                    let Some((dr, sr, nr)) = shifted_span(height, u as isize - pad) else {
                        continue;
                    };
                    for v in 0..k {
                        let Some((dc, sc, nc)) = shifted_span(width, v as isize - pad) else {
                            continue;
                        };
                        let g_dest = gyo.slice(s![dr..dr + nr, dc..dc + nc]);
                        let x_src = xc.slice(s![sr..sr + nr, sc..sc + nc]);
                        gw[[o, c, u, v]] = Zip::from(&g_dest)
                            .and(&x_src)
                            .fold(0.0, |acc, &g, &xv| acc + g * xv);

                        if let Some(gx) = gx.as_mut() {
                            let mut dest = gx.slice_mut(s![c, sr..sr + nr, sc..sc + nc]);
                            dest.scaled_add(self.weight[[o, c, u, v]], &g_dest);
                        }
                    }
                }
            }
        }

        (gw, gb, gx)
    }

    /// Named read-only views of the parameters
    pub fn params(&self, prefix: &str) -> Vec<(String, ArrayViewD<'_, f32>)> {
        vec![
            (format!("{}.weight", prefix), self.weight.view().into_dyn()),
            (format!("{}.bias", prefix), self.bias.view().into_dyn()),
        ]
    }

    /// Named mutable views of the parameters
    pub fn params_mut(&mut self, prefix: &str) -> Vec<(String, ArrayViewMutD<'_, f32>)> {
        vec![
            (format!("{}.weight", prefix), self.weight.view_mut().into_dyn()),
            (format!("{}.bias", prefix), self.bias.view_mut().into_dyn()),
        ]
    }

}

/// Rectified linear unit
pub fn relu(x: &Array4<f32>) -> Array4<f32> {
    x.mapv(|v| v.max(0.0))
}

/// Gradient through [`relu`], given the activation output
pub fn relu_backward(grad: &Array4<f32>, output: &Array4<f32>) -> Array4<f32> {
    Zip::from(grad)
        .and(output)
        .map_collect(|&g, &y| if y > 0.0 { g } else { 0.0 })
}

/// Logistic sigmoid
pub fn sigmoid(x: &Array4<f32>) -> Array4<f32> {
    x.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

/// Gradient through [`sigmoid`], given the activation output
pub fn sigmoid_backward(grad: &Array4<f32>, output: &Array4<f32>) -> Array4<f32> {
    Zip::from(grad)
        .and(output)
        .map_collect(|&g, &y| g * y * (1.0 - y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_tensor(shape: (usize, usize, usize, usize), seed: u64) -> Array4<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array4::from_shape_fn(shape, |_| rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn test_shifted_span() {
        assert_eq!(shifted_span(5, 0), Some((0, 0, 5)));
        assert_eq!(shifted_span(5, 1), Some((0, 1, 4)));
        assert_eq!(shifted_span(5, -2), Some((2, 0, 3)));
        assert_eq!(shifted_span(2, 3), None);
    }

    #[test]
    fn test_identity_kernel() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut conv = Conv2d::new(1, 1, 3, &mut rng).unwrap();
        conv.weight.fill(0.0);
        conv.weight[[0, 0, 1, 1]] = 1.0;
        conv.bias[0] = 0.5;

        let x = random_tensor((2, 1, 5, 7), 1);
        let y = conv.forward(&x).unwrap();
        assert_eq!(y.dim(), (2, 1, 5, 7));
        for (a, b) in x.iter().zip(y.iter()) {
            assert!((a + 0.5 - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_zero_padding_at_border() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut conv = Conv2d::new(1, 1, 3, &mut rng).unwrap();
        conv.weight.fill(1.0);

        let x = Array4::ones((1, 1, 4, 4));
        let y = conv.forward(&x).unwrap();
        // Corners see a 2x2 neighbourhood, edges 2x3, interior 3x3
        assert_eq!(y[[0, 0, 0, 0]], 4.0);
        assert_eq!(y[[0, 0, 0, 1]], 6.0);
        assert_eq!(y[[0, 0, 1, 1]], 9.0);
    }

    #[test]
    fn test_rejects_wrong_channels() {
        let mut rng = StdRng::seed_from_u64(0);
        let conv = Conv2d::new(2, 3, 3, &mut rng).unwrap();
        let x = Array4::zeros((1, 1, 4, 4));
        assert!(conv.forward(&x).is_err());
        assert!(Conv2d::new(1, 1, 2, &mut rng).is_err());
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(3);
        let conv = Conv2d::new(2, 3, 3, &mut rng).unwrap();
        let x = random_tensor((2, 2, 5, 6), 4);
        let r = random_tensor((2, 3, 5, 6), 5);

        // L = sum(conv(x) * r) is linear in both weights and inputs
        let loss = |c: &Conv2d, x: &Array4<f32>| (&c.forward(x).unwrap() * &r).sum();
        let grads = conv.backward(&x, &r, true).unwrap();
        let eps = 1e-2;

        for &idx in &[[0, 0, 0, 0], [1, 1, 1, 1], [2, 0, 2, 1]] {
            let mut plus = conv.clone();
            plus.weight[idx] += eps;
            let mut minus = conv.clone();
            minus.weight[idx] -= eps;
            let numeric = (loss(&plus, &x) - loss(&minus, &x)) / (2.0 * eps);
            assert!((numeric - grads.weight[idx]).abs() < 1e-2, "weight {:?}", idx);
        }

        let numeric_bias = {
            let mut plus = conv.clone();
            plus.bias[1] += eps;
            let mut minus = conv.clone();
            minus.bias[1] -= eps;
            (loss(&plus, &x) - loss(&minus, &x)) / (2.0 * eps)
        };
        assert!((numeric_bias - grads.bias[1]).abs() < 1e-2);

        let input_grad = grads.input.unwrap();
        for &idx in &[[0, 0, 0, 0], [1, 1, 4, 5], [0, 1, 2, 3]] {
            let mut plus = x.clone();
            plus[idx] += eps;
            let mut minus = x.clone();
            minus[idx] -= eps;
            let numeric = (loss(&conv, &plus) - loss(&conv, &minus)) / (2.0 * eps);
            assert!((numeric - input_grad[idx]).abs() < 1e-2, "input {:?}", idx);
        }
    }

    #[test]
    fn test_activations() {
        let x = Array4::from_shape_vec((1, 1, 1, 3), vec![-1.0, 0.0, 2.0]).unwrap();
        let y = relu(&x);
        assert_eq!(y.as_slice().unwrap(), &[0.0, 0.0, 2.0]);

        let g = relu_backward(&Array4::ones((1, 1, 1, 3)), &y);
        assert_eq!(g.as_slice().unwrap(), &[0.0, 0.0, 1.0]);

        let s = sigmoid(&x);
        assert!((s[[0, 0, 0, 1]] - 0.5).abs() < 1e-6);
        let gs = sigmoid_backward(&Array4::ones((1, 1, 1, 3)), &s);
        assert!((gs[[0, 0, 0, 1]] - 0.25).abs() < 1e-6);
    }
}
