//! Dense reference backbone with frozen normalization statistics.
//!
//! A small stack of fully connected layers, each followed by a normalization
//! layer that uses *frozen* running statistics, with ReLU between layers. The
//! feature vector is the last normalized layer output. Forward and backward
//! passes are written out layer by layer; the backward pass only ever
//! produces a gradient for the input, which is exactly the contract the
//! reconstruction loop needs.

use ndarray::{Array1, Array2, Axis};

use crate::error::{RehearsalError, Result};
use crate::network::{Backbone, LayerStats, StatGrad};
use crate::tensor::ImageTensor;
use crate::EPSILON;

#[derive(Debug, Clone)]
struct DenseLayer {
    /// `(out, in)` weight matrix
    weights: Array2<f32>,
    bias: Array1<f32>,
    running: LayerStats,
}

impl DenseLayer {
    fn out_dim(&self) -> usize {
        self.weights.dim().0
    }
}

/// Reference [`Backbone`] implementation used by tests and experiments.
#[derive(Debug, Clone)]
pub struct DenseBackbone {
    input_shape: (usize, usize, usize),
    layers: Vec<DenseLayer>,
}

impl DenseBackbone {
    /// Builds a backbone with the given hidden widths; the last width is the
    /// feature dimension. Weights are deterministic from the seed; running
    /// statistics start at `(0, 1)` until [`DenseBackbone::calibrate`] is
    /// called.
    pub fn from_seed(seed: u64, input_shape: (usize, usize, usize), widths: &[usize]) -> Self {
        assert!(!widths.is_empty(), "at least one layer width required");
        let (h, w, c) = input_shape;
        let mut in_dim = h * w * c;
        let mut state = if seed == 0 { 1 } else { seed };

        let mut layers = Vec::with_capacity(widths.len());
        for &out_dim in widths {
            let scale = 1.0 / (in_dim as f32).sqrt();
            let weights = Array2::from_shape_fn((out_dim, in_dim), |_| {
                state = lcg(state);
                (normalized(state) - 0.5) * 2.0 * scale
            });
            let bias = Array1::from_shape_fn(out_dim, |_| {
                state = lcg(state);
                (normalized(state) - 0.5) * 0.1
            });
            layers.push(DenseLayer {
                weights,
                bias,
                running: LayerStats {
                    mean: Array1::zeros(out_dim),
                    var: Array1::ones(out_dim),
                },
            });
            in_dim = out_dim;
        }

        Self {
            input_shape,
            layers,
        }
    }

    /// Freezes running statistics from a calibration batch.
    ///
    /// Each layer's running `(mean, variance)` is set to the batch statistics
    /// observed while propagating with the freshly set values, mimicking the
    /// statistics a trained network carries when it is saved as "old".
    pub fn calibrate(&mut self, batch: &[ImageTensor]) -> Result<()> {
        let mut activations = self.flatten_batch(batch)?;
        for layer in self.layers.iter_mut() {
            let pre = linear(&activations, &layer.weights, &layer.bias);
            let stats = batch_stats(&pre);
            layer.running = stats.clone();
            let normalized = normalize(&pre, &layer.running);
            activations = relu(&normalized);
        }
        Ok(())
    }

    fn flatten_batch(&self, batch: &[ImageTensor]) -> Result<Array2<f32>> {
        let (h, w, c) = self.input_shape;
        let dim = h * w * c;
        let mut flat = Array2::zeros((batch.len(), dim));
        for (row, image) in batch.iter().enumerate() {
            if image.shape() != self.input_shape {
                let (ih, iw, ic) = image.shape();
                return Err(RehearsalError::ShapeMismatch {
                    expected: vec![h, w, c],
                    got: vec![ih, iw, ic],
                });
            }
            for (col, value) in image.as_flat().iter().enumerate() {
                flat[[row, col]] = *value;
            }
        }
        Ok(flat)
    }

    /// Forward pass caching pre-normalization activations per layer.
    fn forward_trace(&self, batch: &[ImageTensor]) -> Result<ForwardTrace> {
        let mut activations = self.flatten_batch(batch)?;
        let mut pre_norm = Vec::with_capacity(self.layers.len());
        let mut normalized_out = Vec::with_capacity(self.layers.len());

        let last = self.layers.len() - 1;
        for (idx, layer) in self.layers.iter().enumerate() {
            let pre = linear(&activations, &layer.weights, &layer.bias);
            let norm = normalize(&pre, &layer.running);
            activations = if idx == last { norm.clone() } else { relu(&norm) };
            pre_norm.push(pre);
            normalized_out.push(norm);
        }

        Ok(ForwardTrace {
            pre_norm,
            normalized: normalized_out,
            features: activations,
        })
    }
}

struct ForwardTrace {
    pre_norm: Vec<Array2<f32>>,
    normalized: Vec<Array2<f32>>,
    features: Array2<f32>,
}

impl Backbone for DenseBackbone {
    fn input_shape(&self) -> (usize, usize, usize) {
        self.input_shape
    }

    fn feature_dim(&self) -> usize {
        self.layers.last().map(DenseLayer::out_dim).unwrap_or(0)
    }

    fn norm_layer_count(&self) -> usize {
        self.layers.len()
    }

    fn running_stats(&self, layer: usize) -> &LayerStats {
        &self.layers[layer].running
    }

    fn extract_features(&self, batch: &[ImageTensor]) -> Result<Array2<f32>> {
        Ok(self.forward_trace(batch)?.features)
    }

    fn forward_with_stats(&self, batch: &[ImageTensor]) -> Result<(Array2<f32>, Vec<LayerStats>)> {
        let trace = self.forward_trace(batch)?;
        let stats = trace.pre_norm.iter().map(batch_stats).collect();
        Ok((trace.features, stats))
    }

    fn input_gradient(
        &self,
        batch: &[ImageTensor],
        grad_features: &Array2<f32>,
        grad_stats: &[StatGrad],
    ) -> Result<Vec<ImageTensor>> {
        if grad_stats.len() != self.layers.len() {
            return Err(RehearsalError::ShapeMismatch {
                expected: vec![self.layers.len()],
                got: vec![grad_stats.len()],
            });
        }
        let trace = self.forward_trace(batch)?;
        let batch_size = batch.len();
        if grad_features.dim() != trace.features.dim() {
            return Err(RehearsalError::ShapeMismatch {
                expected: vec![trace.features.dim().0, trace.features.dim().1],
                got: vec![grad_features.dim().0, grad_features.dim().1],
            });
        }

        let mut grad_norm = grad_features.clone();
        let mut grad_input: Option<Array2<f32>> = None;

        for idx in (0..self.layers.len()).rev() {
            let layer = &self.layers[idx];
            let pre = &trace.pre_norm[idx];
            let stats = batch_stats(pre);

            // d norm / d pre through the frozen running statistics
            let inv_std = layer.running.var.mapv(|v| 1.0 / (v + EPSILON).sqrt());
            let mut grad_pre = &grad_norm * &inv_std;

            // Inject statistics-loss gradients at the batch (mean, var)
            let gs = &grad_stats[idx];
            let n = batch_size as f32;
            for row in 0..batch_size {
                for col in 0..layer.out_dim() {
                    let centered = pre[[row, col]] - stats.mean[col];
                    grad_pre[[row, col]] +=
                        gs.d_mean[col] / n + gs.d_var[col] * 2.0 * centered / n;
                }
            }

            let upstream = grad_pre.dot(&layer.weights);
            if idx == 0 {
                grad_input = Some(upstream);
            } else {
                // ReLU mask from the previous layer's normalized output
                let prev_norm = &trace.normalized[idx - 1];
                grad_norm = upstream;
                grad_norm
                    .iter_mut()
                    .zip(prev_norm.iter())
                    .for_each(|(g, &v)| {
                        if v <= 0.0 {
                            *g = 0.0;
                        }
                    });
            }
        }

        let grad_input = grad_input.expect("at least one layer");
        let (h, w, c) = self.input_shape;
        let mut result = Vec::with_capacity(batch_size);
        for row in 0..batch_size {
            let flat = grad_input.row(row).to_owned();
            let pixels = flat
                .into_shape((h, w, c))
                .expect("gradient matches input shape");
            result.push(ImageTensor::from_array(pixels));
        }
        Ok(result)
    }

    fn copy_frozen(&self) -> Box<dyn Backbone> {
        Box::new(self.clone())
    }
}

fn linear(input: &Array2<f32>, weights: &Array2<f32>, bias: &Array1<f32>) -> Array2<f32> {
    input.dot(&weights.t()) + bias
}

fn normalize(pre: &Array2<f32>, running: &LayerStats) -> Array2<f32> {
    let inv_std = running.var.mapv(|v| 1.0 / (v + EPSILON).sqrt());
    (pre - &running.mean) * &inv_std
}

fn relu(input: &Array2<f32>) -> Array2<f32> {
    input.mapv(|v| v.max(0.0))
}

fn batch_stats(pre: &Array2<f32>) -> LayerStats {
    let n = pre.dim().0.max(1) as f32;
    let mean = pre.sum_axis(Axis(0)) / n;
    let mut var = Array1::zeros(pre.dim().1);
    for row in pre.rows() {
        for (col, value) in row.iter().enumerate() {
            let diff = value - mean[col];
            var[col] += diff * diff;
        }
    }
    var /= n;
    LayerStats { mean, var }
}

fn lcg(seed: u64) -> u64 {
    seed.wrapping_mul(1664525).wrapping_add(1013904223)
}

fn normalized(value: u64) -> f32 {
    let fraction = (value & 0xFFFF_FFFF) as f32 / (u32::MAX as f32);
    fraction.clamp(0.0, 1.0)
}
