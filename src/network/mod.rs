//! Backbone capability interface.
//!
//! The convolutional backbone itself is an external collaborator; the
//! rehearsal core only needs feature extraction, per-layer batch statistics
//! alongside a forward pass, a gradient with respect to the *input* (network
//! parameters stay frozen), and a frozen snapshot. One interface covers every
//! execution wrapping, so no call site branches on how the network is run.

pub mod dense;

pub use dense::DenseBackbone;

use ndarray::{Array1, Array2};

use crate::error::Result;
use crate::tensor::ImageTensor;

/// Per-unit normalization statistics of one layer.
#[derive(Debug, Clone)]
pub struct LayerStats {
    pub mean: Array1<f32>,
    pub var: Array1<f32>,
}

impl LayerStats {
    pub fn zeros(dim: usize) -> Self {
        Self {
            mean: Array1::zeros(dim),
            var: Array1::zeros(dim),
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }
}

/// Gradient of a scalar objective with respect to one layer's batch
/// `(mean, variance)`, injected into [`Backbone::input_gradient`].
#[derive(Debug, Clone)]
pub struct StatGrad {
    pub d_mean: Array1<f32>,
    pub d_var: Array1<f32>,
}

impl StatGrad {
    pub fn zeros(dim: usize) -> Self {
        Self {
            d_mean: Array1::zeros(dim),
            d_var: Array1::zeros(dim),
        }
    }
}

/// Frozen-network capabilities required by the rehearsal core.
pub trait Backbone {
    /// Expected `(height, width, channels)` of input images.
    fn input_shape(&self) -> (usize, usize, usize);

    /// Dimension of the extracted feature vector.
    fn feature_dim(&self) -> usize;

    /// Number of normalization layers carrying frozen running statistics.
    fn norm_layer_count(&self) -> usize;

    /// Long-run `(mean, variance)` frozen into the given normalization layer.
    fn running_stats(&self, layer: usize) -> &LayerStats;

    /// Feature vectors for a batch, one row per image.
    fn extract_features(&self, batch: &[ImageTensor]) -> Result<Array2<f32>>;

    /// Forward pass that also reports each normalization layer's empirical
    /// batch statistics.
    fn forward_with_stats(&self, batch: &[ImageTensor]) -> Result<(Array2<f32>, Vec<LayerStats>)>;

    /// Gradient of a scalar objective with respect to the input batch.
    ///
    /// `grad_features` is the objective's gradient at the feature output;
    /// `grad_stats` carries per-layer gradients at the batch statistics.
    /// No gradient reaches network parameters.
    fn input_gradient(
        &self,
        batch: &[ImageTensor],
        grad_features: &Array2<f32>,
        grad_stats: &[StatGrad],
    ) -> Result<Vec<ImageTensor>>;

    /// Snapshot with parameters and running statistics frozen.
    fn copy_frozen(&self) -> Box<dyn Backbone>;
}

/// Extracts the feature vector of a single image.
pub fn extract_feature(backbone: &dyn Backbone, image: &ImageTensor) -> Result<Array1<f32>> {
    let features = backbone.extract_features(std::slice::from_ref(image))?;
    Ok(features.row(0).to_owned())
}
