//! Image-prior regularizers with analytic gradients.
//!
//! Total-variation penalties over 4-neighbor and diagonal pixel differences
//! plus an L2 image-norm penalty. Each returns both the scalar loss and its
//! gradient with respect to the image, so the reconstruction loop needs no
//! numeric differentiation for the prior terms.

use ndarray::Array3;

use crate::tensor::ImageTensor;
use crate::EPSILON;

/// Total-variation losses (L1 and L2 forms) and their gradients.
#[derive(Debug, Clone)]
pub struct ImagePriors {
    pub tv_l1: f32,
    pub tv_l2: f32,
    pub grad_tv_l1: Array3<f32>,
    pub grad_tv_l2: Array3<f32>,
}

/// Pixel-pair direction for one difference field.
///
/// A difference element is `image[a] - image[b]` where `b = a + offset`
/// within the valid interior region.
const DIFF_OFFSETS: [((i64, i64), (i64, i64)); 4] = [
    // horizontal neighbor
    ((0, 0), (0, 1)),
    // vertical neighbor
    ((0, 0), (1, 0)),
    // anti-diagonal
    ((1, 0), (0, 1)),
    // diagonal
    ((0, 0), (1, 1)),
];

/// Computes TV-L1 and TV-L2 over the four difference fields.
///
/// The L2 form sums the Frobenius norm of each difference field; the L1 form
/// sums the mean absolute difference of each field.
pub fn image_priors(image: &ImageTensor) -> ImagePriors {
    let (h, w, c) = image.shape();
    let mut grad_tv_l1 = Array3::zeros((h, w, c));
    let mut grad_tv_l2 = Array3::zeros((h, w, c));
    let mut tv_l1 = 0.0f32;
    let mut tv_l2 = 0.0f32;

    if h < 2 || w < 2 {
        return ImagePriors {
            tv_l1,
            tv_l2,
            grad_tv_l1,
            grad_tv_l2,
        };
    }

    for &(off_a, off_b) in DIFF_OFFSETS.iter() {
        // Valid anchor range so that both endpoints stay in bounds
        let max_dy = off_a.0.max(off_b.0) as usize;
        let max_dx = off_a.1.max(off_b.1) as usize;
        let rows = h - max_dy;
        let cols = w - max_dx;
        let count = (rows * cols * c) as f32;

        let mut sq_sum = 0.0f32;
        let mut abs_sum = 0.0f32;
        for y in 0..rows {
            for x in 0..cols {
                for ch in 0..c {
                    let a = [
                        (y as i64 + off_a.0) as usize,
                        (x as i64 + off_a.1) as usize,
                        ch,
                    ];
                    let b = [
                        (y as i64 + off_b.0) as usize,
                        (x as i64 + off_b.1) as usize,
                        ch,
                    ];
                    let diff = image.pixels[a] - image.pixels[b];
                    sq_sum += diff * diff;
                    abs_sum += diff.abs();
                }
            }
        }

        let field_norm = sq_sum.sqrt();
        tv_l2 += field_norm;
        tv_l1 += abs_sum / count.max(1.0);

        // Second pass distributes the gradient onto both endpoints
        let norm_scale = 1.0 / (field_norm + EPSILON);
        let l1_scale = 1.0 / count.max(1.0);
        for y in 0..rows {
            for x in 0..cols {
                for ch in 0..c {
                    let a = [
                        (y as i64 + off_a.0) as usize,
                        (x as i64 + off_a.1) as usize,
                        ch,
                    ];
                    let b = [
                        (y as i64 + off_b.0) as usize,
                        (x as i64 + off_b.1) as usize,
                        ch,
                    ];
                    let diff = image.pixels[a] - image.pixels[b];

                    let g2 = diff * norm_scale;
                    grad_tv_l2[a] += g2;
                    grad_tv_l2[b] -= g2;

                    let g1 = diff.signum() * l1_scale;
                    grad_tv_l1[a] += g1;
                    grad_tv_l1[b] -= g1;
                }
            }
        }
    }

    ImagePriors {
        tv_l1,
        tv_l2,
        grad_tv_l1,
        grad_tv_l2,
    }
}

/// L2 image-norm penalty `‖x‖₂` and its gradient `x / ‖x‖₂`.
pub fn l2_penalty(image: &ImageTensor) -> (f32, Array3<f32>) {
    let norm = image
        .pixels
        .iter()
        .map(|v| v * v)
        .sum::<f32>()
        .sqrt();
    let grad = image.pixels.mapv(|v| v / (norm + EPSILON));
    (norm, grad)
}
