//! Image tensor type used throughout the rehearsal core.
//!
//! Images are stored as `(height, width, channels)` arrays of `f32` with the
//! valid pixel range `[0, 1]`.

pub mod ops;

use std::fmt::{self, Display};

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// A single image in HWC layout.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageTensor {
    pub pixels: Array3<f32>,
}

impl ImageTensor {
    /// Creates a zeroed image of the given shape.
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            pixels: Array3::zeros((height, width, channels)),
        }
    }

    pub fn from_array(pixels: Array3<f32>) -> Self {
        Self { pixels }
    }

    /// Deterministic pseudo-random image in `[0, 1]`, LCG-seeded.
    pub fn from_seed(seed: u64, height: usize, width: usize, channels: usize) -> Self {
        let mut image = Self::new(height, width, channels);
        let state = if seed == 0 { 1 } else { seed };

        image
            .pixels
            .as_slice_mut()
            .expect("ndarray uses contiguous layout")
            .par_iter_mut()
            .enumerate()
            .for_each(|(idx, value)| {
                let step = idx as u64 + state;
                *value = normalized(lcg(step));
            });

        image
    }

    /// Gaussian noise image, used to initialize reconstruction.
    pub fn noise_like(template: &ImageTensor, rng: &mut StdRng) -> Self {
        let mut image = Self::new_like(template);
        for value in image.pixels.iter_mut() {
            // Box-Muller transform over the rng's uniform output
            let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
            let u2: f32 = rng.gen::<f32>();
            *value = (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos();
        }
        image
    }

    pub fn new_like(template: &ImageTensor) -> Self {
        let (h, w, c) = template.shape();
        Self::new(h, w, c)
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.pixels.dim()
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Returns a copy with every pixel clamped to `[min, max]`.
    pub fn clamp(&self, min: f32, max: f32) -> Self {
        let mut pixels = self.pixels.clone();
        pixels
            .as_slice_mut()
            .expect("contiguous")
            .par_iter_mut()
            .for_each(|value| *value = value.clamp(min, max));
        Self { pixels }
    }

    /// In-place clamp, used inside the reconstruction step loop.
    pub fn clamp_in_place(&mut self, min: f32, max: f32) {
        self.pixels
            .as_slice_mut()
            .expect("contiguous")
            .par_iter_mut()
            .for_each(|value| *value = value.clamp(min, max));
    }

    /// Cyclic 2-D shift by `(dy, dx)` over the spatial axes.
    ///
    /// Negative offsets shift toward the origin. Channels move with their
    /// pixel. Rolling by `(-dy, -dx)` inverts the operation exactly.
    pub fn roll(&self, dy: i64, dx: i64) -> Self {
        let (h, w, c) = self.shape();
        if h == 0 || w == 0 {
            return self.clone();
        }
        let dy = dy.rem_euclid(h as i64) as usize;
        let dx = dx.rem_euclid(w as i64) as usize;

        let mut rolled = Array3::zeros((h, w, c));
        for y in 0..h {
            let ty = (y + dy) % h;
            for x in 0..w {
                let tx = (x + dx) % w;
                for ch in 0..c {
                    rolled[[ty, tx, ch]] = self.pixels[[y, x, ch]];
                }
            }
        }
        Self { pixels: rolled }
    }

    /// Flattened view of the pixel data in row-major order.
    pub fn as_flat(&self) -> &[f32] {
        self.pixels.as_slice().expect("contiguous")
    }

    pub fn min_pixel(&self) -> f32 {
        self.pixels.iter().cloned().fold(f32::INFINITY, f32::min)
    }

    pub fn max_pixel(&self) -> f32 {
        self.pixels
            .iter()
            .cloned()
            .fold(f32::NEG_INFINITY, f32::max)
    }
}

impl Display for ImageTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (h, w, c) = self.shape();
        let mean = self.pixels.iter().sum::<f32>() / self.len().max(1) as f32;
        write!(f, "ImageTensor {}x{}x{} mean={:.4}", h, w, c, mean)
    }
}

fn lcg(seed: u64) -> u64 {
    seed.wrapping_mul(1664525).wrapping_add(1013904223)
}

fn normalized(value: u64) -> f32 {
    let fraction = (value & 0xFFFF_FFFF) as f32 / (u32::MAX as f32);
    fraction.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_seed_deterministic() {
        let a = ImageTensor::from_seed(7, 4, 4, 3);
        let b = ImageTensor::from_seed(7, 4, 4, 3);
        assert_eq!(a.as_flat(), b.as_flat());
        assert!(a.min_pixel() >= 0.0 && a.max_pixel() <= 1.0);
    }

    #[test]
    fn test_clamp() {
        let mut image = ImageTensor::new(2, 2, 1);
        image.pixels[[0, 0, 0]] = 2.5;
        image.pixels[[1, 1, 0]] = -0.5;

        let clamped = image.clamp(0.0, 1.0);
        assert_eq!(clamped.pixels[[0, 0, 0]], 1.0);
        assert_eq!(clamped.pixels[[1, 1, 0]], 0.0);
    }

    #[test]
    fn test_roll_round_trip() {
        let image = ImageTensor::from_seed(11, 5, 6, 3);
        let rolled = image.roll(2, -3);
        let restored = rolled.roll(-2, 3);
        assert_eq!(image.as_flat(), restored.as_flat());
    }

    #[test]
    fn test_roll_moves_pixels() {
        let mut image = ImageTensor::new(3, 3, 1);
        image.pixels[[0, 0, 0]] = 1.0;

        let rolled = image.roll(1, 2);
        assert_eq!(rolled.pixels[[1, 2, 0]], 1.0);
        assert_eq!(rolled.pixels[[0, 0, 0]], 0.0);
    }

    #[test]
    fn test_noise_like_seeded() {
        use rand::SeedableRng;
        let template = ImageTensor::new(4, 4, 3);
        let mut rng1 = StdRng::seed_from_u64(3);
        let mut rng2 = StdRng::seed_from_u64(3);
        let a = ImageTensor::noise_like(&template, &mut rng1);
        let b = ImageTensor::noise_like(&template, &mut rng2);
        assert_eq!(a.as_flat(), b.as_flat());
        // Noise is unbounded before clamping
        assert!(a.min_pixel() < 0.0 || a.max_pixel() > 1.0);
    }
}
