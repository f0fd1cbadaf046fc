//! Data-free image reconstruction against a frozen network.
//!
//! Starting from random noise, a synthetic image is optimized to match a
//! target feature vector while keeping every normalization layer's batch
//! statistics close to the frozen running statistics. Random spatial rolls,
//! total-variation priors and an L2 penalty regularize the result. The
//! network parameters receive no gradient; only the synthetic tensor moves.

use ndarray::{Array2, Array3, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{weight_for_step, ReconstructionConfig, StatWeightBand};
use crate::error::{RehearsalError, Result};
use crate::network::Backbone;
use crate::stats::StatisticsHook;
use crate::tensor::ops::{image_priors, l2_penalty};
use crate::tensor::ImageTensor;
use crate::EPSILON;

/// Gradient-based reconstruction engine. Stateless across calls; every
/// invocation owns its noise, optimizer state and statistics hook.
pub struct ImageReconstructor {
    config: ReconstructionConfig,
    bands: Vec<StatWeightBand>,
}

impl ImageReconstructor {
    /// Validates the statistics-weight schedule up front so an unmapped
    /// iteration budget fails at construction, not mid-rebuild.
    pub fn new(config: ReconstructionConfig) -> Result<Self> {
        let bands = config.schedule()?;
        Ok(Self { config, bands })
    }

    pub fn config(&self) -> &ReconstructionConfig {
        &self.config
    }

    /// Reconstructs a single proxy image for `target_feature`.
    pub fn reconstruct(
        &self,
        seed: &ImageTensor,
        backbone: &dyn Backbone,
        target_feature: &ArrayView1<f32>,
    ) -> Result<ImageTensor> {
        let mut targets = Array2::zeros((1, target_feature.len()));
        targets.row_mut(0).assign(target_feature);
        let mut images =
            self.reconstruct_batch(std::slice::from_ref(seed), backbone, &targets)?;
        Ok(images.remove(0))
    }

    /// Reconstructs one proxy per seed/target pair.
    ///
    /// The hook is registered before the first step and removed after the
    /// last, errors included; no residual instrumentation survives the call.
    pub fn reconstruct_batch(
        &self,
        seeds: &[ImageTensor],
        backbone: &dyn Backbone,
        targets: &Array2<f32>,
    ) -> Result<Vec<ImageTensor>> {
        let mut hook = StatisticsHook::new();
        self.reconstruct_batch_with_hook(seeds, backbone, targets, &mut hook)
    }

    /// Batch reconstruction against a caller-supplied hook, which must be
    /// unregistered on entry and is unregistered again on return.
    pub fn reconstruct_batch_with_hook(
        &self,
        seeds: &[ImageTensor],
        backbone: &dyn Backbone,
        targets: &Array2<f32>,
        hook: &mut StatisticsHook,
    ) -> Result<Vec<ImageTensor>> {
        self.check_inputs(seeds, backbone, targets)?;

        hook.register_all(backbone)?;
        let result = self.optimize(seeds, backbone, targets, hook);
        hook.remove_all()?;
        result
    }

    fn check_inputs(
        &self,
        seeds: &[ImageTensor],
        backbone: &dyn Backbone,
        targets: &Array2<f32>,
    ) -> Result<()> {
        if seeds.len() != targets.dim().0 {
            return Err(RehearsalError::ShapeMismatch {
                expected: vec![seeds.len()],
                got: vec![targets.dim().0],
            });
        }
        if targets.dim().1 != backbone.feature_dim() {
            return Err(RehearsalError::ShapeMismatch {
                expected: vec![backbone.feature_dim()],
                got: vec![targets.dim().1],
            });
        }
        for target in targets.rows() {
            let norm = target.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm <= EPSILON {
                return Err(RehearsalError::DegenerateTarget { norm });
            }
        }
        Ok(())
    }

    fn optimize(
        &self,
        seeds: &[ImageTensor],
        backbone: &dyn Backbone,
        targets: &Array2<f32>,
        hook: &mut StatisticsHook,
    ) -> Result<Vec<ImageTensor>> {
        let cfg = &self.config;
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let batch = seeds.len();

        let mut images: Vec<ImageTensor> = seeds
            .iter()
            .map(|seed| ImageTensor::noise_like(seed, &mut rng).clamp(0.0, 1.0))
            .collect();
        let mut adam: Vec<AdamState> = images.iter().map(AdamState::for_image).collect();

        let target_norms: Vec<f32> = targets
            .rows()
            .into_iter()
            .map(|t| t.iter().map(|v| v * v).sum::<f32>().sqrt())
            .collect();

        for step in 0..cfg.iterations {
            let (dy, dx) = if cfg.jitter > 0 {
                (
                    rng.gen_range(-cfg.jitter..=cfg.jitter),
                    rng.gen_range(-cfg.jitter..=cfg.jitter),
                )
            } else {
                (0, 0)
            };
            let jittered: Vec<ImageTensor> =
                images.iter().map(|image| image.roll(dy, dx)).collect();

            let (features, stats) = backbone.forward_with_stats(&jittered)?;
            hook.observe(stats)?;

            // Feature-matching gradient, averaged over the batch
            let mut grad_features = Array2::zeros(features.dim());
            for row in 0..batch {
                let mut diff_norm = 0.0f32;
                for col in 0..features.dim().1 {
                    let diff = features[[row, col]] - targets[[row, col]];
                    diff_norm += diff * diff;
                }
                let diff_norm = diff_norm.sqrt();
                let scale =
                    1.0 / ((diff_norm + EPSILON) * (target_norms[row] + EPSILON) * batch as f32);
                for col in 0..features.dim().1 {
                    grad_features[[row, col]] =
                        (features[[row, col]] - targets[[row, col]]) * scale;
                }
            }

            let stat_weight = weight_for_step(&self.bands, step);
            let stat_grads = hook.stat_gradients(stat_weight, cfg.first_layer_multiplier);

            let network_grads = backbone.input_gradient(&jittered, &grad_features, &stat_grads)?;

            for (idx, image) in images.iter_mut().enumerate() {
                let priors = image_priors(&jittered[idx]);
                let (_, grad_l2) = l2_penalty(&jittered[idx]);

                let mut grad = network_grads[idx].pixels.clone();
                grad += &(priors.grad_tv_l2.mapv(|v| v * cfg.var_scale_l2));
                if cfg.var_scale_l1 != 0.0 {
                    grad += &(priors.grad_tv_l1.mapv(|v| v * cfg.var_scale_l1));
                }
                grad += &(grad_l2.mapv(|v| v * cfg.l2_scale));

                // Gradient was computed on the rolled image; roll it back
                let grad = ImageTensor::from_array(grad).roll(-dy, -dx);

                adam[idx].step(
                    &mut image.pixels,
                    &grad.pixels,
                    cfg.learning_rate,
                    cfg.adam_beta1,
                    cfg.adam_beta2,
                );
                image.clamp_in_place(0.0, 1.0);
            }
        }

        Ok(images)
    }
}

/// Adam optimizer state for one synthetic image.
struct AdamState {
    m: Array3<f32>,
    v: Array3<f32>,
    t: usize,
}

impl AdamState {
    fn for_image(image: &ImageTensor) -> Self {
        Self {
            m: Array3::zeros(image.shape()),
            v: Array3::zeros(image.shape()),
            t: 0,
        }
    }

    fn step(&mut self, params: &mut Array3<f32>, grad: &Array3<f32>, lr: f32, b1: f32, b2: f32) {
        self.t += 1;
        let bias1 = 1.0 - b1.powi(self.t as i32);
        let bias2 = 1.0 - b2.powi(self.t as i32);

        for ((p, g), (m, v)) in params
            .iter_mut()
            .zip(grad.iter())
            .zip(self.m.iter_mut().zip(self.v.iter_mut()))
        {
            *m = b1 * *m + (1.0 - b1) * g;
            *v = b2 * *v + (1.0 - b2) * g * g;
            let m_hat = *m / bias1;
            let v_hat = *v / bias2;
            *p -= lr * m_hat / (v_hat.sqrt() + EPSILON);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{extract_feature, DenseBackbone};

    fn test_config(iterations: usize) -> ReconstructionConfig {
        let mut config = ReconstructionConfig::default();
        config.iterations = iterations;
        config.learning_rate = 0.05;
        config.jitter = 1;
        config.seed = 7;
        config.stat_weight_bands = Some(vec![
            StatWeightBand {
                until: iterations / 2,
                weight: 1e-3,
            },
            StatWeightBand {
                until: iterations,
                weight: 1e-2,
            },
        ]);
        config
    }

    fn calibrated_backbone() -> DenseBackbone {
        let mut backbone = DenseBackbone::from_seed(42, (4, 4, 1), &[10, 6]);
        let batch: Vec<ImageTensor> = (0..8)
            .map(|i| ImageTensor::from_seed(i, 4, 4, 1))
            .collect();
        backbone.calibrate(&batch).unwrap();
        backbone
    }

    #[test]
    fn test_output_pixels_in_unit_range() {
        let backbone = calibrated_backbone();
        let seed = ImageTensor::from_seed(3, 4, 4, 1);
        let target = extract_feature(&backbone, &seed).unwrap();

        let reconstructor = ImageReconstructor::new(test_config(12)).unwrap();
        let image = reconstructor
            .reconstruct(&seed, &backbone, &target.view())
            .unwrap();

        assert!(image.min_pixel() >= 0.0);
        assert!(image.max_pixel() <= 1.0);
    }

    #[test]
    fn test_reconstruction_deterministic() {
        let backbone = calibrated_backbone();
        let seed = ImageTensor::from_seed(3, 4, 4, 1);
        let target = extract_feature(&backbone, &seed).unwrap();

        let reconstructor = ImageReconstructor::new(test_config(10)).unwrap();
        let a = reconstructor
            .reconstruct(&seed, &backbone, &target.view())
            .unwrap();
        let b = reconstructor
            .reconstruct(&seed, &backbone, &target.view())
            .unwrap();
        assert_eq!(a.as_flat(), b.as_flat());
    }

    #[test]
    fn test_degenerate_target_rejected() {
        let backbone = calibrated_backbone();
        let seed = ImageTensor::from_seed(3, 4, 4, 1);
        let target = ndarray::Array1::<f32>::zeros(backbone.feature_dim());

        let reconstructor = ImageReconstructor::new(test_config(10)).unwrap();
        assert!(matches!(
            reconstructor.reconstruct(&seed, &backbone, &target.view()),
            Err(RehearsalError::DegenerateTarget { .. })
        ));
    }

    #[test]
    fn test_hook_released_after_each_call() {
        let backbone = calibrated_backbone();
        let seed = ImageTensor::from_seed(3, 4, 4, 1);
        let target = extract_feature(&backbone, &seed).unwrap();
        let mut targets = Array2::zeros((1, target.len()));
        targets.row_mut(0).assign(&target);

        let reconstructor = ImageReconstructor::new(test_config(8)).unwrap();
        let mut hook = StatisticsHook::new();

        for _ in 0..2 {
            reconstructor
                .reconstruct_batch_with_hook(
                    std::slice::from_ref(&seed),
                    &backbone,
                    &targets,
                    &mut hook,
                )
                .unwrap();
            assert!(!hook.is_registered());
        }
        assert_eq!(hook.register_count(), 2);
        assert_eq!(hook.remove_count(), 2);
    }

    #[test]
    fn test_hook_released_on_error() {
        let backbone = calibrated_backbone();
        // Wrong image shape fails inside the first forward pass, after the
        // hook has registered.
        let seed = ImageTensor::from_seed(3, 3, 3, 1);
        let targets = Array2::<f32>::ones((1, backbone.feature_dim()));

        let reconstructor = ImageReconstructor::new(test_config(8)).unwrap();
        let mut hook = StatisticsHook::new();
        let result = reconstructor.reconstruct_batch_with_hook(
            std::slice::from_ref(&seed),
            &backbone,
            &targets,
            &mut hook,
        );
        assert!(result.is_err());
        assert!(!hook.is_registered());
    }

    #[test]
    fn test_feature_distance_shrinks() {
        let backbone = calibrated_backbone();
        let seed = ImageTensor::from_seed(3, 4, 4, 1);
        let target = extract_feature(&backbone, &seed).unwrap();

        let mut config = test_config(40);
        config.jitter = 0;
        let reconstructor = ImageReconstructor::new(config).unwrap();
        let image = reconstructor
            .reconstruct(&seed, &backbone, &target.view())
            .unwrap();

        // Distance from the optimized image should beat the raw noise start
        let mut rng = StdRng::seed_from_u64(7);
        let noise = ImageTensor::noise_like(&seed, &mut rng).clamp(0.0, 1.0);

        let dist = |img: &ImageTensor| {
            let f = extract_feature(&backbone, img).unwrap();
            f.iter()
                .zip(target.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
                .sqrt()
        };
        assert!(dist(&image) < dist(&noise));
    }

    #[test]
    fn test_batch_mismatch_rejected() {
        let backbone = calibrated_backbone();
        let seed = ImageTensor::from_seed(3, 4, 4, 1);
        let targets = Array2::<f32>::ones((3, backbone.feature_dim()));

        let reconstructor = ImageReconstructor::new(test_config(8)).unwrap();
        assert!(matches!(
            reconstructor.reconstruct_batch(std::slice::from_ref(&seed), &backbone, &targets),
            Err(RehearsalError::ShapeMismatch { .. })
        ));
    }
}
