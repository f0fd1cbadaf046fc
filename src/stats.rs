//! Batch-statistics hook over a frozen network's normalization layers.
//!
//! After each instrumented forward pass the hook holds, per layer, the
//! discrepancy between the batch's empirical `(mean, variance)` and the
//! layer's frozen long-run statistics. Registration and removal are strictly
//! paired; a hook lives exactly as long as one reconstruction call.

use crate::error::{RehearsalError, Result};
use crate::network::{Backbone, LayerStats, StatGrad};
use crate::EPSILON;

/// Statistics hook for one frozen backbone.
#[derive(Debug, Default)]
pub struct StatisticsHook {
    registered: bool,
    register_count: usize,
    remove_count: usize,
    /// Running statistics snapshotted at registration, read-only afterwards.
    running: Vec<LayerStats>,
    /// Batch statistics from the most recent observed forward pass.
    batch: Option<Vec<LayerStats>>,
}

impl StatisticsHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches to every normalization layer of the backbone.
    ///
    /// Registering an already-registered hook is a lifecycle violation.
    pub fn register_all(&mut self, backbone: &dyn Backbone) -> Result<()> {
        if self.registered {
            return Err(RehearsalError::HookState(
                "hook already registered; remove_all must precede re-registration".into(),
            ));
        }
        self.running = (0..backbone.norm_layer_count())
            .map(|layer| backbone.running_stats(layer).clone())
            .collect();
        self.batch = None;
        self.registered = true;
        self.register_count += 1;
        Ok(())
    }

    /// Detaches from all layers and clears observed batch statistics.
    pub fn remove_all(&mut self) -> Result<()> {
        if !self.registered {
            return Err(RehearsalError::HookState(
                "hook not registered; register_all must precede remove_all".into(),
            ));
        }
        self.registered = false;
        self.remove_count += 1;
        self.batch = None;
        self.running.clear();
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// How many times the hook has been registered over its lifetime.
    pub fn register_count(&self) -> usize {
        self.register_count
    }

    /// How many times the hook has been removed over its lifetime.
    pub fn remove_count(&self) -> usize {
        self.remove_count
    }

    /// Records the batch statistics reported by a forward pass.
    pub fn observe(&mut self, stats: Vec<LayerStats>) -> Result<()> {
        if !self.registered {
            return Err(RehearsalError::HookState(
                "observation without registration".into(),
            ));
        }
        if stats.len() != self.running.len() {
            return Err(RehearsalError::ShapeMismatch {
                expected: vec![self.running.len()],
                got: vec![stats.len()],
            });
        }
        self.batch = Some(stats);
        Ok(())
    }

    /// Norm-based distance between batch and running statistics of one layer.
    ///
    /// `‖Δmean‖ / (‖running_mean‖ + ε) + ‖Δvar‖ / (‖running_var‖ + ε)`
    pub fn discrepancy(&self, layer: usize) -> f32 {
        let Some(batch) = &self.batch else { return 0.0 };
        let running = &self.running[layer];
        let observed = &batch[layer];

        let mean_dist = norm_of_diff(&observed.mean, &running.mean);
        let var_dist = norm_of_diff(&observed.var, &running.var);
        mean_dist / (norm(&running.mean) + EPSILON) + var_dist / (norm(&running.var) + EPSILON)
    }

    /// Weighted sum of all per-layer discrepancies; layer 0 carries the
    /// first-layer multiplier, every other layer weight 1.
    pub fn total_discrepancy(&self, first_layer_multiplier: f32) -> f32 {
        (0..self.running.len())
            .map(|layer| self.layer_weight(layer, first_layer_multiplier) * self.discrepancy(layer))
            .sum()
    }

    /// Gradient of `weight * total_discrepancy` with respect to each layer's
    /// batch `(mean, variance)`, for injection into the backbone's
    /// input-gradient pass.
    pub fn stat_gradients(&self, weight: f32, first_layer_multiplier: f32) -> Vec<StatGrad> {
        let Some(batch) = &self.batch else {
            return self
                .running
                .iter()
                .map(|stats| StatGrad::zeros(stats.dim()))
                .collect();
        };

        self.running
            .iter()
            .zip(batch.iter())
            .enumerate()
            .map(|(layer, (running, observed))| {
                let scale = weight * self.layer_weight(layer, first_layer_multiplier);

                let mean_diff = &observed.mean - &running.mean;
                let mean_dist = norm(&mean_diff);
                let d_mean = mean_diff.mapv(|v| {
                    scale * v / ((mean_dist + EPSILON) * (norm(&running.mean) + EPSILON))
                });

                let var_diff = &observed.var - &running.var;
                let var_dist = norm(&var_diff);
                let d_var = var_diff.mapv(|v| {
                    scale * v / ((var_dist + EPSILON) * (norm(&running.var) + EPSILON))
                });

                StatGrad { d_mean, d_var }
            })
            .collect()
    }

    fn layer_weight(&self, layer: usize, first_layer_multiplier: f32) -> f32 {
        if layer == 0 {
            first_layer_multiplier
        } else {
            1.0
        }
    }
}

fn norm(values: &ndarray::Array1<f32>) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

fn norm_of_diff(a: &ndarray::Array1<f32>, b: &ndarray::Array1<f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
