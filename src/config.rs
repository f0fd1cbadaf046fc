//! Rehearsal configuration via TOML files.
//!
//! All hyperparameters live in immutable structs constructed once and passed
//! by reference; nothing is resolved through global mutable state. Defaults
//! follow the CIFAR100 tuning of the reference training recipe.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use toml::Value;

use crate::error::{RehearsalError, Result};

/// Memory-store configuration.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryConfig {
    /// Total raw-exemplar budget shared across all known classes.
    pub total_budget: usize,
    /// Reconstructed proxies retained per class.
    pub proxy_per_class: usize,
    /// Root directory for persisted proxies; `None` keeps them in memory.
    pub store_root: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            total_budget: 2000,
            proxy_per_class: 300,
            store_root: None,
        }
    }
}

/// One band of the statistics-loss weight schedule: `weight` applies to all
/// zero-based steps up to and including `until`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatWeightBand {
    pub until: usize,
    pub weight: f32,
}

/// Image-reconstruction configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ReconstructionConfig {
    /// Optimization steps per reconstruction; no early stopping.
    pub iterations: usize,
    pub learning_rate: f32,
    /// Maximum absolute spatial roll offset per step.
    pub jitter: i64,
    pub var_scale_l1: f32,
    pub var_scale_l2: f32,
    pub l2_scale: f32,
    /// Weight multiplier for the first normalization layer's discrepancy.
    pub first_layer_multiplier: f32,
    pub adam_beta1: f32,
    pub adam_beta2: f32,
    pub seed: u64,
    /// Explicit statistics-weight schedule. When absent, a built-in table
    /// keyed by `iterations` is used; budgets without a table entry are a
    /// configuration error, never interpolated.
    pub stat_weight_bands: Option<Vec<StatWeightBand>>,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            iterations: 2000,
            learning_rate: 0.01,
            jitter: 10,
            var_scale_l1: 0.0,
            var_scale_l2: 1e-4,
            l2_scale: 1e-5,
            first_layer_multiplier: 1.0,
            adam_beta1: 0.5,
            adam_beta2: 0.9,
            seed: 42,
            stat_weight_bands: None,
        }
    }
}

impl ReconstructionConfig {
    /// Resolves the statistics-weight schedule for this iteration budget.
    pub fn schedule(&self) -> Result<Vec<StatWeightBand>> {
        if let Some(bands) = &self.stat_weight_bands {
            if bands.is_empty() {
                return Err(RehearsalError::Config(
                    "stat_weight_bands must not be empty".into(),
                ));
            }
            let mut prev = 0;
            for band in bands {
                if band.until <= prev && prev != 0 {
                    return Err(RehearsalError::Config(
                        "stat_weight_bands boundaries must be strictly increasing".into(),
                    ));
                }
                prev = band.until;
            }
            if prev < self.iterations {
                return Err(RehearsalError::Config(format!(
                    "stat_weight_bands end at {} but the iteration budget is {}",
                    prev, self.iterations
                )));
            }
            return Ok(bands.clone());
        }

        match self.iterations {
            600 => Ok(vec![
                StatWeightBand {
                    until: 200,
                    weight: 1e-3,
                },
                StatWeightBand {
                    until: 400,
                    weight: 1e-2,
                },
                StatWeightBand {
                    until: 600,
                    weight: 5e-2,
                },
            ]),
            2000 => Ok(vec![
                StatWeightBand {
                    until: 500,
                    weight: 1e-3,
                },
                StatWeightBand {
                    until: 1200,
                    weight: 5e-3,
                },
                StatWeightBand {
                    until: 2000,
                    weight: 1e-2,
                },
            ]),
            other => Err(RehearsalError::Config(format!(
                "no built-in statistics-weight schedule for an iteration budget of {}; \
                 set stat_weight_bands explicitly",
                other
            ))),
        }
    }
}

/// Returns the schedule weight applying at a zero-based step. Boundaries are
/// inclusive: the step equal to a band's `until` still takes that band's
/// weight.
pub fn weight_for_step(bands: &[StatWeightBand], step: usize) -> f32 {
    for band in bands {
        if step <= band.until {
            return band.weight;
        }
    }
    bands.last().map(|b| b.weight).unwrap_or(0.0)
}

/// Top-level rehearsal configuration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RehearsalConfig {
    pub memory: MemoryConfig,
    pub reconstruction: ReconstructionConfig,
}

impl RehearsalConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(&path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let value: Value =
            toml::from_str(toml_str).map_err(|err| RehearsalError::Config(err.to_string()))?;

        let memory_table = value.get("memory").and_then(|v| v.as_table());
        let memory_defaults = MemoryConfig::default();
        let memory = MemoryConfig {
            total_budget: memory_table
                .and_then(|t| t.get("total_budget"))
                .and_then(|v| v.as_integer())
                .map(|v| v.max(0) as usize)
                .unwrap_or(memory_defaults.total_budget),
            proxy_per_class: memory_table
                .and_then(|t| t.get("proxy_per_class"))
                .and_then(|v| v.as_integer())
                .map(|v| v.max(0) as usize)
                .unwrap_or(memory_defaults.proxy_per_class),
            store_root: memory_table
                .and_then(|t| t.get("store_root"))
                .and_then(|v| v.as_str())
                .map(PathBuf::from),
        };

        let recon_table = value.get("reconstruction").and_then(|v| v.as_table());
        let recon_defaults = ReconstructionConfig::default();
        let reconstruction = ReconstructionConfig {
            iterations: recon_table
                .and_then(|t| t.get("iterations"))
                .and_then(|v| v.as_integer())
                .map(|v| v.max(1) as usize)
                .unwrap_or(recon_defaults.iterations),
            learning_rate: float_key(recon_table, "learning_rate")
                .unwrap_or(recon_defaults.learning_rate),
            jitter: recon_table
                .and_then(|t| t.get("jitter"))
                .and_then(|v| v.as_integer())
                .map(|v| v.max(0))
                .unwrap_or(recon_defaults.jitter),
            var_scale_l1: float_key(recon_table, "var_scale_l1")
                .unwrap_or(recon_defaults.var_scale_l1),
            var_scale_l2: float_key(recon_table, "var_scale_l2")
                .unwrap_or(recon_defaults.var_scale_l2),
            l2_scale: float_key(recon_table, "l2_scale").unwrap_or(recon_defaults.l2_scale),
            first_layer_multiplier: float_key(recon_table, "first_layer_multiplier")
                .unwrap_or(recon_defaults.first_layer_multiplier),
            adam_beta1: float_key(recon_table, "adam_beta1").unwrap_or(recon_defaults.adam_beta1),
            adam_beta2: float_key(recon_table, "adam_beta2").unwrap_or(recon_defaults.adam_beta2),
            seed: recon_table
                .and_then(|t| t.get("seed"))
                .and_then(|v| v.as_integer())
                .map(|v| v as u64)
                .unwrap_or(recon_defaults.seed),
            stat_weight_bands: recon_table
                .and_then(|t| t.get("stat_weight_bands"))
                .and_then(|v| v.as_array())
                .map(|items| parse_bands(items))
                .transpose()?,
        };

        let config = Self {
            memory,
            reconstruction,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field consistency, including schedule resolution.
    pub fn validate(&self) -> Result<()> {
        if self.memory.total_budget == 0 {
            return Err(RehearsalError::Config(
                "memory.total_budget must be positive".into(),
            ));
        }
        self.reconstruction.schedule().map(|_| ())
    }
}

fn float_key(table: Option<&toml::map::Map<String, Value>>, key: &str) -> Option<f32> {
    let value = table.and_then(|t| t.get(key))?;
    if let Some(float) = value.as_float() {
        Some(float as f32)
    } else {
        value.as_integer().map(|int| int as f32)
    }
}

fn parse_bands(items: &[Value]) -> Result<Vec<StatWeightBand>> {
    items
        .iter()
        .map(|item| {
            let until = item
                .get("until")
                .and_then(|v| v.as_integer())
                .ok_or_else(|| {
                    RehearsalError::Config("stat_weight_bands entries need an `until` key".into())
                })? as usize;
            let weight = item
                .get("weight")
                .and_then(|v| v.as_float())
                .ok_or_else(|| {
                    RehearsalError::Config("stat_weight_bands entries need a `weight` key".into())
                })? as f32;
            Ok(StatWeightBand { until, weight })
        })
        .collect()
}
