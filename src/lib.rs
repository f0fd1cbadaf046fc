//! # Rehearsal Memory Core
//!
//! Rehearsal-memory management for class-incremental learning: herding-based
//! exemplar selection, data-free image reconstruction against a frozen
//! network's batch statistics, and a budgeted store merging raw exemplars
//! with reconstructed proxies.
//!
//! ## Quick Start
//!
//! ```rust
//! use rehearsal_memory_core::{
//!     ImageReconstructor, ImageTensor, InMemoryDataSource, MemoryConfig,
//!     ReconstructionConfig, RehearsalMemory, StatWeightBand,
//! };
//! use rehearsal_memory_core::network::DenseBackbone;
//!
//! // A small frozen backbone calibrated on seed data
//! let mut backbone = DenseBackbone::from_seed(42, (4, 4, 1), &[10, 6]);
//! let batch: Vec<ImageTensor> = (0..8)
//!     .map(|i| ImageTensor::from_seed(i, 4, 4, 1))
//!     .collect();
//! backbone.calibrate(&batch).unwrap();
//!
//! // One class worth of data
//! let mut source = InMemoryDataSource::new();
//! source.push_class((0..6).map(|i| ImageTensor::from_seed(100 + i, 4, 4, 1)).collect());
//!
//! let mut recon_config = ReconstructionConfig::default();
//! recon_config.iterations = 6;
//! recon_config.stat_weight_bands = Some(vec![StatWeightBand { until: 6, weight: 1e-3 }]);
//! let reconstructor = ImageReconstructor::new(recon_config).unwrap();
//!
//! let mut memory = RehearsalMemory::new(MemoryConfig {
//!     total_budget: 100,
//!     proxy_per_class: 2,
//!     store_root: None,
//! });
//! memory.rebuild(0, 1, 3, &source, &backbone, &reconstructor).unwrap();
//!
//! let (data, labels) = memory.merged_appendant();
//! assert_eq!(data.len(), labels.len());
//! ```
//!
//! ## Core Modules
//!
//! - [`config`] - Rehearsal configuration via TOML
//! - [`tensor`] - Image tensor type and differentiable priors
//! - [`network`] - Frozen-backbone capability interface
//! - [`stats`] - Batch-statistics hook over normalization layers
//! - [`selection`] - Herding exemplar selection
//! - [`reconstruct`] - Data-free image reconstruction
//! - [`memory`] - Rehearsal store, budget policy, proxy persistence
//! - [`logging`] - JSON line-delimited logging

pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod memory;
pub mod network;
pub mod reconstruct;
pub mod selection;
pub mod stats;
pub mod tensor;

pub use config::{MemoryConfig, ReconstructionConfig, RehearsalConfig, StatWeightBand};
pub use data::{AppendantDataset, ClassDataSource, InMemoryDataSource};
pub use error::{RehearsalError, Result};
pub use logging::JsonLogger;
pub use memory::{ExemplarKind, ExemplarRecord, MemoryBudgetPolicy, ProxyStore, RehearsalMemory};
pub use network::{Backbone, LayerStats, StatGrad};
pub use reconstruct::ImageReconstructor;
pub use selection::{class_mean, herd, l2_normalize_rows, SelectionSplit};
pub use stats::StatisticsHook;
pub use tensor::ImageTensor;

/// Numeric floor guarding divisions and norms crate-wide.
pub const EPSILON: f32 = 1e-8;
