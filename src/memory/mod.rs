//! Rehearsal memory: raw exemplars, reconstructed proxies, class means.
//!
//! One indexed record table holds every stored exemplar with its class, kind
//! and label; raw and proxy entries are never kept in separate parallel
//! arrays. `rebuild` is all-or-nothing: the next table and class means are
//! staged in full and committed only when every class succeeds, so the means
//! can never drift out of sync with the stores.

pub mod budget;
pub mod store;

pub use budget::MemoryBudgetPolicy;
pub use store::ProxyStore;

use std::collections::HashMap;

use ndarray::{Array1, Array2};
use serde_json::json;

use crate::config::MemoryConfig;
use crate::data::ClassDataSource;
use crate::error::{RehearsalError, Result};
use crate::logging::JsonLogger;
use crate::network::Backbone;
use crate::reconstruct::ImageReconstructor;
use crate::selection::{class_mean, herd, l2_normalize_rows};
use crate::tensor::ImageTensor;

/// Whether a stored exemplar is original data or a reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExemplarKind {
    Raw,
    Proxy,
}

/// One stored exemplar.
#[derive(Debug, Clone)]
pub struct ExemplarRecord {
    pub class_id: usize,
    pub kind: ExemplarKind,
    pub image: ImageTensor,
    pub label: usize,
}

/// Rehearsal store for class-incremental training.
pub struct RehearsalMemory {
    config: MemoryConfig,
    records: Vec<ExemplarRecord>,
    class_means: HashMap<usize, Array1<f32>>,
    raw_quota: usize,
    rebuilds: usize,
    logger: Option<JsonLogger>,
}

impl RehearsalMemory {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            records: Vec::new(),
            class_means: HashMap::new(),
            raw_quota: 0,
            rebuilds: 0,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: JsonLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Rebuilds the whole store for `total_classes` classes.
    ///
    /// Classes below `known_classes` are refreshed in place: the class mean
    /// is recomputed from the retained raw exemplars under the current
    /// network, every proxy is regenerated using the stored proxy's own
    /// current-network feature as target, and the raw list is truncated when
    /// `raw_quota` shrank. Classes from `known_classes` up are built fresh
    /// from `source` via herding and reconstruction.
    ///
    /// On any error the previous table and means remain untouched.
    pub fn rebuild(
        &mut self,
        known_classes: usize,
        total_classes: usize,
        raw_quota: usize,
        source: &dyn ClassDataSource,
        backbone: &dyn Backbone,
        reconstructor: &ImageReconstructor,
    ) -> Result<()> {
        self.log("rebuild_start", json!({
            "known_classes": known_classes,
            "total_classes": total_classes,
            "raw_quota": raw_quota,
            "proxy_per_class": self.config.proxy_per_class,
        }));

        let mut staged_records: Vec<ExemplarRecord> = Vec::new();
        let mut staged_means: HashMap<usize, Array1<f32>> = HashMap::new();

        for class_id in 0..known_classes {
            let (records, mean) =
                self.refresh_class(class_id, raw_quota, backbone, reconstructor)?;
            self.log("class_refreshed", json!({
                "class_id": class_id,
                "raw": records.iter().filter(|r| r.kind == ExemplarKind::Raw).count(),
                "proxy": records.iter().filter(|r| r.kind == ExemplarKind::Proxy).count(),
            }));
            staged_records.extend(records);
            staged_means.insert(class_id, mean);
        }

        for class_id in known_classes..total_classes {
            let (records, mean) =
                self.build_class(class_id, raw_quota, source, backbone, reconstructor)?;
            self.log("class_built", json!({
                "class_id": class_id,
                "raw": records.iter().filter(|r| r.kind == ExemplarKind::Raw).count(),
                "proxy": records.iter().filter(|r| r.kind == ExemplarKind::Proxy).count(),
            }));
            staged_records.extend(records);
            staged_means.insert(class_id, mean);
        }

        // Persistence is part of the staged work; a write failure must not
        // leave a half-committed store behind
        if let Some(root) = self.config.store_root.clone() {
            self.persist_staged(&root, &staged_records)?;
        }

        // Commit point: every class succeeded
        self.records = staged_records;
        self.class_means = staged_means;
        self.raw_quota = raw_quota;
        self.rebuilds += 1;

        self.log("rebuild_done", json!({
            "records": self.records.len(),
            "classes": self.class_means.len(),
        }));
        Ok(())
    }

    fn refresh_class(
        &self,
        class_id: usize,
        raw_quota: usize,
        backbone: &dyn Backbone,
        reconstructor: &ImageReconstructor,
    ) -> Result<(Vec<ExemplarRecord>, Array1<f32>)> {
        // Herding order is preserved in the table, so a shrunk quota keeps
        // the best-ranked prefix.
        let raws: Vec<&ExemplarRecord> = self
            .records
            .iter()
            .filter(|r| r.class_id == class_id && r.kind == ExemplarKind::Raw)
            .take(raw_quota)
            .collect();
        if raws.is_empty() {
            return Err(RehearsalError::InsufficientData {
                requested: raw_quota.max(1),
                available: 0,
            });
        }

        let raw_images: Vec<ImageTensor> = raws.iter().map(|r| r.image.clone()).collect();
        let features = backbone.extract_features(&raw_images)?;
        let mean = class_mean(&l2_normalize_rows(&features));

        let old_proxies: Vec<ImageTensor> = self
            .records
            .iter()
            .filter(|r| r.class_id == class_id && r.kind == ExemplarKind::Proxy)
            .map(|r| r.image.clone())
            .collect();

        let mut records: Vec<ExemplarRecord> = raws
            .into_iter()
            .map(|r| ExemplarRecord {
                class_id,
                kind: ExemplarKind::Raw,
                image: r.image.clone(),
                label: r.label,
            })
            .collect();

        if !old_proxies.is_empty() {
            let targets = backbone.extract_features(&old_proxies)?;
            let fresh = reconstructor.reconstruct_batch(&old_proxies, backbone, &targets)?;
            records.extend(fresh.into_iter().map(|image| ExemplarRecord {
                class_id,
                kind: ExemplarKind::Proxy,
                image,
                label: class_id,
            }));
        }

        Ok((records, mean))
    }

    fn build_class(
        &self,
        class_id: usize,
        raw_quota: usize,
        source: &dyn ClassDataSource,
        backbone: &dyn Backbone,
        reconstructor: &ImageReconstructor,
    ) -> Result<(Vec<ExemplarRecord>, Array1<f32>)> {
        let images = source.class_images(class_id);
        let needed = raw_quota + self.config.proxy_per_class;
        if images.len() < needed {
            return Err(RehearsalError::InsufficientData {
                requested: needed,
                available: images.len(),
            });
        }

        let features = backbone.extract_features(&images)?;
        let normalized = l2_normalize_rows(&features);
        let mean = class_mean(&normalized);

        let split = herd(&normalized, &mean.view(), raw_quota, self.config.proxy_per_class)?;

        let raw_images: Vec<ImageTensor> =
            split.raw.iter().map(|&idx| images[idx].clone()).collect();

        let proxies = if split.proxy.is_empty() {
            Vec::new()
        } else {
            let sources: Vec<ImageTensor> =
                split.proxy.iter().map(|&idx| images[idx].clone()).collect();
            let mut targets = Array2::zeros((sources.len(), backbone.feature_dim()));
            for (row, &idx) in split.proxy.iter().enumerate() {
                targets.row_mut(row).assign(&features.row(idx));
            }
            reconstructor.reconstruct_batch(&sources, backbone, &targets)?
        };

        // The committed mean reflects what the store actually holds
        let raw_features = backbone.extract_features(&raw_images)?;
        let committed_mean = class_mean(&l2_normalize_rows(&raw_features));

        let mut records: Vec<ExemplarRecord> = raw_images
            .into_iter()
            .map(|image| ExemplarRecord {
                class_id,
                kind: ExemplarKind::Raw,
                image,
                label: class_id,
            })
            .collect();
        records.extend(proxies.into_iter().map(|image| ExemplarRecord {
            class_id,
            kind: ExemplarKind::Proxy,
            image,
            label: class_id,
        }));

        Ok((records, committed_mean))
    }

    fn persist_staged(&self, root: &std::path::Path, staged: &[ExemplarRecord]) -> Result<()> {
        let store = ProxyStore::new(root);
        let task_id = self.rebuilds;

        let mut class_ids: Vec<usize> = staged.iter().map(|r| r.class_id).collect();
        class_ids.sort_unstable();
        class_ids.dedup();

        for class_id in class_ids {
            let proxies: Vec<ImageTensor> = staged
                .iter()
                .filter(|r| r.class_id == class_id && r.kind == ExemplarKind::Proxy)
                .map(|r| r.image.clone())
                .collect();
            if !proxies.is_empty() {
                store.persist(task_id, class_id, &proxies)?;
            }
        }
        Ok(())
    }

    /// Raw data followed by proxy data, with parallel labels. This is the
    /// appendant handed to the training loop.
    pub fn merged_appendant(&self) -> (Vec<ImageTensor>, Vec<usize>) {
        let mut data = Vec::with_capacity(self.records.len());
        let mut labels = Vec::with_capacity(self.records.len());
        for kind in [ExemplarKind::Raw, ExemplarKind::Proxy] {
            for record in self.records.iter().filter(|r| r.kind == kind) {
                data.push(record.image.clone());
                labels.push(record.label);
            }
        }
        (data, labels)
    }

    /// Total number of stored exemplars, raw and proxy.
    pub fn exemplar_size(&self) -> usize {
        self.records.len()
    }

    pub fn raw_count(&self, class_id: usize) -> usize {
        self.count(class_id, ExemplarKind::Raw)
    }

    pub fn proxy_count(&self, class_id: usize) -> usize {
        self.count(class_id, ExemplarKind::Proxy)
    }

    pub fn class_mean(&self, class_id: usize) -> Option<&Array1<f32>> {
        self.class_means.get(&class_id)
    }

    pub fn raw_quota(&self) -> usize {
        self.raw_quota
    }

    pub fn records(&self) -> &[ExemplarRecord] {
        &self.records
    }

    /// Raw exemplar images of one class in herding order.
    pub fn raw_images(&self, class_id: usize) -> Vec<&ImageTensor> {
        self.records
            .iter()
            .filter(|r| r.class_id == class_id && r.kind == ExemplarKind::Raw)
            .map(|r| &r.image)
            .collect()
    }

    fn count(&self, class_id: usize, kind: ExemplarKind) -> usize {
        self.records
            .iter()
            .filter(|r| r.class_id == class_id && r.kind == kind)
            .count()
    }

    fn log(&self, event: &str, fields: serde_json::Value) {
        if let Some(logger) = &self.logger {
            logger.log_event(event, fields);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReconstructionConfig, StatWeightBand};
    use crate::data::InMemoryDataSource;
    use crate::network::DenseBackbone;

    fn backbone() -> DenseBackbone {
        let mut backbone = DenseBackbone::from_seed(42, (4, 4, 1), &[10, 6]);
        let batch: Vec<ImageTensor> = (0..8)
            .map(|i| ImageTensor::from_seed(i, 4, 4, 1))
            .collect();
        backbone.calibrate(&batch).unwrap();
        backbone
    }

    fn reconstructor() -> ImageReconstructor {
        let mut config = ReconstructionConfig::default();
        config.iterations = 6;
        config.learning_rate = 0.05;
        config.jitter = 1;
        config.stat_weight_bands = Some(vec![StatWeightBand {
            until: 6,
            weight: 1e-3,
        }]);
        ImageReconstructor::new(config).unwrap()
    }

    fn source_with_classes(count: usize, per_class: usize) -> InMemoryDataSource {
        let mut source = InMemoryDataSource::new();
        for class_id in 0..count {
            let images = (0..per_class)
                .map(|i| ImageTensor::from_seed((class_id * 1000 + i + 1) as u64, 4, 4, 1))
                .collect();
            source.push_class(images);
        }
        source
    }

    fn memory(proxy_per_class: usize) -> RehearsalMemory {
        let config = MemoryConfig {
            total_budget: 100,
            proxy_per_class,
            store_root: None,
        };
        RehearsalMemory::new(config)
    }

    #[test]
    fn test_growth_builds_every_class() {
        let backbone = backbone();
        let reconstructor = reconstructor();
        let source = source_with_classes(2, 6);
        let mut memory = memory(2);

        memory
            .rebuild(0, 2, 3, &source, &backbone, &reconstructor)
            .unwrap();

        for class_id in 0..2 {
            assert_eq!(memory.raw_count(class_id), 3);
            assert_eq!(memory.proxy_count(class_id), 2);
            assert!(memory.class_mean(class_id).is_some());
        }
        assert_eq!(memory.exemplar_size(), 10);
        assert_eq!(memory.raw_quota(), 3);
    }

    #[test]
    fn test_class_mean_is_unit_normalized() {
        let backbone = backbone();
        let reconstructor = reconstructor();
        let source = source_with_classes(1, 6);
        let mut memory = memory(0);

        memory
            .rebuild(0, 1, 4, &source, &backbone, &reconstructor)
            .unwrap();

        let mean = memory.class_mean(0).unwrap();
        let norm = mean.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_merged_appendant_raw_before_proxy() {
        let backbone = backbone();
        let reconstructor = reconstructor();
        let source = source_with_classes(2, 6);
        let mut memory = memory(2);

        memory
            .rebuild(0, 2, 3, &source, &backbone, &reconstructor)
            .unwrap();

        let (data, labels) = memory.merged_appendant();
        assert_eq!(data.len(), 10);
        assert_eq!(labels.len(), 10);
        // First six entries are raw exemplars, last four are proxies
        assert_eq!(labels.iter().filter(|&&l| l == 0).count(), 5);
        assert_eq!(labels.iter().filter(|&&l| l == 1).count(), 5);
        assert_eq!(&labels[..6], &[0, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn test_quota_shrink_truncates_raw_list() {
        let backbone = backbone();
        let reconstructor = reconstructor();
        let source = source_with_classes(1, 8);
        let mut memory = memory(1);

        memory
            .rebuild(0, 1, 4, &source, &backbone, &reconstructor)
            .unwrap();
        let kept_before: Vec<Vec<f32>> = memory
            .raw_images(0)
            .iter()
            .map(|img| img.as_flat().to_vec())
            .collect();

        memory
            .rebuild(1, 1, 2, &source, &backbone, &reconstructor)
            .unwrap();

        assert_eq!(memory.raw_count(0), 2);
        let kept_after: Vec<Vec<f32>> = memory
            .raw_images(0)
            .iter()
            .map(|img| img.as_flat().to_vec())
            .collect();
        assert_eq!(kept_after, kept_before[..2].to_vec());
    }

    #[test]
    fn test_refresh_regenerates_proxies() {
        let backbone = backbone();
        let reconstructor = reconstructor();
        let source = source_with_classes(1, 6);
        let mut memory = memory(2);

        memory
            .rebuild(0, 1, 3, &source, &backbone, &reconstructor)
            .unwrap();
        memory
            .rebuild(1, 1, 3, &source, &backbone, &reconstructor)
            .unwrap();

        assert_eq!(memory.raw_count(0), 3);
        assert_eq!(memory.proxy_count(0), 2);
    }

    #[test]
    fn test_rebuild_failure_leaves_state_untouched() {
        let backbone = backbone();
        let reconstructor = reconstructor();
        let source = source_with_classes(1, 6);
        let mut memory = memory(2);

        memory
            .rebuild(0, 1, 3, &source, &backbone, &reconstructor)
            .unwrap();
        let size_before = memory.exemplar_size();

        // Class 1 has no data; growth fails and nothing changes
        let result = memory.rebuild(1, 2, 3, &source, &backbone, &reconstructor);
        assert!(matches!(
            result,
            Err(RehearsalError::InsufficientData { .. })
        ));
        assert_eq!(memory.exemplar_size(), size_before);
        assert_eq!(memory.raw_count(0), 3);
        assert!(memory.class_mean(1).is_none());
    }

    #[test]
    fn test_insufficient_class_data() {
        let backbone = backbone();
        let reconstructor = reconstructor();
        let source = source_with_classes(1, 4);
        let mut memory = memory(2);

        let result = memory.rebuild(0, 1, 3, &source, &backbone, &reconstructor);
        assert!(matches!(
            result,
            Err(RehearsalError::InsufficientData {
                requested: 5,
                available: 4
            })
        ));
    }

    #[test]
    fn test_persistence_failure_aborts_without_commit() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the store root should be makes every
        // directory creation under it fail
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"not a directory").unwrap();

        let backbone = backbone();
        let reconstructor = reconstructor();
        let source = source_with_classes(1, 6);

        let config = MemoryConfig {
            total_budget: 100,
            proxy_per_class: 2,
            store_root: Some(blocked),
        };
        let mut memory = RehearsalMemory::new(config);
        let result = memory.rebuild(0, 1, 3, &source, &backbone, &reconstructor);

        assert!(matches!(result, Err(RehearsalError::Io(_))));
        assert_eq!(memory.exemplar_size(), 0);
        assert!(memory.class_mean(0).is_none());
        assert_eq!(memory.raw_quota(), 0);
    }

    #[test]
    fn test_rebuild_logs_progress_events() {
        use std::io::Write;
        use std::sync::{Arc, Mutex};

        #[derive(Clone)]
        struct SharedBuf(Arc<Mutex<Vec<u8>>>);

        impl Write for SharedBuf {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let backbone = backbone();
        let reconstructor = reconstructor();
        let source = source_with_classes(2, 6);

        let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let logger = JsonLogger::to_writer(Box::new(buf.clone()));
        let mut memory = memory(2).with_logger(logger);

        memory
            .rebuild(0, 2, 3, &source, &backbone, &reconstructor)
            .unwrap();

        let contents = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let events: Vec<String> = contents
            .lines()
            .map(|line| {
                let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
                parsed["event"].as_str().unwrap().to_string()
            })
            .collect();

        assert_eq!(
            events,
            vec!["rebuild_start", "class_built", "class_built", "rebuild_done"]
        );
    }

    #[test]
    fn test_proxies_persisted_when_store_configured() {
        let dir = tempfile::tempdir().unwrap();
        let backbone = backbone();
        let reconstructor = reconstructor();
        let source = source_with_classes(1, 6);

        let config = MemoryConfig {
            total_budget: 100,
            proxy_per_class: 2,
            store_root: Some(dir.path().to_path_buf()),
        };
        let mut memory = RehearsalMemory::new(config);
        memory
            .rebuild(0, 1, 3, &source, &backbone, &reconstructor)
            .unwrap();

        let written = dir.path().join("task_0").join("0").join("0.json");
        assert!(written.exists());
    }
}
