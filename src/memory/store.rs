//! On-disk persistence for reconstructed proxy images.
//!
//! Proxies are serialized as JSON tensors under
//! `<root>/task_<taskId>/<classId>/<index>.json`. Directory creation is
//! idempotent; an already-existing layout is reused, never an error.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::tensor::ImageTensor;

/// Writer for per-task, per-class proxy image files.
#[derive(Debug, Clone)]
pub struct ProxyStore {
    root: PathBuf,
}

impl ProxyStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persists a class's proxies, returning the written paths in index
    /// order.
    pub fn persist(
        &self,
        task_id: usize,
        class_id: usize,
        images: &[ImageTensor],
    ) -> Result<Vec<PathBuf>> {
        let dir = self
            .root
            .join(format!("task_{}", task_id))
            .join(class_id.to_string());
        fs::create_dir_all(&dir)?;

        let mut paths = Vec::with_capacity(images.len());
        for (index, image) in images.iter().enumerate() {
            let path = dir.join(format!("{}.json", index));
            let file = File::create(&path)?;
            serde_json::to_writer(BufWriter::new(file), image)
                .map_err(std::io::Error::from)?;
            paths.push(path);
        }
        Ok(paths)
    }

    /// Reads one persisted proxy back.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ImageTensor> {
        let contents = fs::read_to_string(path)?;
        let image = serde_json::from_str(&contents).map_err(std::io::Error::from)?;
        Ok(image)
    }
}
