//! Filesystem layout and backend wiring for the `train_crypts` binary.
//!
//! ```bash
//! # COCO weights at ./mask_rcnn_coco.mpk, data under ./dataset/new_crypts
//! cargo run --release --bin train_crypts
//!
//! # another root, a JSON configuration and the WGPU backend
//! cargo run --release --bin train_crypts --no-default-features --features wgpu -- \
//!     --root /data/crypts --config crypts.json
//! ```

pub mod backend;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mrcnn::{list_image_ids, CryptsDataset, PreparedDataset};

pub use backend::{create_device, get_backend_name, SelectedBackend, SelectedDevice, TrainingBackend};

/// Pretrained weights file name under the root.
pub const COCO_WEIGHTS: &str = "mask_rcnn_coco.mpk";

/// Paths of a crypts run, all relative to one root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptsLayout {
    root: PathBuf,
}

impl CryptsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn split(&self, name: &str) -> PathBuf {
        self.root.join("dataset").join("new_crypts").join(name)
    }

    pub fn train_dir(&self) -> PathBuf {
        self.split("train")
    }

    pub fn valid_dir(&self) -> PathBuf {
        self.split("valid")
    }

    pub fn coco_weights(&self) -> PathBuf {
        self.root.join(COCO_WEIGHTS)
    }

    /// Parent of the per-run checkpoint directories.
    pub fn model_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// Registers every file of `<base>/Images` and resolves it.
pub fn prepare_split(base: &Path) -> Result<PreparedDataset> {
    let images = base.join("Images");
    let ids = list_image_ids(&images)
        .with_context(|| format!("Failed to list images in {}", images.display()))?;

    let mut dataset = CryptsDataset::new();
    dataset.load(ids, base);
    let prepared = dataset
        .prepare()
        .with_context(|| format!("Failed to prepare dataset at {}", base.display()))?;

    tracing::info!(split = %base.display(), images = prepared.len(), "dataset ready");
    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_follows_the_root() {
        let layout = CryptsLayout::new("/data");
        assert_eq!(layout.train_dir(), PathBuf::from("/data/dataset/new_crypts/train"));
        assert_eq!(layout.valid_dir(), PathBuf::from("/data/dataset/new_crypts/valid"));
        assert_eq!(layout.coco_weights(), PathBuf::from("/data/mask_rcnn_coco.mpk"));
        assert_eq!(layout.model_dir(), PathBuf::from("/data/logs"));
    }

    #[test]
    fn missing_split_is_reported_with_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = prepare_split(&dir.path().join("train")).unwrap_err();
        assert!(format!("{err:#}").contains("Images"));
    }
}
