use std::path::PathBuf;

use thiserror::Error;

/// The error type for Mask R-CNN configuration, data and training operations.
#[derive(Error, Debug)]
pub enum MrcnnError {
    /// A configuration value is out of range or inconsistent with another.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// The image file of a registered identifier does not exist.
    #[error("Image for '{image_id}' not found: {path}")]
    MissingImage { image_id: String, path: PathBuf },

    /// Neither a mask directory nor a label image exists for an identifier.
    #[error("Masks for '{image_id}' not found under {path}")]
    MissingMasks { image_id: String, path: PathBuf },

    /// Mask and image of the same identifier disagree in size.
    #[error("Mask {path} is {actual:?}, image is {expected:?}")]
    MaskSizeMismatch {
        path: PathBuf,
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Failed to read directory: {path}")]
    DirectoryReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open image: {path}")]
    ImageOpenFailed {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// A split has no images to draw batches from.
    #[error("The {split} dataset is empty")]
    EmptyDataset { split: &'static str },

    #[error("Index {index} out of range for dataset of {len} images")]
    IndexOutOfRange { index: usize, len: usize },

    /// A sample could not be produced by a data loader worker.
    #[error("Failed to load sample '{image_id}': {reason}")]
    SampleLoadFailed { image_id: String, reason: String },

    /// Not a single batch of an epoch could be used for an update.
    #[error("Epoch {epoch} finished without a single training step")]
    NoTrainingSteps { epoch: usize },

    #[error("Weight file not found: {path}")]
    WeightsNotFound { path: PathBuf },

    #[error("Failed to load weights from {path}: {reason}")]
    WeightLoadingFailed { path: PathBuf, reason: String },

    /// A stored layer does not fit the model built from the configuration.
    #[error("Shape mismatch in layer '{layer}': model expects {expected:?}, weights have {actual:?}")]
    ShapeMismatch {
        layer: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Failed to save checkpoint {path}: {reason}")]
    CheckpointFailed { path: PathBuf, reason: String },

    /// The operation is not available in the wrapper's mode.
    #[error("'{operation}' requires {expected} mode")]
    WrongMode {
        operation: &'static str,
        expected: &'static str,
    },

    #[error("Tensor operation failed: {operation}")]
    TensorOperationFailed { operation: String },

    #[error("I/O error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A specialized `Result` type for Mask R-CNN operations.
pub type MrcnnResult<T> = Result<T, MrcnnError>;
