//! Error types for the light detector library.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by training, model loading and dataset checks.
///
/// Per-image decode failures are not errors: the preprocessor reports them
/// as `None` so a batch can continue past one bad file.
#[derive(Error, Debug)]
pub enum DetectError {
    /// The serialized model does not exist.
    #[error("model file '{0}' not found; train the model first with `light-detect train`")]
    ModelNotFound(PathBuf),

    /// The training root directory does not exist.
    #[error(
        "training directory '{0}' not found; create it with `light-detect prepare --create` \
         and add images to its class folders"
    )]
    DataDirMissing(PathBuf),

    /// One of the two class directories is missing.
    #[error("class directory '{0}' not found; run `light-detect prepare --create`")]
    ClassDirMissing(PathBuf),

    /// A class directory holds no images.
    #[error("class directory '{0}' contains no images; add at least one image per class")]
    EmptyClass(PathBuf),

    /// The manifest next to the weights is unreadable or inconsistent.
    #[error("invalid model manifest '{path}': {reason}")]
    Manifest { path: PathBuf, reason: String },

    /// Pretrained backbone weights could not be applied.
    #[error("pretrained weights '{path}': {reason}")]
    Pretrained { path: PathBuf, reason: String },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Torch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, DetectError>;
