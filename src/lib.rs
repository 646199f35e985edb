//! # OCT-SSM: speckle separation for retinal OCT
//!
//! This library trains a small convolutional network that decomposes a noisy
//! optical coherence tomography scan into a structural *flow* component and a
//! *speckle* noise component, checkpoints the run so it can be resumed, and
//! evaluates the result against reference-averaged scans.
//!
//! ## Features
//!
//! - **Network**: ndarray convolutions with hand-written backward passes and Adam
//! - **Losses**: plain MSE and a multi-term flow/noise objective
//! - **Patches**: memory-bounded tiling and stitching for training and inference
//! - **Checkpoints**: last/best snapshots with digest verification and resume
//! - **Evaluation**: PSNR, SSIM, CNR and ENL against averaged references
//! - **Visualization**: progress panels, loss curves with the `viz` feature

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Network layers, model, optimizer and losses
pub mod nn;

/// Datasets, preprocessing and patch tiling
pub mod data;

/// Configuration, training loop, checkpoints and pipeline entry points
pub mod core;

/// Image-quality metrics and evaluation
pub mod eval;

/// Utility functions and helpers
pub mod utils;

// Re-export commonly used types
pub use nn::{Architecture, SeparationNet, SeparationOutput, Adam, LossKind, LossParameters};
pub use data::{PatchConfig, PairedDataset, DataLoader};
pub use crate::core::{Checkpoint, PipelineConfig, Trainer, TrainerOptions, TrainingHistory};
pub use eval::ImageMetrics;

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum SsmError {
    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tensor or image shape mismatch
    #[error("Shape error: {0}")]
    Shape(String),

    /// Dataset could not be assembled
    #[error("Data error: {0}")]
    Data(String),

    /// Checkpoint is missing, incompatible or corrupted
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Loss became NaN or infinite
    #[error("Non-finite loss during {phase} epoch {epoch}")]
    NonFiniteLoss {
        /// Phase name
        phase: String,
        /// 1-based epoch number
        epoch: usize,
    },

    /// Plotting failed
    #[error("Visualization error: {0}")]
    Visualization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Image decoding or encoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Result type for the library
pub type Result<T> = std::result::Result<T, SsmError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        nn::{Architecture, SeparationNet, SeparationOutput, Adam, LossKind, LossParameters, SeparationLoss},
        data::{PatchConfig, PairedDataset, DataLoader, extract_patches, reconstruct_from_patches},
        core::{Checkpoint, PipelineConfig, Trainer, TrainerOptions, TrainingHistory},
        eval::{ImageMetrics, compute_metrics},
        Result, SsmError,
    };
}
