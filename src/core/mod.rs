//! Configuration, training loop, checkpoints and pipeline entry points

mod checkpoint;
mod config;
mod pipeline;
mod training;

pub use checkpoint::{Checkpoint, CheckpointPaths};
pub use config::{
    EvaluationSettings, PipelineConfig, TrainingSettings, CONFIG_ENV_VAR, LOSS_PLACEHOLDER,
};
pub use pipeline::{build_loaders, build_trainer, evaluate, train_on_dataset, train_speckle_separation};
pub use training::{EpochLosses, Phase, Trainer, TrainerOptions, TrainingHistory};
