//! Train the speckle separation model.
//!
//! Usage: `train_ssm [CONFIG] [LOSS]` where `LOSS` is `mse` or `custom_loss`
//! (default). Without `CONFIG` the path is read from `$SPECKLE_CONFIG`.

use std::path::PathBuf;
use std::process::ExitCode;

use log::{error, info};
use oct_ssm::core::train_speckle_separation;
use oct_ssm::{LossKind, PipelineConfig, Result};

fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let loss_kind: LossKind = match args.next() {
        Some(name) => name.parse()?,
        None => LossKind::Custom,
    };

    let config = PipelineConfig::load(config_path.as_deref())?;
    info!(
        "Training {} with {} for {} epochs",
        config.training.model_name, loss_kind, config.training.num_epochs
    );
    let history = train_speckle_separation(&config.training, loss_kind)?;
    info!("{}", history.summary());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Training failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
