//! Evaluate the baseline and a trained model on an SD-OCT set.
//!
//! Usage: `evaluate_ssm [CONFIG] [CHECKPOINT]`. A checkpoint given on the
//! command line overrides `evaluation.checkpoint`.

use std::path::PathBuf;
use std::process::ExitCode;

use log::{error, info};
use oct_ssm::core::evaluate;
use oct_ssm::{PipelineConfig, Result};

fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let mut config = PipelineConfig::load(config_path.as_deref())?;
    if let Some(checkpoint) = args.next() {
        config.evaluation.checkpoint = Some(PathBuf::from(checkpoint));
    }

    let report = evaluate(&config.evaluation)?;
    info!(
        "Evaluated {} subjects for {}",
        report.subjects.len(),
        report.ablation
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Evaluation failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
