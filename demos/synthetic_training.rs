//! Train on synthetic phantoms, then denoise one held-out scan.
//!
//! Run with `cargo run --example synthetic_training`.

use log::info;
use oct_ssm::core::{train_on_dataset, TrainingSettings};
use oct_ssm::data::{synthetic_pairs, PatchConfig};
use oct_ssm::eval::{evaluate_baseline, evaluate_model};
use oct_ssm::{Checkpoint, LossKind, Result};

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let dir = std::env::temp_dir().join("oct_ssm_synthetic");
    let settings = TrainingSettings {
        batch_size: 4,
        num_epochs: 5,
        hidden_channels: 4,
        learning_rate: 1e-3,
        checkpoint: dir.join("ssm_{loss_fn}.json").display().to_string(),
        output_dir: dir.join("training"),
        patch: Some(PatchConfig::new(16).with_stride(8)),
        visualise: true,
        ..Default::default()
    };

    let history = train_on_dataset(synthetic_pairs(16, 32, 32, 7), &settings, LossKind::Custom)?;
    info!("{}", history.summary());

    let model = Checkpoint::load(&dir.join("ssm_custom_loss_best.json"))?.restore_model()?;
    let held_out = synthetic_pairs(1, 32, 32, 99).into_pairs().remove(0);
    let baseline = evaluate_baseline(&held_out.input, &held_out.target, 8)?;
    let (metrics, _) = evaluate_model(&model, &held_out.input, &held_out.target, settings.patch.as_ref(), 8)?;
    info!("Baseline PSNR {:.2} dB, SSIM {:.3}", baseline.psnr, baseline.ssim);
    info!("Model    PSNR {:.2} dB, SSIM {:.3}", metrics.psnr, metrics.ssim);
    Ok(())
}
