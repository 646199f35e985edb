//! Training and evaluation entry points

use log::{info, warn};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::checkpoint::{Checkpoint, CheckpointPaths};
use super::config::{EvaluationSettings, TrainingSettings};
use super::training::{Trainer, TrainerOptions, TrainingHistory};
use crate::data::{load_sdoct_dataset, paired_preprocessing, split_dataset, DataLoader, PairedDataset};
use crate::eval::{
    display_grouped_metrics, display_metrics, evaluate_baseline, evaluate_model, normalise_sample,
    EvaluationReport, ImageMetrics,
};
use crate::nn::{Adam, LossKind, SeparationNet};
use crate::utils::{ensure_parent_dir, panel_image, save_grayscale};
use crate::{Result, SsmError};

/// Split a dataset and wrap both halves in loaders
pub fn build_loaders(dataset: PairedDataset, settings: &TrainingSettings) -> Result<(DataLoader, DataLoader)> {
    let (train, val) = split_dataset(dataset, settings.val_split, settings.seed)?;
    info!(
        "Dataset split: {} training samples, {} validation samples",
        train.len(),
        val.len()
    );
    Ok((
        DataLoader::new(train, settings.batch_size, true, settings.seed)?,
        DataLoader::new(val, settings.batch_size, false, settings.seed)?,
    ))
}

/// Fresh trainer, or a resumed one when `load_model` is set
pub fn build_trainer(settings: &TrainingSettings, loss_kind: LossKind) -> Result<Trainer> {
    let base = settings.checkpoint_path(loss_kind.name());
    let loss = loss_kind.build(settings.loss_parameters, settings.debug)?;
    let options = TrainerOptions {
        num_epochs: settings.num_epochs,
        debug: settings.debug,
        visualise: settings.visualise,
        patch: settings.patch,
        early_stopping_patience: settings.early_stopping_patience,
        output_dir: settings.output_dir.clone(),
        show_progress: true,
    };

    if settings.load_model {
        let path = settings
            .resume_from
            .clone()
            .unwrap_or_else(|| CheckpointPaths::from_base(&base).last);
        let checkpoint = Checkpoint::load(&path)?;
        if checkpoint.architecture != settings.model_name {
            warn!(
                "Configured model {} differs from checkpoint model {}, using the checkpoint",
                settings.model_name, checkpoint.architecture
            );
        }
        info!(
            "Model loaded from {} at epoch {} with loss {:?}",
            path.display(),
            checkpoint.epoch,
            checkpoint.best_loss
        );
        return Trainer::resume(checkpoint, loss, &base, options);
    }

    let model = SeparationNet::new(settings.model_name, settings.hidden_channels, settings.seed)?;
    Trainer::new(model, Adam::new(settings.learning_rate), loss, &base, options)
}

/// Train on an already assembled dataset
pub fn train_on_dataset(
    dataset: PairedDataset,
    settings: &TrainingSettings,
    loss_kind: LossKind,
) -> Result<TrainingHistory> {
    settings.validate()?;
    let (mut train_loader, mut val_loader) = build_loaders(dataset, settings)?;
    let mut trainer = build_trainer(settings, loss_kind)?;
    trainer.train(&mut train_loader, &mut val_loader)
}

/// Load and preprocess the configured patients, then train
pub fn train_speckle_separation(settings: &TrainingSettings, loss_kind: LossKind) -> Result<TrainingHistory> {
    settings.validate()?;
    let dataset = paired_preprocessing(
        &settings.data_dir,
        settings.start,
        settings.n_patients,
        settings.n_images,
        &settings.preprocessing,
    )?;
    info!("Dataset size: {} patients", dataset.patients().len());
    train_on_dataset(dataset, settings, loss_kind)
}

struct SubjectResult {
    subject: String,
    raw: Array2<f32>,
    reference: Array2<f32>,
    baseline: ImageMetrics,
    model: Option<(ImageMetrics, Array2<f32>)>,
}

/// Measure the raw scans and, with a checkpoint, the model on an SD-OCT set.
///
/// The first raw/averaged pair of every subject is used. Denoised images go
/// to `<run_dir>/images`, the report to `<run_dir>/metrics.json`.
pub fn evaluate(settings: &EvaluationSettings) -> Result<EvaluationReport> {
    settings.validate()?;
    let dataset = load_sdoct_dataset(&settings.data_dir)?;
    let limit = settings.n_patients.unwrap_or(usize::MAX);
    let subjects: Vec<_> = dataset.into_iter().take(limit).collect();

    let model = match &settings.checkpoint {
        Some(path) => Some(Checkpoint::load(path)?.restore_model()?),
        None => {
            warn!("No checkpoint configured, evaluating the baseline only");
            None
        }
    };

    let run_dir = settings.run_dir();
    let results = subjects
        .par_iter()
        .map(|(subject, sample)| {
            let (raw, reference) = match (sample.raw.first(), sample.avg.first()) {
                (Some(raw), Some(avg)) => normalise_sample(raw, avg, settings.image_size)?,
                _ => {
                    return Err(SsmError::Data(format!("subject {} has no scans", subject)));
                }
            };
            let baseline = evaluate_baseline(&raw, &reference, settings.roi_size)?;
            let model = match &model {
                Some(model) => {
                    let (metrics, denoised) =
                        evaluate_model(model, &raw, &reference, settings.patch.as_ref(), settings.roi_size)?;
                    save_grayscale(&denoised, &run_dir.join("images").join(format!("{}_flow.png", subject)))?;
                    Some((metrics, denoised))
                }
                None => None,
            };
            Ok(SubjectResult {
                subject: subject.clone(),
                raw,
                reference,
                baseline,
                model,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut report = EvaluationReport {
        ablation: settings.ablation.clone().unwrap_or_default(),
        checkpoint: settings.checkpoint.as_ref().map(|p| p.display().to_string()),
        ..Default::default()
    };
    for result in &results {
        report.insert(&result.subject, "baseline", result.baseline);
        if let Some((metrics, _)) = &result.model {
            report.insert(&result.subject, "ssm", *metrics);
        }
    }
    report.finalise();

    // One seeded subject is shown in full
    let mut rng = StdRng::seed_from_u64(settings.seed);
    if let Some(showcase) = results.get(rng.gen_range(0..results.len().max(1))) {
        info!("Sample subject: {}", showcase.subject);
        display_metrics(&report.subjects[&showcase.subject]);
        let mut images: Vec<&Array2<f32>> = vec![&showcase.raw, &showcase.reference];
        if let Some((_, denoised)) = &showcase.model {
            images.push(denoised);
        }
        let path = run_dir.join("showcase.png");
        ensure_parent_dir(&path)?;
        panel_image(&images)?.save(&path)?;
    }

    display_grouped_metrics(&report.grouped());
    report.save(&run_dir.join("metrics.json"))?;
    Ok(report)
}
