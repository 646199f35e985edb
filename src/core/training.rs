//! Training infrastructure for speckle separation

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use ndarray::{s, Array4, ArrayD};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::checkpoint::{Checkpoint, CheckpointPaths};
use crate::data::{extract_patches, patch_chunks, Batch, DataLoader, PatchConfig};
use crate::nn::{Adam, LossOutput, SeparationLoss, SeparationNet};
use crate::utils::progress::ProgressBar;
use crate::utils::timing::Timer;
use crate::utils::{save_json, save_progress_panel};
use crate::{Result, SsmError};

/// Whether a pass updates the model
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Forward, backward and optimizer step
    Train,
    /// Forward only
    Validate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Train => f.write_str("Train"),
            Phase::Validate => f.write_str("Val"),
        }
    }
}

/// Mean losses over the batches of one pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochLosses {
    /// Total objective
    pub loss: f32,
    /// Flow term
    pub flow_loss: f32,
    /// Noise term
    pub noise_loss: f32,
}

impl EpochLosses {
    fn accumulate(&mut self, output: &LossOutput) {
        self.loss += output.total;
        self.flow_loss += output.flow;
        self.noise_loss += output.noise;
    }

    fn averaged(self, batches: usize) -> Self {
        let n = batches.max(1) as f32;
        EpochLosses {
            loss: self.loss / n,
            flow_loss: self.flow_loss / n,
            noise_loss: self.noise_loss / n,
        }
    }
}

/// Per-epoch loss history
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingHistory {
    /// Training loss per epoch
    pub loss: Vec<f32>,
    /// Training flow term per epoch
    pub flow_loss: Vec<f32>,
    /// Training noise term per epoch
    pub noise_loss: Vec<f32>,
    /// Validation loss per epoch
    pub val_loss: Vec<f32>,
    /// Best validation loss
    pub best_val_loss: Option<f32>,
    /// 1-based epoch with the best validation loss
    pub best_epoch: usize,
    /// Wall time spent training, across resumes
    pub total_time: Duration,
}

impl TrainingHistory {
    /// Record the training losses of an epoch
    pub fn record_train(&mut self, losses: &EpochLosses) {
        self.loss.push(losses.loss);
        self.flow_loss.push(losses.flow_loss);
        self.noise_loss.push(losses.noise_loss);
    }

    /// Record a validation loss; returns true when it is a new best
    pub fn record_val(&mut self, val_loss: f32) -> bool {
        self.val_loss.push(val_loss);
        let improved = self.best_val_loss.map_or(true, |best| val_loss < best);
        if improved {
            self.best_val_loss = Some(val_loss);
            self.best_epoch = self.val_loss.len();
        }
        improved
    }

    /// Check if should stop early
    pub fn should_stop_early(&self, patience: usize) -> bool {
        self.val_loss.len() > self.best_epoch + patience
    }

    /// Get summary statistics
    pub fn summary(&self) -> String {
        format!(
            "Best validation loss: {} at epoch {}\nTotal training time: {:.2}s\nFinal train loss: {:.6}\nFinal val loss: {:.6}",
            self.best_val_loss
                .map(|v| format!("{:.6}", v))
                .unwrap_or_else(|| "n/a".to_string()),
            self.best_epoch,
            self.total_time.as_secs_f32(),
            self.loss.last().unwrap_or(&0.0),
            self.val_loss.last().unwrap_or(&0.0)
        )
    }
}

/// Loop settings
#[derive(Clone, Debug)]
pub struct TrainerOptions {
    /// Epochs to run in this session
    pub num_epochs: usize,
    /// Log loss components and whether parameters moved
    pub debug: bool,
    /// Write a progress panel after each validation pass
    pub visualise: bool,
    /// Patch mode when set
    pub patch: Option<PatchConfig>,
    /// Stop after this many epochs without validation improvement
    pub early_stopping_patience: Option<usize>,
    /// Panels and history destination
    pub output_dir: PathBuf,
    /// Draw per-batch progress bars
    pub show_progress: bool,
}

impl Default for TrainerOptions {
    fn default() -> Self {
        TrainerOptions {
            num_epochs: 10,
            debug: false,
            visualise: false,
            patch: None,
            early_stopping_patience: None,
            output_dir: PathBuf::from("outputs/training"),
            show_progress: true,
        }
    }
}

fn accumulate_grads(acc: &mut Vec<ArrayD<f32>>, grads: Vec<ArrayD<f32>>) {
    if acc.is_empty() {
        *acc = grads;
        return;
    }
    for (a, g) in acc.iter_mut().zip(grads) {
        *a += &g;
    }
}

/// Epoch loop over a model, its optimizer and a loss
pub struct Trainer {
    model: SeparationNet,
    optimizer: Adam,
    loss: Box<dyn SeparationLoss>,
    history: TrainingHistory,
    paths: CheckpointPaths,
    options: TrainerOptions,
    start_epoch: usize,
    end_epoch: usize,
    best_loss: Option<f32>,
    best_epoch: usize,
}

impl Trainer {
    /// Start a fresh run; checkpoints go next to `checkpoint_base`
    pub fn new(
        model: SeparationNet,
        optimizer: Adam,
        loss: Box<dyn SeparationLoss>,
        checkpoint_base: &Path,
        options: TrainerOptions,
    ) -> Result<Self> {
        if let Some(patch) = &options.patch {
            patch.validate()?;
        }
        Ok(Trainer {
            model,
            optimizer,
            loss,
            history: TrainingHistory::default(),
            paths: CheckpointPaths::from_base(checkpoint_base),
            start_epoch: 0,
            end_epoch: options.num_epochs,
            options,
            best_loss: None,
            best_epoch: 0,
        })
    }

    /// Continue a run; `options.num_epochs` more epochs are scheduled
    pub fn resume(
        checkpoint: Checkpoint,
        loss: Box<dyn SeparationLoss>,
        checkpoint_base: &Path,
        options: TrainerOptions,
    ) -> Result<Self> {
        if checkpoint.loss_name != loss.name() {
            warn!(
                "Checkpoint was trained with '{}', continuing with '{}'",
                checkpoint.loss_name,
                loss.name()
            );
        }
        let model = checkpoint.restore_model()?;
        let optimizer = checkpoint.restore_optimizer();
        let mut trainer = Trainer::new(model, optimizer, loss, checkpoint_base, options)?;
        trainer.start_epoch = checkpoint.epoch;
        trainer.end_epoch = checkpoint.epoch + trainer.options.num_epochs;
        trainer.best_loss = checkpoint.best_loss;
        trainer.best_epoch = checkpoint.best_epoch;
        trainer.history = checkpoint.history;

        info!(
            "Resuming at epoch {} with {} more epochs (best loss {:?})",
            trainer.start_epoch, trainer.options.num_epochs, trainer.best_loss
        );
        Ok(trainer)
    }

    /// The network
    pub fn model(&self) -> &SeparationNet {
        &self.model
    }

    /// Take the network out of the trainer
    pub fn into_model(self) -> SeparationNet {
        self.model
    }

    /// The optimizer
    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    /// Loss history so far
    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    /// Checkpoint locations
    pub fn paths(&self) -> &CheckpointPaths {
        &self.paths
    }

    /// First epoch of this session (0-based)
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Epoch after the last one scheduled
    pub fn end_epoch(&self) -> usize {
        self.end_epoch
    }

    /// Best validation loss and its 1-based epoch
    pub fn best(&self) -> (Option<f32>, usize) {
        (self.best_loss, self.best_epoch)
    }

    fn check_finite(output: &LossOutput, epoch: usize, phase: Phase) -> Result<()> {
        if output.total.is_finite() {
            Ok(())
        } else {
            Err(SsmError::NonFiniteLoss {
                phase: phase.to_string(),
                epoch: epoch + 1,
            })
        }
    }

    fn progress_bar(&self, epoch: usize, phase: Phase, total: usize) -> ProgressBar {
        let desc = format!("{} Epoch {}/{}", phase, epoch + 1, self.end_epoch);
        if self.options.show_progress {
            ProgressBar::new(desc, total)
        } else {
            ProgressBar::hidden(desc, total)
        }
    }

    /// Loss and parameter gradients of a whole-image batch
    fn image_gradients(&self, batch: &Batch) -> Result<(LossOutput, Vec<ArrayD<f32>>)> {
        let (output, cache) = self.model.forward_train(&batch.inputs)?;
        let loss = self
            .loss
            .compute(&output.flow, &output.noise, &batch.inputs, &batch.targets)?;
        let grads = self.model.backward(&cache, &loss.grad_flow, &loss.grad_noise)?;
        Ok((loss, grads))
    }

    /// Loss over all patches of a batch and gradients accumulated chunk by chunk
    fn patch_gradients(
        &self,
        inputs: &Array4<f32>,
        targets: &Array4<f32>,
        patch: &PatchConfig,
    ) -> Result<(LossOutput, Vec<ArrayD<f32>>)> {
        let output = self.model.forward_chunked(inputs, patch.patch_batch_size)?;
        let loss = self.loss.compute(&output.flow, &output.noise, inputs, targets)?;

        // Activations are recomputed per chunk to keep memory bounded
        let mut grads = Vec::new();
        for range in patch_chunks(inputs.dim().0, patch.patch_batch_size) {
            let chunk = inputs.slice(s![range.clone(), .., .., ..]).to_owned();
            let (_, cache) = self.model.forward_train(&chunk)?;
            let grad_flow = loss.grad_flow.slice(s![range.clone(), .., .., ..]).to_owned();
            let grad_noise = loss.grad_noise.slice(s![range, .., .., ..]).to_owned();
            accumulate_grads(&mut grads, self.model.backward(&cache, &grad_flow, &grad_noise)?);
        }
        Ok((loss, grads))
    }

    /// Parameter movement is checked in debug mode on the very first epoch
    fn checks_parameter_change(&self, epoch: usize) -> bool {
        self.options.debug && epoch == 0
    }

    fn apply_gradients(&mut self, grads: &[ArrayD<f32>], epoch: usize) -> Result<()> {
        let check = self.checks_parameter_change(epoch);
        let before = if check { Some(self.model.state_dict()) } else { None };

        self.optimizer.step(self.model.parameters_mut(), grads)?;

        if let Some(before) = before {
            let changed = before != self.model.state_dict();
            debug!("Parameters changed: {}", changed);
        }
        Ok(())
    }

    fn finish_pass(
        &mut self,
        running: EpochLosses,
        batches: usize,
        epoch: usize,
        phase: Phase,
        last_batch: Option<Batch>,
    ) -> Result<EpochLosses> {
        let avg = running.averaged(batches);
        if phase == Phase::Train {
            self.history.record_train(&avg);
        }
        info!(
            "{} Epoch {}/{}, Loss: {:.6}, Flow Loss: {:.6}, Noise Loss: {:.6}",
            phase,
            epoch + 1,
            self.end_epoch,
            avg.loss,
            avg.flow_loss,
            avg.noise_loss
        );

        if self.options.visualise && phase == Phase::Validate {
            if let Some(batch) = last_batch {
                self.visualise(&batch, epoch)?;
            }
        }
        Ok(avg)
    }

    /// One whole-image pass over a loader
    pub fn process_batch(&mut self, loader: &mut DataLoader, epoch: usize, phase: Phase) -> Result<EpochLosses> {
        self.loss.set_debug(self.options.debug && phase == Phase::Train);
        loader.reset();
        let batches = loader.num_batches();
        let mut bar = self.progress_bar(epoch, phase, batches);
        let mut running = EpochLosses::default();
        let mut last_batch = None;

        while let Some(batch) = loader.next_batch() {
            let output = match phase {
                Phase::Train => {
                    let (loss, grads) = self.image_gradients(&batch)?;
                    Self::check_finite(&loss, epoch, phase)?;
                    self.apply_gradients(&grads, epoch)?;
                    loss
                }
                Phase::Validate => {
                    let output = self.model.forward(&batch.inputs)?;
                    let loss = self
                        .loss
                        .compute(&output.flow, &output.noise, &batch.inputs, &batch.targets)?;
                    Self::check_finite(&loss, epoch, phase)?;
                    loss
                }
            };

            running.accumulate(&output);
            bar.set_postfix(&[
                ("loss", output.total),
                ("flow_loss", output.flow),
                ("noise_loss", output.noise),
            ]);
            bar.inc();
            last_batch = Some(batch);
        }

        self.finish_pass(running, batches, epoch, phase, last_batch)
    }

    /// One patch-mode pass over a loader
    pub fn process_batch_patch(
        &mut self,
        loader: &mut DataLoader,
        epoch: usize,
        phase: Phase,
    ) -> Result<EpochLosses> {
        let patch = self
            .options
            .patch
            .ok_or_else(|| SsmError::InvalidConfig("patch mode requires a patch configuration".to_string()))?;
        self.loss.set_debug(self.options.debug && phase == Phase::Train);
        loader.reset();
        let batches = loader.num_batches();
        let mut bar = self.progress_bar(epoch, phase, batches);
        let mut running = EpochLosses::default();
        let mut last_batch = None;

        while let Some(batch) = loader.next_batch() {
            let (input_patches, _) = extract_patches(&batch.inputs, &patch)?;
            let (target_patches, _) = extract_patches(&batch.targets, &patch)?;

            let output = match phase {
                Phase::Train => {
                    let (loss, grads) = self.patch_gradients(&input_patches, &target_patches, &patch)?;
                    Self::check_finite(&loss, epoch, phase)?;
                    self.apply_gradients(&grads, epoch)?;
                    loss
                }
                Phase::Validate => {
                    let output = self.model.forward_chunked(&input_patches, patch.patch_batch_size)?;
                    let loss =
                        self.loss
                            .compute(&output.flow, &output.noise, &input_patches, &target_patches)?;
                    Self::check_finite(&loss, epoch, phase)?;
                    loss
                }
            };

            running.accumulate(&output);
            bar.set_postfix(&[
                ("loss", output.total),
                ("flow_loss", output.flow),
                ("noise_loss", output.noise),
            ]);
            bar.inc();
            last_batch = Some(batch);
        }

        self.finish_pass(running, batches, epoch, phase, last_batch)
    }

    fn run_pass(&mut self, loader: &mut DataLoader, epoch: usize, phase: Phase) -> Result<EpochLosses> {
        if self.options.patch.is_some() {
            self.process_batch_patch(loader, epoch, phase)
        } else {
            self.process_batch(loader, epoch, phase)
        }
    }

    /// Write an input | target | flow | noise panel for a seeded random sample
    fn visualise(&self, batch: &Batch, epoch: usize) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(epoch as u64);
        let idx = rng.gen_range(0..batch.len());
        let input = batch.inputs.slice(s![idx..idx + 1, .., .., ..]).to_owned();
        let output = match &self.options.patch {
            Some(patch) => self.model.forward_patched(&input, patch)?,
            None => self.model.forward(&input)?,
        };

        let path = self
            .options
            .output_dir
            .join(format!("progress_epoch_{:03}.png", epoch + 1));
        save_progress_panel(
            &input.slice(s![0, 0, .., ..]).to_owned(),
            &batch.targets.slice(s![idx, 0, .., ..]).to_owned(),
            &output.flow.slice(s![0, 0, .., ..]).to_owned(),
            &output.noise.slice(s![0, 0, .., ..]).to_owned(),
            &path,
        )?;
        debug!("Progress panel written to {}", path.display());
        Ok(())
    }

    fn checkpoint(&self, epoch: usize, train_loss: f32, val_loss: f32) -> Checkpoint {
        let mut checkpoint = Checkpoint::new(
            &self.model,
            &self.optimizer,
            self.loss.name(),
            epoch,
            self.history.clone(),
        );
        checkpoint.best_loss = self.best_loss;
        checkpoint.best_epoch = self.best_epoch;
        checkpoint.train_loss = Some(train_loss);
        checkpoint.val_loss = Some(val_loss);
        checkpoint
    }

    /// Run the scheduled epochs.
    ///
    /// The best checkpoint is written whenever validation improves and stores
    /// the best epoch; the last checkpoint is written every epoch and stores
    /// the next epoch to run.
    pub fn train(&mut self, train_loader: &mut DataLoader, val_loader: &mut DataLoader) -> Result<TrainingHistory> {
        let timer = Timer::new("training");
        info!(
            "Training {} ({} parameters) with {} for epochs {}..{}",
            self.model.architecture(),
            self.model.num_parameters(),
            self.loss.name(),
            self.start_epoch + 1,
            self.end_epoch
        );

        for epoch in self.start_epoch..self.end_epoch {
            info!("Epoch {}/{}", epoch + 1, self.end_epoch);
            let train = self.run_pass(train_loader, epoch, Phase::Train)?;
            let val = self.run_pass(val_loader, epoch, Phase::Validate)?;
            self.history.record_val(val.loss);

            if self.best_loss.map_or(true, |best| val.loss < best) {
                self.best_loss = Some(val.loss);
                self.best_epoch = epoch + 1;
                info!(
                    "New best model found at epoch {} with validation loss {:.6}",
                    self.best_epoch, val.loss
                );
                self.checkpoint(self.best_epoch, train.loss, val.loss)
                    .save(&self.paths.best)?;
                info!("Best model checkpoint saved at {}", self.paths.best.display());
            }

            self.checkpoint(epoch + 1, train.loss, val.loss)
                .save(&self.paths.last)?;
            info!("Latest model checkpoint saved at {}", self.paths.last.display());

            if let Some(patience) = self.options.early_stopping_patience {
                if self.history.should_stop_early(patience) {
                    info!("Early stopping at epoch {}", epoch + 1);
                    break;
                }
            }
        }

        self.history.total_time += timer.duration();
        info!("Training complete!\n{}", self.history.summary());

        save_json(&self.history, self.options.output_dir.join("history.json"))?;
        #[cfg(feature = "viz")]
        {
            let plot = self.options.output_dir.join("loss_history.png");
            if let Err(e) = crate::utils::plot_history(&self.history, &plot) {
                warn!("Could not plot loss history: {}", e);
            }
        }

        Ok(self.history.clone())
    }
}
