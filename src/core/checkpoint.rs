//! Checkpoint / resume state
//!
//! A checkpoint carries everything needed to continue a run: parameters,
//! optimizer moments, the loss history and best-so-far bookkeeping. Files are
//! JSON sealed with a SHA-256 digest of the tensors, so a truncated or edited
//! file is rejected on load instead of silently resuming from garbage.

use std::path::{Path, PathBuf};

use log::info;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::training::TrainingHistory;
use crate::nn::{Adam, AdamState, Architecture, SeparationNet, StateDict};
use crate::utils::{load_json, save_json};
use crate::{Result, SsmError};

/// Saved training state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Epoch to resume from
    pub epoch: usize,
    /// Network variant
    pub architecture: Architecture,
    /// Hidden layer width
    pub hidden_channels: usize,
    /// Loss the run optimises
    pub loss_name: String,
    /// Network parameters
    pub model_state: StateDict,
    /// Adam state
    pub optimizer_state: AdamState,
    /// Best validation loss so far
    pub best_loss: Option<f32>,
    /// 1-based epoch of the best validation loss
    pub best_epoch: usize,
    /// Mean training loss of the saved epoch
    pub train_loss: Option<f32>,
    /// Validation loss of the saved epoch
    pub val_loss: Option<f32>,
    /// Loss history up to the saved epoch
    pub history: TrainingHistory,
    /// Hex SHA-256 over the tensors
    #[serde(default)]
    pub digest: String,
}

fn hash_tensors(hasher: &mut Sha256, tensors: &std::collections::BTreeMap<String, ArrayD<f32>>) {
    for (name, tensor) in tensors {
        hasher.update(name.as_bytes());
        for &dim in tensor.shape() {
            hasher.update((dim as u64).to_le_bytes());
        }
        for &value in tensor.iter() {
            hasher.update(value.to_le_bytes());
        }
    }
}

impl Checkpoint {
    /// Snapshot a model and its optimizer
    pub fn new(
        model: &SeparationNet,
        optimizer: &Adam,
        loss_name: &str,
        epoch: usize,
        history: TrainingHistory,
    ) -> Self {
        Checkpoint {
            epoch,
            architecture: model.architecture(),
            hidden_channels: model.hidden_channels(),
            loss_name: loss_name.to_string(),
            model_state: model.state_dict(),
            optimizer_state: optimizer.state().clone(),
            best_loss: None,
            best_epoch: 0,
            train_loss: None,
            val_loss: None,
            history,
            digest: String::new(),
        }
    }

    /// Digest of the model and optimizer tensors
    pub fn compute_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.architecture.name().as_bytes());
        hasher.update((self.hidden_channels as u64).to_le_bytes());
        hash_tensors(&mut hasher, &self.model_state);
        hasher.update(self.optimizer_state.step.to_le_bytes());
        hash_tensors(&mut hasher, &self.optimizer_state.exp_avg);
        hash_tensors(&mut hasher, &self.optimizer_state.exp_avg_sq);
        format!("{:x}", hasher.finalize())
    }

    /// Seal and write to `path`, creating parent directories
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.digest = self.compute_digest();
        save_json(self, path)
    }

    /// Read and verify a checkpoint
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SsmError::Checkpoint(format!("{} does not exist", path.display())));
        }
        let checkpoint: Checkpoint = load_json(path)?;
        let expected = checkpoint.compute_digest();
        if checkpoint.digest != expected {
            return Err(SsmError::Checkpoint(format!(
                "digest mismatch in {} (stored '{}', computed '{}')",
                path.display(),
                checkpoint.digest,
                expected
            )));
        }
        info!(
            "Loaded checkpoint {} at epoch {} (best loss {:?} at epoch {})",
            path.display(),
            checkpoint.epoch,
            checkpoint.best_loss,
            checkpoint.best_epoch
        );
        Ok(checkpoint)
    }

    /// Build the stored network
    pub fn restore_model(&self) -> Result<SeparationNet> {
        let mut model = SeparationNet::new(self.architecture, self.hidden_channels, 0)?;
        model.load_state_dict(&self.model_state)?;
        Ok(model)
    }

    /// Build the stored optimizer
    pub fn restore_optimizer(&self) -> Adam {
        Adam::from_state(self.optimizer_state.clone())
    }
}

/// Locations of the rolling and best checkpoints for one run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointPaths {
    /// Overwritten after every epoch
    pub last: PathBuf,
    /// Overwritten when validation improves
    pub best: PathBuf,
}

impl CheckpointPaths {
    /// `<stem>_last.<ext>` and `<stem>_best.<ext>` next to `base`
    pub fn from_base(base: &Path) -> Self {
        let suffixed = |suffix: &str| {
            let stem = base
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "checkpoint".to_string());
            let name = match base.extension() {
                Some(ext) => format!("{}_{}.{}", stem, suffix, ext.to_string_lossy()),
                None => format!("{}_{}", stem, suffix),
            };
            base.with_file_name(name)
        };
        CheckpointPaths {
            last: suffixed("last"),
            best: suffixed("best"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("oct_ssm_ckpt_{}", std::process::id()))
            .join(name)
    }

    fn sample_checkpoint() -> Checkpoint {
        let model = SeparationNet::new(Architecture::Attention, 3, 11).unwrap();
        let optimizer = Adam::new(1e-3);
        let mut history = TrainingHistory::default();
        history.record_val(0.4);
        let mut checkpoint = Checkpoint::new(&model, &optimizer, "custom_loss", 2, history);
        checkpoint.best_loss = Some(0.4);
        checkpoint.best_epoch = 1;
        checkpoint
    }

    #[test]
    fn test_paths_from_base() {
        let paths = CheckpointPaths::from_base(Path::new("runs/ssm_mse.json"));
        assert_eq!(paths.last, PathBuf::from("runs/ssm_mse_last.json"));
        assert_eq!(paths.best, PathBuf::from("runs/ssm_mse_best.json"));

        let bare = CheckpointPaths::from_base(Path::new("model"));
        assert_eq!(bare.last, PathBuf::from("model_last"));
    }

    #[test]
    fn test_save_load_restore() {
        let path = temp_path("roundtrip.json");
        let mut checkpoint = sample_checkpoint();
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.epoch, 2);
        assert_eq!(loaded.best_loss, Some(0.4));
        assert_eq!(loaded.history.val_loss, vec![0.4]);
        assert_eq!(loaded.digest, checkpoint.digest);

        let model = loaded.restore_model().unwrap();
        assert_eq!(model.architecture(), Architecture::Attention);
        assert_eq!(model.state_dict(), checkpoint.model_state);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_tampered_checkpoint_is_rejected() {
        let path = temp_path("tampered.json");
        let mut checkpoint = sample_checkpoint();
        checkpoint.save(&path).unwrap();

        if let Some(bias) = checkpoint.model_state.get_mut("head.bias") {
            bias.mapv_inplace(|v| v + 1.0);
        }
        save_json(&checkpoint, &path).unwrap();
        assert!(matches!(Checkpoint::load(&path), Err(SsmError::Checkpoint(_))));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_checkpoint() {
        assert!(Checkpoint::load(Path::new("/nonexistent/ckpt.json")).is_err());
    }
}
