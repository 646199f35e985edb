//! YAML pipeline configuration

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::data::{PatchConfig, PreprocessConfig};
use crate::nn::{Architecture, LossParameters};
use crate::{Result, SsmError};

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "SPECKLE_CONFIG";

/// Placeholder in the checkpoint template replaced by the loss name
pub const LOSS_PLACEHOLDER: &str = "{loss_fn}";

/// Training section
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// Compute device; only `cpu` is available
    pub device: String,
    /// Directory with one sub-directory of scans per patient
    pub data_dir: PathBuf,
    /// Number of patients to load
    pub n_patients: usize,
    /// Index of the first patient directory
    pub start: usize,
    /// Scans loaded per patient
    pub n_images: usize,
    /// Images per batch
    pub batch_size: usize,
    /// Adam learning rate
    pub learning_rate: f32,
    /// Epochs to run (added to the resumed epoch)
    pub num_epochs: usize,
    /// Checkpoint path template, may contain `{loss_fn}`
    pub checkpoint: String,
    /// Network variant
    pub model_name: Architecture,
    /// Hidden layer width
    pub hidden_channels: usize,
    /// Resume from a checkpoint
    pub load_model: bool,
    /// Explicit checkpoint to resume from; defaults to the `_last` checkpoint
    pub resume_from: Option<PathBuf>,
    /// Log loss components and parameter updates
    pub debug: bool,
    /// Write a progress panel after each validation phase
    pub visualise: bool,
    /// Seed for initialisation, splitting and shuffling
    pub seed: u64,
    /// Fraction of pairs held out for validation
    pub val_split: f32,
    /// Custom loss weights
    pub loss_parameters: LossParameters,
    /// Train on patches instead of whole images
    pub patch: Option<PatchConfig>,
    /// Stop after this many epochs without validation improvement
    pub early_stopping_patience: Option<usize>,
    /// Target construction
    pub preprocessing: PreprocessConfig,
    /// Where panels and the history are written
    pub output_dir: PathBuf,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        TrainingSettings {
            device: "cpu".to_string(),
            data_dir: PathBuf::from("data/octa"),
            n_patients: 4,
            start: 0,
            n_images: 10,
            batch_size: 8,
            learning_rate: 1e-4,
            num_epochs: 50,
            checkpoint: "checkpoints/ssm_{loss_fn}.json".to_string(),
            model_name: Architecture::Simple,
            hidden_channels: 16,
            load_model: false,
            resume_from: None,
            debug: false,
            visualise: false,
            seed: 42,
            val_split: 0.2,
            loss_parameters: LossParameters::default(),
            patch: None,
            early_stopping_patience: None,
            preprocessing: PreprocessConfig::default(),
            output_dir: PathBuf::from("outputs/training"),
        }
    }
}

impl TrainingSettings {
    /// Checkpoint base path for a loss
    pub fn checkpoint_path(&self, loss_name: &str) -> PathBuf {
        PathBuf::from(self.checkpoint.replace(LOSS_PLACEHOLDER, loss_name))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SsmError::InvalidConfig("batch_size must be positive".to_string()));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(SsmError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.val_split) {
            return Err(SsmError::InvalidConfig(format!(
                "val_split must be in [0, 1), got {}",
                self.val_split
            )));
        }
        if self.n_patients == 0 || self.n_images == 0 {
            return Err(SsmError::InvalidConfig(
                "n_patients and n_images must be positive".to_string(),
            ));
        }
        if self.hidden_channels == 0 {
            return Err(SsmError::InvalidConfig("hidden_channels must be positive".to_string()));
        }
        if self.checkpoint.trim().is_empty() {
            return Err(SsmError::InvalidConfig("checkpoint path is empty".to_string()));
        }
        if let Some(patch) = &self.patch {
            patch.validate()?;
        }
        self.loss_parameters.validate()?;
        self.preprocessing.validate()?;
        if !self.device.eq_ignore_ascii_case("cpu") {
            warn!("Device '{}' is not available, running on cpu", self.device);
        }
        Ok(())
    }
}

/// Evaluation section
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSettings {
    /// SD-OCT root laid out as `<subject>/{raw,avg}`
    pub data_dir: PathBuf,
    /// Model checkpoint; without one only the baseline is measured
    pub checkpoint: Option<PathBuf>,
    /// Limit on the number of subjects
    pub n_patients: Option<usize>,
    /// Sub-directory of `output_dir` for this run
    pub ablation: Option<String>,
    /// Report and image destination
    pub output_dir: PathBuf,
    /// Square side scans are resized to
    pub image_size: Option<usize>,
    /// Side of the CNR/ENL regions
    pub roi_size: usize,
    /// Patch inference; whole-image inference when absent
    pub patch: Option<PatchConfig>,
    /// Seed picking the showcase subject
    pub seed: u64,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        EvaluationSettings {
            data_dir: PathBuf::from("data/sdoct"),
            checkpoint: None,
            n_patients: None,
            ablation: None,
            output_dir: PathBuf::from("outputs/evaluation"),
            image_size: Some(256),
            roi_size: 20,
            patch: Some(PatchConfig::default()),
            seed: 42,
        }
    }
}

impl EvaluationSettings {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.roi_size == 0 {
            return Err(SsmError::InvalidConfig("roi_size must be positive".to_string()));
        }
        if self.image_size == Some(0) {
            return Err(SsmError::InvalidConfig("image_size must be positive".to_string()));
        }
        if let Some(patch) = &self.patch {
            patch.validate()?;
        }
        Ok(())
    }

    /// Directory this run writes into
    pub fn run_dir(&self) -> PathBuf {
        match &self.ablation {
            Some(ablation) => self.output_dir.join(ablation),
            None => self.output_dir.clone(),
        }
    }
}

/// Whole configuration file
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Training section
    pub training: TrainingSettings,
    /// Evaluation section
    #[serde(alias = "eval")]
    pub evaluation: EvaluationSettings,
}

impl PipelineConfig {
    /// Parse YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut config: PipelineConfig = serde_yaml::from_str(text)?;
        config.fill_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from `path`, else from `$SPECKLE_CONFIG`, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(env_path) => Self::from_file(Path::new(&env_path)),
            None => {
                warn!("No configuration given and {} is unset, using defaults", CONFIG_ENV_VAR);
                let mut config = PipelineConfig::default();
                config.fill_defaults();
                Ok(config)
            }
        }
    }

    /// Derive values that depend on other sections
    fn fill_defaults(&mut self) {
        if self.evaluation.ablation.is_none() {
            self.evaluation.ablation = Some(format!("patient_count/{}_patients", self.training.n_patients));
        }
    }

    /// Validate both sections
    pub fn validate(&self) -> Result<()> {
        self.training.validate()?;
        self.evaluation.validate()
    }

    /// Serialise to YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
