//! Flow/noise separation losses
//!
//! Every loss returns its value together with the gradients with respect to
//! both predicted components, so the trainer never needs a tape.

use std::fmt;
use std::str::FromStr;

use log::debug;
use ndarray::{Array4, Zip};
use serde::{Deserialize, Serialize};

use crate::{Result, SsmError};

/// Loss value, its flow/noise split and output gradients
#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Total objective
    pub total: f32,
    /// Part of the objective attributed to the flow component
    pub flow: f32,
    /// Part of the objective attributed to the noise component
    pub noise: f32,
    /// d(total) / d(flow)
    pub grad_flow: Array4<f32>,
    /// d(total) / d(noise)
    pub grad_noise: Array4<f32>,
}

/// Objective over predicted flow and noise components
pub trait SeparationLoss: Send + Sync {
    /// Name used in checkpoint paths and logs
    fn name(&self) -> &'static str;

    /// Evaluate the loss on a batch.
    ///
    /// All four tensors share one `[N, 1, H, W]` shape.
    fn compute(
        &self,
        flow: &Array4<f32>,
        noise: &Array4<f32>,
        input: &Array4<f32>,
        target: &Array4<f32>,
    ) -> Result<LossOutput>;

    /// Whether individual terms are logged
    fn debug(&self) -> bool {
        false
    }

    /// Turn term logging on or off
    fn set_debug(&mut self, _debug: bool) {}
}

fn check_shapes(
    flow: &Array4<f32>,
    noise: &Array4<f32>,
    input: &Array4<f32>,
    target: &Array4<f32>,
) -> Result<f32> {
    let shape = flow.dim();
    if noise.dim() != shape || input.dim() != shape || target.dim() != shape {
        return Err(SsmError::Shape(format!(
            "loss inputs disagree: flow {:?}, noise {:?}, input {:?}, target {:?}",
            shape,
            noise.dim(),
            input.dim(),
            target.dim()
        )));
    }
    if flow.is_empty() {
        return Err(SsmError::Shape("loss evaluated on an empty batch".to_string()));
    }
    Ok(flow.len() as f32)
}

/// Weights of the multi-term objective
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossParameters {
    /// Weight of `mean((flow - target)^2)`
    pub flow_weight: f32,
    /// Weight of `mean((flow + noise - input)^2)`
    pub reconstruction_weight: f32,
    /// Weight of `mean(target * noise^2)`
    pub noise_overlap_weight: f32,
    /// Weight of `mean(noise)^2`
    pub noise_mean_weight: f32,
}

impl Default for LossParameters {
    fn default() -> Self {
        LossParameters {
            flow_weight: 1.0,
            reconstruction_weight: 1.0,
            noise_overlap_weight: 0.5,
            noise_mean_weight: 0.1,
        }
    }
}

impl LossParameters {
    /// Weights must be finite and non-negative
    pub fn validate(&self) -> Result<()> {
        let weights = [
            ("flow_weight", self.flow_weight),
            ("reconstruction_weight", self.reconstruction_weight),
            ("noise_overlap_weight", self.noise_overlap_weight),
            ("noise_mean_weight", self.noise_mean_weight),
        ];
        for (name, value) in weights {
            if !value.is_finite() || value < 0.0 {
                return Err(SsmError::InvalidConfig(format!(
                    "loss weight {} must be finite and non-negative, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Mean squared error between flow and target; noise is unconstrained
#[derive(Debug, Clone, Copy, Default)]
pub struct MseLoss;

impl SeparationLoss for MseLoss {
    fn name(&self) -> &'static str {
        LossKind::Mse.name()
    }

    fn compute(
        &self,
        flow: &Array4<f32>,
        noise: &Array4<f32>,
        input: &Array4<f32>,
        target: &Array4<f32>,
    ) -> Result<LossOutput> {
        let n = check_shapes(flow, noise, input, target)?;
        let residual = flow - target;
        let total = residual.mapv(|r| r * r).sum() / n;

        Ok(LossOutput {
            total,
            flow: total,
            noise: 0.0,
            grad_flow: residual.mapv(|r| 2.0 * r / n),
            grad_noise: Array4::zeros(noise.raw_dim()),
        })
    }
}

/// Weighted combination of flow fidelity and speckle constraints
#[derive(Debug, Clone)]
pub struct CustomLoss {
    params: LossParameters,
    debug: bool,
}

impl CustomLoss {
    /// Create the loss; `debug` logs every component
    pub fn new(params: LossParameters, debug: bool) -> Result<Self> {
        params.validate()?;
        Ok(CustomLoss { params, debug })
    }

    /// Current weights
    pub fn parameters(&self) -> &LossParameters {
        &self.params
    }
}

impl SeparationLoss for CustomLoss {
    fn name(&self) -> &'static str {
        LossKind::Custom.name()
    }

    fn debug(&self) -> bool {
        self.debug
    }

    fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    fn compute(
        &self,
        flow: &Array4<f32>,
        noise: &Array4<f32>,
        input: &Array4<f32>,
        target: &Array4<f32>,
    ) -> Result<LossOutput> {
        let n = check_shapes(flow, noise, input, target)?;
        let p = &self.params;

        let flow_residual = flow - target;
        let recon_residual = &(flow + noise) - input;

        let flow_term = flow_residual.mapv(|r| r * r).sum() / n;
        let recon_term = recon_residual.mapv(|r| r * r).sum() / n;
        let overlap_term = Zip::from(target)
            .and(noise)
            .fold(0.0, |acc, &t, &z| acc + t * z * z)
            / n;
        let noise_mean = noise.sum() / n;
        let mean_term = noise_mean * noise_mean;

        let flow_loss = p.flow_weight * flow_term;
        let noise_loss = p.reconstruction_weight * recon_term
            + p.noise_overlap_weight * overlap_term
            + p.noise_mean_weight * mean_term;

        if self.debug {
            debug!(
                "loss terms: flow={:.6} reconstruction={:.6} overlap={:.6} noise_mean={:.6}",
                flow_term, recon_term, overlap_term, mean_term
            );
        }

        let scale = 2.0 / n;
        let grad_flow = Zip::from(&flow_residual)
            .and(&recon_residual)
            .map_collect(|&f, &r| scale * (p.flow_weight * f + p.reconstruction_weight * r));
        let grad_noise = Zip::from(&recon_residual)
            .and(target)
            .and(noise)
            .map_collect(|&r, &t, &z| {
                scale
                    * (p.reconstruction_weight * r
                        + p.noise_overlap_weight * t * z
                        + p.noise_mean_weight * noise_mean)
            });

        Ok(LossOutput {
            total: flow_loss + noise_loss,
            flow: flow_loss,
            noise: noise_loss,
            grad_flow,
            grad_noise,
        })
    }
}

/// Selectable loss function
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    /// [`MseLoss`]
    #[serde(rename = "mse")]
    Mse,
    /// [`CustomLoss`]
    #[serde(rename = "custom_loss")]
    Custom,
}

impl LossKind {
    /// Name used in configuration and checkpoint paths
    pub fn name(&self) -> &'static str {
        match self {
            LossKind::Mse => "mse",
            LossKind::Custom => "custom_loss",
        }
    }

    /// Instantiate the loss
    pub fn build(&self, params: LossParameters, debug: bool) -> Result<Box<dyn SeparationLoss>> {
        Ok(match self {
            LossKind::Mse => Box::new(MseLoss),
            LossKind::Custom => Box::new(CustomLoss::new(params, debug)?),
        })
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LossKind {
    type Err = SsmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mse" => Ok(LossKind::Mse),
            "custom" | "custom_loss" => Ok(LossKind::Custom),
            other => Err(SsmError::InvalidConfig(format!("unknown loss '{}'", other))),
        }
    }
}
