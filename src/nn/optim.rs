//! Adam optimizer with serializable state

use std::collections::BTreeMap;

use ndarray::{ArrayD, ArrayViewMutD, Zip};
use serde::{Deserialize, Serialize};

use crate::{Result, SsmError};

/// Optimizer state stored in checkpoints
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    /// Learning rate
    pub learning_rate: f32,
    /// Exponential decay of the first moment
    pub beta1: f32,
    /// Exponential decay of the second moment
    pub beta2: f32,
    /// Denominator stabiliser
    pub eps: f32,
    /// Number of updates applied so far
    pub step: u64,
    /// First moment per parameter
    pub exp_avg: BTreeMap<String, ArrayD<f32>>,
    /// Second moment per parameter
    pub exp_avg_sq: BTreeMap<String, ArrayD<f32>>,
}

/// Adam with bias correction
#[derive(Clone, Debug)]
pub struct Adam {
    state: AdamState,
}

impl Adam {
    /// Create an optimizer with the usual defaults (`betas = (0.9, 0.999)`, `eps = 1e-8`)
    pub fn new(learning_rate: f32) -> Self {
        Adam {
            state: AdamState {
                learning_rate,
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
                step: 0,
                exp_avg: BTreeMap::new(),
                exp_avg_sq: BTreeMap::new(),
            },
        }
    }

    /// Set the moment decay rates
    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.state.beta1 = beta1;
        self.state.beta2 = beta2;
        self
    }

    /// Restore from checkpointed state
    pub fn from_state(state: AdamState) -> Self {
        Adam { state }
    }

    /// Current state
    pub fn state(&self) -> &AdamState {
        &self.state
    }

    /// Learning rate
    pub fn learning_rate(&self) -> f32 {
        self.state.learning_rate
    }

    /// Change the learning rate
    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.state.learning_rate = learning_rate;
    }

    /// Number of updates applied
    pub fn step_count(&self) -> u64 {
        self.state.step
    }

    /// Apply one update.
    ///
    /// `grads[i]` is the gradient of `params[i]`; moment buffers are keyed by
    /// parameter name and created on first use.
    pub fn step(
        &mut self,
        params: Vec<(String, ArrayViewMutD<'_, f32>)>,
        grads: &[ArrayD<f32>],
    ) -> Result<()> {
        if params.len() != grads.len() {
            return Err(SsmError::Shape(format!(
                "{} gradients for {} parameters",
                grads.len(),
                params.len()
            )));
        }

        for ((name, param), grad) in params.iter().zip(grads) {
            if param.shape() != grad.shape() {
                return Err(SsmError::Shape(format!(
                    "gradient for '{}' has shape {:?}, parameter has {:?}",
                    name,
                    grad.shape(),
                    param.shape()
                )));
            }
            let stale = |moments: &BTreeMap<String, ArrayD<f32>>| {
                moments.get(name).map_or(false, |m| m.shape() != grad.shape())
            };
            if stale(&self.state.exp_avg) || stale(&self.state.exp_avg_sq) {
                return Err(SsmError::Shape(format!("stale optimizer state for '{}'", name)));
            }
        }

        self.state.step += 1;
        let AdamState {
            learning_rate,
            beta1,
            beta2,
            eps,
            step,
            ..
        } = self.state;
        let t = step.min(i32::MAX as u64) as i32;
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2 = 1.0 - beta2.powi(t);

        for ((name, mut param), grad) in params.into_iter().zip(grads) {
            let m = self
                .state
                .exp_avg
                .entry(name.clone())
                .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
            let v = self
                .state
                .exp_avg_sq
                .entry(name)
                .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));

            Zip::from(&mut param)
                .and(m)
                .and(v)
                .and(grad)
                .for_each(|p, m, v, &g| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias_correction1;
                    let v_hat = *v / bias_correction2;
                    *p -= learning_rate * m_hat / (v_hat.sqrt() + eps);
                });
        }

        Ok(())
    }
}
