//! Speckle separation network
//!
//! A shallow fully-convolutional network with two output heads. The flow head
//! is sigmoid-bounded to `[0, 1]`; the noise head is linear because speckle is
//! signed once the structural signal has been removed.

use std::fmt;

use ndarray::{s, Array4, ArrayD, ArrayViewD, ArrayViewMutD, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::layers::{relu, relu_backward, sigmoid, sigmoid_backward, Conv2d, StateDict};
use crate::data::{concat_batches, extract_patches, patch_chunks, reconstruct_from_patches, PatchConfig};
use crate::{Result, SsmError};

/// Network architecture variant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    /// Two conv-relu blocks followed by the two-channel head
    #[serde(rename = "SSMSimple", alias = "simple")]
    Simple,
    /// Same as `Simple` with a spatial attention gate before the head
    #[serde(rename = "SSMAttention", alias = "attention")]
    Attention,
}

impl Architecture {
    /// Configuration name of the architecture
    pub fn name(&self) -> &'static str {
        match self {
            Architecture::Simple => "SSMSimple",
            Architecture::Attention => "SSMAttention",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Flow and noise components predicted for a batch
#[derive(Debug, Clone)]
pub struct SeparationOutput {
    /// Structural component, `[B, 1, H, W]` in `[0, 1]`
    pub flow: Array4<f32>,
    /// Speckle component, `[B, 1, H, W]`
    pub noise: Array4<f32>,
}

/// Activations retained by [`SeparationNet::forward_train`]
#[derive(Debug, Clone)]
pub struct ForwardCache {
    input: Array4<f32>,
    hidden1: Array4<f32>,
    hidden2: Array4<f32>,
    attention: Option<Array4<f32>>,
    gated: Array4<f32>,
    flow: Array4<f32>,
}

/// Speckle separation network
#[derive(Debug, Clone)]
pub struct SeparationNet {
    architecture: Architecture,
    hidden_channels: usize,
    conv1: Conv2d,
    conv2: Conv2d,
    gate: Option<Conv2d>,
    head: Conv2d,
}

impl SeparationNet {
    /// Create a freshly initialised network
    pub fn new(architecture: Architecture, hidden_channels: usize, seed: u64) -> Result<Self> {
        if hidden_channels == 0 {
            return Err(SsmError::InvalidConfig("hidden_channels must be positive".to_string()));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let conv1 = Conv2d::new(1, hidden_channels, 3, &mut rng)?;
        let conv2 = Conv2d::new(hidden_channels, hidden_channels, 3, &mut rng)?;
        let gate = match architecture {
            Architecture::Attention => Some(Conv2d::new(hidden_channels, 1, 1, &mut rng)?),
            Architecture::Simple => None,
        };
        let head = Conv2d::new(hidden_channels, 2, 3, &mut rng)?;

        Ok(SeparationNet {
            architecture,
            hidden_channels,
            conv1,
            conv2,
            gate,
            head,
        })
    }

    /// Architecture variant
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Width of the hidden layers
    pub fn hidden_channels(&self) -> usize {
        self.hidden_channels
    }

    fn check_input(input: &Array4<f32>) -> Result<()> {
        if input.dim().1 != 1 {
            return Err(SsmError::Shape(format!(
                "expected single-channel input [B, 1, H, W], got {:?}",
                input.dim()
            )));
        }
        Ok(())
    }

    /// Inference forward pass
    pub fn forward(&self, input: &Array4<f32>) -> Result<SeparationOutput> {
        let (output, _) = self.forward_train(input)?;
        Ok(output)
    }

    /// Forward pass that keeps the activations needed by [`SeparationNet::backward`]
    pub fn forward_train(&self, input: &Array4<f32>) -> Result<(SeparationOutput, ForwardCache)> {
        Self::check_input(input)?;

        let hidden1 = relu(&self.conv1.forward(input)?);
        let hidden2 = relu(&self.conv2.forward(&hidden1)?);

        let (gated, attention) = match &self.gate {
            Some(gate) => {
                let attention = sigmoid(&gate.forward(&hidden2)?);
                // [B, C, H, W] * [B, 1, H, W] broadcasts over channels
                let gated = &hidden2 * &attention;
                (gated, Some(attention))
            }
            None => (hidden2.clone(), None),
        };

        let head_out = self.head.forward(&gated)?;
        let flow = sigmoid(&head_out.slice(s![.., 0..1, .., ..]).to_owned());
        let noise = head_out.slice(s![.., 1..2, .., ..]).to_owned();

        let cache = ForwardCache {
            input: input.clone(),
            hidden1,
            hidden2,
            attention,
            gated,
            flow: flow.clone(),
        };

        Ok((SeparationOutput { flow, noise }, cache))
    }

    /// Backpropagate output gradients.
    ///
    /// Returns one gradient per parameter, in the order of
    /// [`SeparationNet::parameters_mut`].
    pub fn backward(
        &self,
        cache: &ForwardCache,
        grad_flow: &Array4<f32>,
        grad_noise: &Array4<f32>,
    ) -> Result<Vec<ArrayD<f32>>> {
        if grad_flow.dim() != cache.flow.dim() || grad_noise.dim() != cache.flow.dim() {
            return Err(SsmError::Shape(format!(
                "output gradients {:?}/{:?} do not match outputs {:?}",
                grad_flow.dim(),
                grad_noise.dim(),
                cache.flow.dim()
            )));
        }

        let (batch, _, height, width) = cache.flow.dim();
        let mut grad_head = Array4::zeros((batch, 2, height, width));
        grad_head
            .slice_mut(s![.., 0..1, .., ..])
            .assign(&sigmoid_backward(grad_flow, &cache.flow));
        grad_head.slice_mut(s![.., 1..2, .., ..]).assign(grad_noise);

        let mut head_grads = self.head.backward(&cache.gated, &grad_head, true)?;
        let grad_gated = head_grads.take_input()?;

        let (grad_hidden2, gate_grads) = match (&self.gate, &cache.attention) {
            (Some(gate), Some(attention)) => {
                let mut grad_hidden2 = &grad_gated * attention;
                let grad_attention = (&grad_gated * &cache.hidden2)
                    .sum_axis(Axis(1))
                    .insert_axis(Axis(1));
                let grad_gate_pre = sigmoid_backward(&grad_attention, attention);
                let mut gate_grads = gate.backward(&cache.hidden2, &grad_gate_pre, true)?;
                grad_hidden2 += &gate_grads.take_input()?;
                (grad_hidden2, Some(gate_grads))
            }
            (None, None) => (grad_gated, None),
            _ => {
                return Err(SsmError::Shape(
                    "forward cache does not match the network architecture".to_string(),
                ))
            }
        };

        let grad_pre2 = relu_backward(&grad_hidden2, &cache.hidden2);
        let mut conv2_grads = self.conv2.backward(&cache.hidden1, &grad_pre2, true)?;
        let grad_pre1 = relu_backward(&conv2_grads.take_input()?, &cache.hidden1);
        let conv1_grads = self.conv1.backward(&cache.input, &grad_pre1, false)?;

        let mut grads = Vec::with_capacity(8);
        grads.extend(conv1_grads.into_tensors());
        grads.extend(conv2_grads.into_tensors());
        if let Some(gate_grads) = gate_grads {
            grads.extend(gate_grads.into_tensors());
        }
        grads.extend(head_grads.into_tensors());
        Ok(grads)
    }

    /// Run already-extracted patches through the network in chunks
    pub fn forward_chunked(&self, patches: &Array4<f32>, chunk_size: usize) -> Result<SeparationOutput> {
        let mut flows = Vec::new();
        let mut noises = Vec::new();
        for range in patch_chunks(patches.dim().0, chunk_size) {
            let chunk = patches.slice(s![range, .., .., ..]).to_owned();
            let output = self.forward(&chunk)?;
            flows.push(output.flow);
            noises.push(output.noise);
        }

        let (_, _, height, width) = patches.dim();
        if flows.is_empty() {
            let empty = Array4::zeros((0, 1, height, width));
            return Ok(SeparationOutput { flow: empty.clone(), noise: empty });
        }

        Ok(SeparationOutput {
            flow: concat_batches(&flows)?,
            noise: concat_batches(&noises)?,
        })
    }

    /// Patch-based inference over full images.
    ///
    /// The batch is tiled, each tile is separated, and both components are
    /// stitched back into the original geometry.
    pub fn forward_patched(&self, input: &Array4<f32>, config: &PatchConfig) -> Result<SeparationOutput> {
        Self::check_input(input)?;
        let (patches, locations) = extract_patches(input, config)?;
        let output = self.forward_chunked(&patches, config.patch_batch_size)?;

        Ok(SeparationOutput {
            flow: reconstruct_from_patches(&output.flow, &locations, input.dim(), config)?,
            noise: reconstruct_from_patches(&output.noise, &locations, input.dim(), config)?,
        })
    }

    /// Named read-only parameter views
    pub fn parameters(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        let mut params = self.conv1.params("conv1");
        params.extend(self.conv2.params("conv2"));
        if let Some(gate) = &self.gate {
            params.extend(gate.params("gate"));
        }
        params.extend(self.head.params("head"));
        params
    }

    /// Named mutable parameter views, in gradient order
    pub fn parameters_mut(&mut self) -> Vec<(String, ArrayViewMutD<'_, f32>)> {
        let mut params = self.conv1.params_mut("conv1");
        params.extend(self.conv2.params_mut("conv2"));
        if let Some(gate) = self.gate.as_mut() {
            params.extend(gate.params_mut("gate"));
        }
        params.extend(self.head.params_mut("head"));
        params
    }

    /// Total number of trainable scalars
    pub fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|(_, p)| p.len()).sum()
    }

    /// Copy of all parameters keyed by name
    pub fn state_dict(&self) -> StateDict {
        self.parameters()
            .into_iter()
            .map(|(name, view)| (name, view.to_owned()))
            .collect()
    }

    /// Load parameters saved by [`SeparationNet::state_dict`].
    ///
    /// Every parameter must be present with the same shape and no unknown
    /// names are accepted.
    pub fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let params = self.parameters();
        if params.len() != state.len() {
            return Err(SsmError::Checkpoint(format!(
                "state has {} tensors, model expects {}",
                state.len(),
                params.len()
            )));
        }

        // Nothing is assigned until every tensor has been checked
        for (name, param) in &params {
            let value = state
                .get(name.as_str())
                .ok_or_else(|| SsmError::Checkpoint(format!("missing parameter '{}'", name)))?;
            if value.shape() != param.shape() {
                return Err(SsmError::Checkpoint(format!(
                    "parameter '{}' has shape {:?}, expected {:?}",
                    name,
                    value.shape(),
                    param.shape()
                )));
            }
        }

        for (name, mut param) in self.parameters_mut() {
            if let Some(value) = state.get(name.as_str()) {
                param.assign(value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_input(shape: (usize, usize, usize, usize), seed: u64) -> Array4<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array4::from_shape_fn(shape, |_| rng.gen_range(0.0..1.0))
    }

    #[test]
    fn test_forward_shapes() {
        for arch in [Architecture::Simple, Architecture::Attention] {
            let model = SeparationNet::new(arch, 4, 0).unwrap();
            let out = model.forward(&random_input((2, 1, 9, 11), 1)).unwrap();
            assert_eq!(out.flow.dim(), (2, 1, 9, 11));
            assert_eq!(out.noise.dim(), (2, 1, 9, 11));
            assert!(out.flow.iter().all(|&v| (0.0..=1.0).contains(&v)));
        }
    }

    #[test]
    fn test_rejects_multichannel_input() {
        let model = SeparationNet::new(Architecture::Simple, 4, 0).unwrap();
        assert!(model.forward(&Array4::zeros((1, 3, 8, 8))).is_err());
        assert!(SeparationNet::new(Architecture::Simple, 0, 0).is_err());
    }

    #[test]
    fn test_gradient_count_matches_parameters() {
        for arch in [Architecture::Simple, Architecture::Attention] {
            let mut model = SeparationNet::new(arch, 3, 2).unwrap();
            let input = random_input((2, 1, 6, 6), 3);
            let (out, cache) = model.forward_train(&input).unwrap();
            let grads = model
                .backward(&cache, &Array4::ones(out.flow.raw_dim()), &Array4::ones(out.noise.raw_dim()))
                .unwrap();

            let params = model.parameters_mut();
            assert_eq!(grads.len(), params.len());
            for ((name, param), grad) in params.iter().zip(&grads) {
                assert_eq!(param.shape(), grad.shape(), "{}", name);
            }
        }
    }

    #[test]
    fn test_noise_bias_gradient() {
        // The noise head is linear, so d(sum(noise * r)) / d(head.bias[1]) = sum(r)
        let model = SeparationNet::new(Architecture::Attention, 3, 5).unwrap();
        let input = random_input((2, 1, 5, 5), 6);
        let (out, cache) = model.forward_train(&input).unwrap();
        let r = random_input(out.noise.dim(), 7);
        let grads = model
            .backward(&cache, &Array4::zeros(out.flow.raw_dim()), &r)
            .unwrap();
        let head_bias = grads.last().unwrap().as_slice().unwrap();
        assert!(head_bias[0].abs() < 1e-6);
        assert!((head_bias[1] - r.sum()).abs() < 1e-3);
    }

    #[test]
    fn test_state_dict_roundtrip() {
        let source = SeparationNet::new(Architecture::Attention, 4, 10).unwrap();
        let mut target = SeparationNet::new(Architecture::Attention, 4, 11).unwrap();
        assert_ne!(source.state_dict(), target.state_dict());

        target.load_state_dict(&source.state_dict()).unwrap();
        assert_eq!(source.state_dict(), target.state_dict());

        let input = random_input((1, 1, 8, 8), 12);
        let a = source.forward(&input).unwrap();
        let b = target.forward(&input).unwrap();
        assert_eq!(a.flow, b.flow);
    }

    #[test]
    fn test_load_state_dict_rejects_mismatch() {
        let simple = SeparationNet::new(Architecture::Simple, 4, 0).unwrap();
        let mut attention = SeparationNet::new(Architecture::Attention, 4, 0).unwrap();
        assert!(attention.load_state_dict(&simple.state_dict()).is_err());

        let wide = SeparationNet::new(Architecture::Simple, 8, 0).unwrap();
        let mut narrow = SeparationNet::new(Architecture::Simple, 4, 0).unwrap();
        assert!(narrow.load_state_dict(&wide.state_dict()).is_err());
    }

    #[test]
    fn test_failed_load_leaves_model_untouched() {
        let source = SeparationNet::new(Architecture::Simple, 4, 1).unwrap();
        let mut target = SeparationNet::new(Architecture::Simple, 4, 2).unwrap();
        let original = target.state_dict();

        // conv1 tensors sort first and are valid; the head bias is not
        let mut state = source.state_dict();
        state.insert("head.bias".to_string(), ArrayD::zeros(vec![3]));
        assert!(target.load_state_dict(&state).is_err());
        assert_eq!(target.state_dict(), original);
    }

    #[test]
    fn test_patched_forward_matches_shape() {
        let model = SeparationNet::new(Architecture::Simple, 2, 0).unwrap();
        let input = random_input((2, 1, 20, 13), 4);
        let config = PatchConfig { patch_size: 8, stride: 8, patch_batch_size: 3 };
        let out = model.forward_patched(&input, &config).unwrap();
        assert_eq!(out.flow.dim(), input.dim());
        assert_eq!(out.noise.dim(), input.dim());
    }
}
