//! Top-level trainable model: ridge encoder, backbone, and optional priors.

use burn::prelude::*;

use crate::backbone::{BackboneOutput, BrainBackbone, BrainBackboneConfig};
use crate::prior::{NoisePrior, NoisePriorConfig};
use crate::ridge::{RidgeEncoder, RidgeEncoderConfig};

#[derive(Config, Debug)]
pub struct MindcastModelConfig {
    pub ridge: RidgeEncoderConfig,
    pub backbone: BrainBackboneConfig,
    /// Diffusion prior over the CLIP image embedding.
    pub prior: Option<NoisePriorConfig>,
    /// Diffusion prior over the CLIP text embedding (dual guidance).
    pub prior_text: Option<NoisePriorConfig>,
}

impl MindcastModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MindcastModel<B> {
        MindcastModel {
            ridge: self.ridge.init(device),
            backbone: self.backbone.init(device),
            prior: self.prior.as_ref().map(|c| c.init(device)),
            prior_text: self.prior_text.as_ref().map(|c| c.init(device)),
        }
    }
}

#[derive(Module, Debug)]
pub struct MindcastModel<B: Backend> {
    pub ridge: RidgeEncoder<B>,
    pub backbone: BrainBackbone<B>,
    pub prior: Option<NoisePrior<B>>,
    pub prior_text: Option<NoisePrior<B>>,
}

impl<B: Backend> MindcastModel<B> {
    /// Encode per-subject voxel batches and run the backbone over the
    /// concatenated result. `voxels` pairs each tensor with its index into
    /// the subject list the ridge encoder was built with.
    pub fn forward(&self, voxels: Vec<(usize, Tensor<B, 3>)>) -> BackboneOutput<B> {
        let encoded: Vec<Tensor<B, 3>> = voxels
            .into_iter()
            .map(|(subject_idx, v)| self.ridge.forward(v, subject_idx))
            .collect();
        let merged = Tensor::cat(encoded, 0);
        self.backbone.forward(merged)
    }

    pub fn has_prior(&self) -> bool {
        self.prior.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindcast_core::NdBackend;

    #[test]
    fn test_forward_concatenates_subjects() {
        let device = Default::default();
        let config = MindcastModelConfig::new(
            RidgeEncoderConfig::new(vec![5, 7], 8),
            BrainBackboneConfig::new(8, 1, 6, 4).with_n_blocks(1),
        );
        let model = config.init::<NdBackend>(&device);
        assert!(!model.has_prior());

        let a = Tensor::<NdBackend, 3>::zeros([2, 1, 5], &device);
        let b = Tensor::<NdBackend, 3>::zeros([3, 1, 7], &device);
        let out = model.forward(vec![(0, a), (1, b)]);
        assert_eq!(out.retrieval.dims(), [5, 6]);
        assert_eq!(out.clip.dims(), [5, 4]);
    }
}
