//! Backbone network mapping encoded voxels to embedding and latent spaces.
//!
//! A stack of residual MLP blocks over the flattened voxel sequence, with one
//! projection head per output space: the contrastive retrieval embedding, the
//! pooled CLIP image embedding, optionally the CLIP text embedding (dual
//! guidance), and optionally the blurry-reconstruction latent code.

use burn::nn::{Dropout, DropoutConfig, Gelu, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;

#[derive(Config, Debug)]
pub struct BrainBackboneConfig {
    pub hidden_dim: usize,
    pub seq_len: usize,
    pub retrieval_dim: usize,
    pub clip_dim: usize,
    /// CLIP text head width; `None` disables dual guidance outputs.
    pub text_dim: Option<usize>,
    /// Latent head width; `None` disables blurry reconstruction outputs.
    pub latent_dim: Option<usize>,
    #[config(default = 4)]
    pub n_blocks: usize,
    #[config(default = 0.15)]
    pub dropout: f64,
}

impl BrainBackboneConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> BrainBackbone<B> {
        let h = self.hidden_dim;
        BrainBackbone {
            input: LinearConfig::new(self.seq_len * h, h).init(device),
            blocks: (0..self.n_blocks)
                .map(|_| ResidualBlockConfig::new(h, self.dropout).init(device))
                .collect(),
            retrieval_head: LinearConfig::new(h, self.retrieval_dim).init(device),
            clip_head: LinearConfig::new(h, self.clip_dim).init(device),
            text_head: self
                .text_dim
                .map(|d| LinearConfig::new(h, d).init(device)),
            blur_head: self
                .latent_dim
                .map(|d| LinearConfig::new(h, d).init(device)),
        }
    }
}

#[derive(Config, Debug)]
struct ResidualBlockConfig {
    hidden_dim: usize,
    dropout: f64,
}

impl ResidualBlockConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> ResidualBlock<B> {
        ResidualBlock {
            norm: LayerNormConfig::new(self.hidden_dim).init(device),
            linear: LinearConfig::new(self.hidden_dim, self.hidden_dim).init(device),
            activation: Gelu::new(),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

#[derive(Module, Debug)]
struct ResidualBlock<B: Backend> {
    norm: LayerNorm<B>,
    linear: Linear<B>,
    activation: Gelu,
    dropout: Dropout,
}

impl<B: Backend> ResidualBlock<B> {
    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let h = self.norm.forward(x.clone());
        let h = self.activation.forward(self.linear.forward(h));
        x + self.dropout.forward(h)
    }
}

/// Per-space backbone outputs for one batch.
pub struct BackboneOutput<B: Backend> {
    /// Contrastive retrieval embedding.
    pub retrieval: Tensor<B, 2>,
    /// Pooled CLIP image embedding (prior conditioning / regression output).
    pub clip: Tensor<B, 2>,
    /// CLIP text embedding (dual guidance only).
    pub text: Option<Tensor<B, 2>>,
    /// Predicted latent code (blurry reconstruction only).
    pub blur: Option<Tensor<B, 2>>,
}

#[derive(Module, Debug)]
pub struct BrainBackbone<B: Backend> {
    input: Linear<B>,
    blocks: Vec<ResidualBlock<B>>,
    retrieval_head: Linear<B>,
    clip_head: Linear<B>,
    text_head: Option<Linear<B>>,
    blur_head: Option<Linear<B>>,
}

impl<B: Backend> BrainBackbone<B> {
    /// Map encoded voxels `[batch, seq, hidden]` to all output spaces.
    pub fn forward(&self, x: Tensor<B, 3>) -> BackboneOutput<B> {
        let [b, s, h] = x.dims();
        let mut hidden = self.input.forward(x.reshape([b, s * h]));
        for block in &self.blocks {
            hidden = block.forward(hidden);
        }

        BackboneOutput {
            retrieval: self.retrieval_head.forward(hidden.clone()),
            clip: self.clip_head.forward(hidden.clone()),
            text: self
                .text_head
                .as_ref()
                .map(|head| head.forward(hidden.clone())),
            blur: self.blur_head.as_ref().map(|head| head.forward(hidden)),
        }
    }

    pub fn has_text_head(&self) -> bool {
        self.text_head.is_some()
    }

    pub fn has_blur_head(&self) -> bool {
        self.blur_head.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindcast_core::NdBackend;

    #[test]
    fn test_forward_all_heads() {
        let device = Default::default();
        let backbone = BrainBackboneConfig::new(16, 2, 24, 12)
            .with_text_dim(Some(10))
            .with_latent_dim(Some(8))
            .with_n_blocks(2)
            .init::<NdBackend>(&device);

        let x = Tensor::<NdBackend, 3>::zeros([4, 2, 16], &device);
        let out = backbone.forward(x);
        assert_eq!(out.retrieval.dims(), [4, 24]);
        assert_eq!(out.clip.dims(), [4, 12]);
        assert_eq!(out.text.unwrap().dims(), [4, 10]);
        assert_eq!(out.blur.unwrap().dims(), [4, 8]);
    }

    #[test]
    fn test_optional_heads_disabled() {
        let device = Default::default();
        let backbone = BrainBackboneConfig::new(8, 1, 6, 4).init::<NdBackend>(&device);
        assert!(!backbone.has_text_head());
        assert!(!backbone.has_blur_head());

        let x = Tensor::<NdBackend, 3>::zeros([2, 1, 8], &device);
        let out = backbone.forward(x);
        assert!(out.text.is_none());
        assert!(out.blur.is_none());
    }
}
