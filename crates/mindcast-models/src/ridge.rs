//! Ridge-style voxel encoder.
//!
//! Each subject has a different voxel count, so the encoder keeps one linear
//! map per subject, all projecting into the shared hidden width. Weight decay
//! on the optimizer supplies the ridge penalty.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

#[derive(Config, Debug)]
pub struct RidgeEncoderConfig {
    /// Voxel count per subject, in subject-list order.
    pub input_sizes: Vec<usize>,
    pub out_features: usize,
}

impl RidgeEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> RidgeEncoder<B> {
        RidgeEncoder {
            linears: self
                .input_sizes
                .iter()
                .map(|&input| LinearConfig::new(input, self.out_features).init(device))
                .collect(),
            out_features: self.out_features,
        }
    }
}

#[derive(Module, Debug)]
pub struct RidgeEncoder<B: Backend> {
    linears: Vec<Linear<B>>,
    out_features: usize,
}

impl<B: Backend> RidgeEncoder<B> {
    /// Project one subject's voxel sequences `[batch, seq, voxels]` into the
    /// shared space `[batch, seq, out_features]`.
    pub fn forward(&self, voxels: Tensor<B, 3>, subject_idx: usize) -> Tensor<B, 3> {
        self.linears[subject_idx].forward(voxels)
    }

    pub fn num_subjects(&self) -> usize {
        self.linears.len()
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}
