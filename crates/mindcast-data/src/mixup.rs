//! Mixup augmentation for contrastive voxel training.
//!
//! During the mixup phase each batch draws a permutation, Beta-distributed
//! interpolation coefficients, and a select mask, then blends selected voxel
//! rows with their permuted partners. The same auxiliary state is consumed
//! later by the contrastive loss (soft labels) and the blurry-reconstruction
//! loss (target interpolation), so it is generated exactly once per batch and
//! carried alongside the mixed voxels.

use burn::prelude::*;
use mindcast_core::RngKey;
use rand::Rng;
use rand_distr::{Beta, Distribution as _};

const MIXUP_BETA: f32 = 0.15;
const MIXUP_SELECT_THRESH: f32 = 0.5;

/// Auxiliary state of one mixup draw.
///
/// `betas` holds the effective interpolation coefficient per row: the Beta
/// draw for selected rows and exactly 1.0 for unselected ones, so downstream
/// consumers can apply `x * beta + x[perm] * (1 - beta)` uniformly.
#[derive(Debug, Clone, PartialEq)]
pub struct MixupState {
    pub perm: Vec<usize>,
    pub betas: Vec<f32>,
    pub select: Vec<bool>,
}

impl MixupState {
    pub fn len(&self) -> usize {
        self.perm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.perm.is_empty()
    }

    /// Concatenate per-subject states into one state over the concatenated
    /// batch. Each subject's permutation indexes its own rows only, so the
    /// permutations are re-based onto the subject's slot offset.
    pub fn concat_with_offsets(parts: &[&MixupState]) -> MixupState {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let mut perm = Vec::with_capacity(total);
        let mut betas = Vec::with_capacity(total);
        let mut select = Vec::with_capacity(total);

        let mut offset = 0usize;
        for part in parts {
            perm.extend(part.perm.iter().map(|&p| p + offset));
            betas.extend_from_slice(&part.betas);
            select.extend_from_slice(&part.select);
            offset += part.len();
        }
        MixupState {
            perm,
            betas,
            select,
        }
    }

    /// Permutation as an index tensor.
    pub fn perm_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1, Int> {
        let perm: Vec<i64> = self.perm.iter().map(|&p| p as i64).collect();
        Tensor::from_data(TensorData::new(perm, [self.len()]), device)
    }

    /// Effective betas as a `[n, 1]` column tensor for broadcasting.
    pub fn betas_column<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        Tensor::<B, 1>::from_data(self.betas.as_slice(), device).reshape([self.len(), 1])
    }
}

/// Mix a voxel batch `[n, seq, voxels]`, returning the mixed tensor and the
/// auxiliary state.
pub fn mixco<B: Backend>(
    voxels: Tensor<B, 3>,
    key: RngKey,
    device: &B::Device,
) -> (Tensor<B, 3>, MixupState) {
    let [n, _, _] = voxels.dims();
    let mut rng = key.to_rng();

    let mut perm: Vec<usize> = (0..n).collect();
    for i in (1..n).rev() {
        let j = rng.gen_range(0..=i);
        perm.swap(i, j);
    }

    let beta_dist = Beta::new(MIXUP_BETA as f64, MIXUP_BETA as f64)
        .expect("Beta(0.15, 0.15) parameters are valid");
    let mut betas = Vec::with_capacity(n);
    let mut select = Vec::with_capacity(n);
    for _ in 0..n {
        let selected = rng.gen::<f32>() <= MIXUP_SELECT_THRESH;
        select.push(selected);
        betas.push(if selected {
            beta_dist.sample(&mut rng) as f32
        } else {
            1.0
        });
    }

    let state = MixupState {
        perm,
        betas,
        select,
    };

    let shuffled = voxels.clone().select(0, state.perm_tensor(device));
    let betas_t: Tensor<B, 3> =
        Tensor::<B, 1>::from_data(state.betas.as_slice(), device).reshape([n, 1, 1]);
    let mixed = voxels * betas_t.clone() + shuffled * (betas_t.neg() + 1.0);

    (mixed, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindcast_core::NdBackend;

    #[test]
    fn test_mixco_shapes_and_beta_convention() {
        let device = Default::default();
        let n = 16;
        let voxels: Vec<f32> = (0..n * 2 * 3).map(|v| v as f32).collect();
        let t = Tensor::<NdBackend, 1>::from_data(voxels.as_slice(), &device).reshape([n, 2, 3]);

        let (mixed, state) = mixco(t, RngKey::new(3), &device);
        assert_eq!(mixed.dims(), [n, 2, 3]);
        assert_eq!(state.len(), n);

        for (i, &selected) in state.select.iter().enumerate() {
            if selected {
                assert!((0.0..=1.0).contains(&state.betas[i]));
            } else {
                assert_eq!(state.betas[i], 1.0, "unselected rows keep beta = 1");
            }
        }
    }

    #[test]
    fn test_mixco_unselected_rows_unchanged() {
        let device = Default::default();
        let n = 32;
        let voxels: Vec<f32> = (0..n * 4).map(|v| v as f32).collect();
        let t =
            Tensor::<NdBackend, 1>::from_data(voxels.as_slice(), &device).reshape([n, 1, 4]);

        let (mixed, state) = mixco(t.clone(), RngKey::new(11), &device);
        let orig: Vec<f32> = t.into_data().to_vec().unwrap();
        let out: Vec<f32> = mixed.into_data().to_vec().unwrap();

        for (i, &selected) in state.select.iter().enumerate() {
            if !selected {
                assert_eq!(&orig[i * 4..(i + 1) * 4], &out[i * 4..(i + 1) * 4]);
            }
        }
    }

    #[test]
    fn test_mixco_deterministic_in_key() {
        let device = Default::default();
        let voxels: Vec<f32> = (0..8 * 2).map(|v| v as f32).collect();
        let t =
            Tensor::<NdBackend, 1>::from_data(voxels.as_slice(), &device).reshape([8, 1, 2]);

        let (_, state_a) = mixco(t.clone(), RngKey::new(5), &device);
        let (_, state_b) = mixco(t, RngKey::new(5), &device);
        assert_eq!(state_a, state_b);
    }

    #[test]
    fn test_concat_with_offsets() {
        let a = MixupState {
            perm: vec![1, 0],
            betas: vec![0.3, 1.0],
            select: vec![true, false],
        };
        let b = MixupState {
            perm: vec![2, 0, 1],
            betas: vec![1.0, 0.7, 0.2],
            select: vec![false, true, true],
        };
        let merged = MixupState::concat_with_offsets(&[&a, &b]);
        assert_eq!(merged.perm, vec![1, 0, 4, 2, 3]);
        assert_eq!(merged.betas, vec![0.3, 1.0, 1.0, 0.7, 0.2]);
        assert_eq!(merged.select, vec![true, false, false, true, true]);
    }
}
