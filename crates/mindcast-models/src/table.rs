//! Row-lookup tables for precomputed embeddings and latents.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use burn::prelude::*;
use safetensors::SafeTensors;

/// A dense `[N, dim]` f32 table addressed by stimulus id.
#[derive(Clone)]
pub struct EmbeddingTable {
    data: Vec<f32>,
    n: usize,
    dim: usize,
}

impl EmbeddingTable {
    pub fn from_raw(data: Vec<f32>, n: usize, dim: usize) -> Self {
        assert_eq!(data.len(), n * dim);
        Self { data, n, dim }
    }

    /// Read one named tensor out of an already-deserialized safetensors file.
    pub fn from_safetensors(tensors: &SafeTensors, name: &str, path: &Path) -> Result<Self> {
        let view = tensors
            .tensor(name)
            .with_context(|| format!("{:?} missing '{}' tensor", path, name))?;
        ensure!(
            view.dtype() == safetensors::Dtype::F32,
            "tensor '{}' in {:?}: expected F32, got {:?}",
            name,
            path,
            view.dtype()
        );
        let shape = view.shape();
        ensure!(
            shape.len() == 2,
            "tensor '{}' in {:?}: expected [N, dim], got shape {:?}",
            name,
            path,
            shape
        );
        let floats: &[f32] = bytemuck::cast_slice(view.data());
        Ok(Self::from_raw(floats.to_vec(), shape[0], shape[1]))
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Gather rows by stimulus id into a `[ids.len(), dim]` tensor.
    pub fn fetch<B: Backend>(&self, ids: &[u64], device: &B::Device) -> Result<Tensor<B, 2>> {
        let mut out = Vec::with_capacity(ids.len() * self.dim);
        for &id in ids {
            let idx = id as usize;
            ensure!(
                idx < self.n,
                "stimulus id {} outside table of {} rows",
                id,
                self.n
            );
            out.extend_from_slice(&self.data[idx * self.dim..(idx + 1) * self.dim]);
        }
        let t = Tensor::<B, 1>::from_data(out.as_slice(), device);
        Ok(t.reshape([ids.len(), self.dim]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindcast_core::NdBackend;

    #[test]
    fn test_fetch_rows() {
        let table = EmbeddingTable::from_raw(vec![0.0, 0.1, 1.0, 1.1, 2.0, 2.1], 3, 2);
        let device = Default::default();
        let t = table.fetch::<NdBackend>(&[2, 0], &device).unwrap();
        let vals: Vec<f32> = t.into_data().to_vec().unwrap();
        assert_eq!(vals, vec![2.0, 2.1, 0.0, 0.1]);
    }

    #[test]
    fn test_fetch_out_of_range() {
        let table = EmbeddingTable::from_raw(vec![0.0; 4], 2, 2);
        let device = Default::default();
        assert!(table.fetch::<NdBackend>(&[2], &device).is_err());
    }
}
