//! Latent codec for blurry reconstructions.
//!
//! The VAE-like latent encoder/decoder is a frozen external model. Encoding
//! is consumed as a precomputed latent table keyed by stimulus id; decoding
//! (needed only for the pixel-correlation metric) goes through a linear
//! decode matrix shipped alongside the table.

use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use burn::prelude::*;
use safetensors::SafeTensors;

use crate::table::EmbeddingTable;

/// Latent codes for stimulus images plus an optional pixel decoder.
pub trait LatentCodec<B: Backend>: Send {
    /// True latent codes for a batch of stimulus ids.
    fn encode(&self, ids: &[u64], device: &B::Device) -> Result<Tensor<B, 2>>;

    /// Decode predicted latents into blurry images `[n, c, h, w]`.
    fn decode(&self, latents: Tensor<B, 2>) -> Result<Tensor<B, 4>>;

    fn latent_dim(&self) -> usize;

    /// Whether [`Self::decode`] is available.
    fn can_decode(&self) -> bool;
}

struct LinearDecoder {
    matrix: Vec<f32>,
    channels: usize,
    height: usize,
    width: usize,
}

/// Latent table (and optional decoder) loaded from
/// `<cache_dir>/latents.safetensors`.
pub struct CachedLatents {
    table: EmbeddingTable,
    decoder: Option<LinearDecoder>,
}

impl CachedLatents {
    pub fn load(cache_dir: &Path) -> Result<Self> {
        let path = cache_dir.join("latents.safetensors");
        let bytes = std::fs::read(&path)
            .with_context(|| format!("failed to read latent tables {:?}", path))?;
        let tensors = SafeTensors::deserialize(&bytes)
            .with_context(|| format!("failed to deserialize safetensors from {:?}", path))?;

        let table = EmbeddingTable::from_safetensors(&tensors, "latents", &path)?;

        let decoder = match tensors.tensor("decode") {
            Ok(view) => {
                ensure!(
                    view.dtype() == safetensors::Dtype::F32,
                    "decode matrix in {:?}: expected F32, got {:?}",
                    path,
                    view.dtype()
                );
                let shape = view.shape();
                ensure!(
                    shape.len() == 4 && shape[0] == table.dim(),
                    "decode matrix in {:?}: expected [latent_dim, c, h, w], got {:?}",
                    path,
                    shape
                );
                let floats: &[f32] = bytemuck::cast_slice(view.data());
                Some(LinearDecoder {
                    matrix: floats.to_vec(),
                    channels: shape[1],
                    height: shape[2],
                    width: shape[3],
                })
            }
            Err(_) => None,
        };

        Ok(Self { table, decoder })
    }

    pub fn from_table(table: EmbeddingTable) -> Self {
        Self {
            table,
            decoder: None,
        }
    }

    /// Backend-independent accessor (the trait's version resolves per-backend).
    pub fn latent_dim(&self) -> usize {
        self.table.dim()
    }

    /// Attach a linear decode matrix `[latent_dim, c*h*w]` (row-major).
    pub fn with_decoder(
        mut self,
        matrix: Vec<f32>,
        channels: usize,
        height: usize,
        width: usize,
    ) -> Self {
        assert_eq!(matrix.len(), self.table.dim() * channels * height * width);
        self.decoder = Some(LinearDecoder {
            matrix,
            channels,
            height,
            width,
        });
        self
    }
}

impl<B: Backend> LatentCodec<B> for CachedLatents {
    fn encode(&self, ids: &[u64], device: &B::Device) -> Result<Tensor<B, 2>> {
        self.table.fetch(ids, device)
    }

    fn decode(&self, latents: Tensor<B, 2>) -> Result<Tensor<B, 4>> {
        let Some(decoder) = &self.decoder else {
            bail!("latent codec has no decode matrix; pixel decoding unavailable");
        };
        let [n, d] = latents.dims();
        ensure!(
            d == self.table.dim(),
            "latents have dim {}, codec expects {}",
            d,
            self.table.dim()
        );
        let device = latents.device();
        let pix = decoder.channels * decoder.height * decoder.width;
        let matrix =
            Tensor::<B, 1>::from_data(decoder.matrix.as_slice(), &device).reshape([d, pix]);
        let flat = latents.matmul(matrix);
        Ok(flat.reshape([n, decoder.channels, decoder.height, decoder.width]))
    }

    fn latent_dim(&self) -> usize {
        self.table.dim()
    }

    fn can_decode(&self) -> bool {
        self.decoder.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindcast_core::NdBackend;

    #[test]
    fn test_decode_through_linear_matrix() {
        // 2-dim latents, 1x1x2 images, decode = identity
        let table = EmbeddingTable::from_raw(vec![1.0, 2.0, 3.0, 4.0], 2, 2);
        let codec = CachedLatents::from_table(table).with_decoder(
            vec![1.0, 0.0, 0.0, 1.0],
            1,
            1,
            2,
        );
        let device = Default::default();

        let latents = LatentCodec::<NdBackend>::encode(&codec, &[1], &device).unwrap();
        let images = LatentCodec::<NdBackend>::decode(&codec, latents).unwrap();
        assert_eq!(images.dims(), [1, 1, 1, 2]);
        let vals: Vec<f32> = images.into_data().to_vec().unwrap();
        assert_eq!(vals, vec![3.0, 4.0]);
    }

    #[test]
    fn test_decode_without_matrix_fails() {
        let codec = CachedLatents::from_table(EmbeddingTable::from_raw(vec![0.0; 4], 2, 2));
        assert!(!LatentCodec::<NdBackend>::can_decode(&codec));
        let device = Default::default();
        let latents = LatentCodec::<NdBackend>::encode(&codec, &[0], &device).unwrap();
        assert!(LatentCodec::<NdBackend>::decode(&codec, latents).is_err());
    }
}
