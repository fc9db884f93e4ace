//! CLIP-space embedding provider.
//!
//! The pretrained vision-language embedder is a frozen external model; this
//! pipeline consumes it through precomputed tables keyed by stimulus id. One
//! safetensors file carries the image embedding, the hidden-state retrieval
//! embedding, and one text embedding table per caption variant.

use std::path::Path;

use anyhow::{Context, Result};
use burn::prelude::*;
use safetensors::SafeTensors;

use crate::table::EmbeddingTable;

/// Target embeddings for images and captions, keyed by stimulus id.
pub trait ClipEmbedder<B: Backend>: Send {
    /// Pooled image embedding (diffusion-prior / regression target).
    fn embed_image(&self, ids: &[u64], device: &B::Device) -> Result<Tensor<B, 2>>;

    /// Hidden-state image embedding (contrastive retrieval target).
    fn embed_image_hidden(&self, ids: &[u64], device: &B::Device) -> Result<Tensor<B, 2>>;

    /// Caption embedding for the configured caption variant.
    fn embed_text(&self, ids: &[u64], device: &B::Device) -> Result<Tensor<B, 2>>;

    fn image_dim(&self) -> usize;
    fn hidden_dim(&self) -> usize;
    fn text_dim(&self) -> usize;
}

/// Embedding tables loaded from `<cache_dir>/clip_embeddings.safetensors`.
pub struct CachedEmbeddings {
    image: EmbeddingTable,
    hidden: EmbeddingTable,
    text: EmbeddingTable,
}

impl CachedEmbeddings {
    /// Load tables. `text_variant` picks the caption table, e.g. `medium`
    /// loads the `clip_text_medium` tensor.
    pub fn load(cache_dir: &Path, text_variant: &str) -> Result<Self> {
        let path = cache_dir.join("clip_embeddings.safetensors");
        let bytes = std::fs::read(&path)
            .with_context(|| format!("failed to read embedding tables {:?}", path))?;
        let tensors = SafeTensors::deserialize(&bytes)
            .with_context(|| format!("failed to deserialize safetensors from {:?}", path))?;

        Ok(Self {
            image: EmbeddingTable::from_safetensors(&tensors, "clip_image", &path)?,
            hidden: EmbeddingTable::from_safetensors(&tensors, "clip_hidden", &path)?,
            text: EmbeddingTable::from_safetensors(
                &tensors,
                &format!("clip_text_{text_variant}"),
                &path,
            )?,
        })
    }

    pub fn from_tables(
        image: EmbeddingTable,
        hidden: EmbeddingTable,
        text: EmbeddingTable,
    ) -> Self {
        Self {
            image,
            hidden,
            text,
        }
    }

    // backend-independent dimension accessors (the trait's versions resolve
    // per-backend)
    pub fn image_dim(&self) -> usize {
        self.image.dim()
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden.dim()
    }

    pub fn text_dim(&self) -> usize {
        self.text.dim()
    }
}

impl<B: Backend> ClipEmbedder<B> for CachedEmbeddings {
    fn embed_image(&self, ids: &[u64], device: &B::Device) -> Result<Tensor<B, 2>> {
        self.image.fetch(ids, device)
    }

    fn embed_image_hidden(&self, ids: &[u64], device: &B::Device) -> Result<Tensor<B, 2>> {
        self.hidden.fetch(ids, device)
    }

    fn embed_text(&self, ids: &[u64], device: &B::Device) -> Result<Tensor<B, 2>> {
        self.text.fetch(ids, device)
    }

    fn image_dim(&self) -> usize {
        self.image.dim()
    }

    fn hidden_dim(&self) -> usize {
        self.hidden.dim()
    }

    fn text_dim(&self) -> usize {
        self.text.dim()
    }
}
