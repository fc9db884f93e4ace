//! # mindcast-models
//!
//! Model components of the Mindcast pipeline: the per-subject ridge voxel
//! encoder, the multi-head backbone, the denoising diffusion prior, and the
//! frozen-collaborator tables (CLIP embeddings, VAE latents) consumed through
//! traits.

pub mod backbone;
pub mod embedder;
pub mod latents;
pub mod model;
pub mod prior;
pub mod ridge;
pub mod table;

pub use backbone::{BackboneOutput, BrainBackbone, BrainBackboneConfig};
pub use embedder::{CachedEmbeddings, ClipEmbedder};
pub use latents::{CachedLatents, LatentCodec};
pub use model::{MindcastModel, MindcastModelConfig};
pub use prior::{NoisePrior, NoisePriorConfig};
pub use ridge::{RidgeEncoder, RidgeEncoderConfig};
pub use table::EmbeddingTable;
