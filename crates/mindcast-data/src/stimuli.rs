//! Stimulus archive and caption store.
//!
//! The image archive is a single safetensors file with an `images` tensor of
//! shape `[N, 3, H, W]` (f32, values in [0, 1]); the row index is the
//! stimulus id. Captions live in JSON arrays indexed the same way, one file
//! per caption variant.

use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use burn::prelude::*;
use mindcast_core::RngKey;
use rand::Rng;
use safetensors::SafeTensors;

/// In-memory image archive keyed by stimulus id.
pub struct StimulusArchive {
    data: Vec<f32>,
    n: usize,
    channels: usize,
    height: usize,
    width: usize,
}

impl StimulusArchive {
    /// Load the archive from a safetensors file holding an `images` tensor.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read image archive {:?}", path))?;
        let tensors = SafeTensors::deserialize(&bytes)
            .with_context(|| format!("failed to deserialize safetensors from {:?}", path))?;
        let view = tensors
            .tensor("images")
            .context("image archive missing 'images' tensor")?;
        ensure!(
            view.dtype() == safetensors::Dtype::F32,
            "image archive expects F32 images, got {:?}",
            view.dtype()
        );
        let shape = view.shape();
        ensure!(
            shape.len() == 4,
            "image archive expects [N, C, H, W], got shape {:?}",
            shape
        );
        let floats: &[f32] = bytemuck::cast_slice(view.data());
        Ok(Self {
            data: floats.to_vec(),
            n: shape[0],
            channels: shape[1],
            height: shape[2],
            width: shape[3],
        })
    }

    /// Build an archive from raw rows (test/support path).
    pub fn from_raw(data: Vec<f32>, n: usize, channels: usize, height: usize, width: usize) -> Self {
        assert_eq!(data.len(), n * channels * height * width);
        Self {
            data,
            n,
            channels,
            height,
            width,
        }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// (channels, height, width) of each stored image.
    pub fn image_dims(&self) -> (usize, usize, usize) {
        (self.channels, self.height, self.width)
    }

    /// Fetch a batch of images by stimulus id as a `[len, C, H, W]` tensor.
    pub fn fetch<B: Backend>(&self, ids: &[u64], device: &B::Device) -> Result<Tensor<B, 4>> {
        let row_len = self.channels * self.height * self.width;
        let mut out = Vec::with_capacity(ids.len() * row_len);
        for &id in ids {
            let idx = id as usize;
            ensure!(
                idx < self.n,
                "stimulus id {} outside archive of {} images",
                id,
                self.n
            );
            out.extend_from_slice(&self.data[idx * row_len..(idx + 1) * row_len]);
        }
        let flat = Tensor::<B, 1>::from_data(out.as_slice(), device);
        Ok(flat.reshape([ids.len(), self.channels, self.height, self.width]))
    }
}

/// Which caption set to train against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CaptionVariant {
    /// Original dataset annotations.
    Coco,
    /// Short generated captions.
    Short,
    /// Mid-length generated captions.
    #[default]
    Medium,
    /// Element-wise coin-flip mix of short and medium.
    Schmedium,
}

impl CaptionVariant {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "coco" => Some(Self::Coco),
            "short" => Some(Self::Short),
            "medium" => Some(Self::Medium),
            "schmedium" => Some(Self::Schmedium),
            _ => None,
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Self::Coco => "annots.json",
            Self::Short => "short_length_captions.json",
            Self::Medium => "mid_length_captions.json",
            Self::Schmedium => unreachable!("schmedium is a mix, not a file"),
        }
    }
}

impl std::fmt::Display for CaptionVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Coco => "coco",
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Schmedium => "schmedium",
        };
        write!(f, "{s}")
    }
}

/// Caption array keyed by stimulus id.
pub struct CaptionStore {
    captions: Vec<String>,
}

impl CaptionStore {
    /// Load the captions for a variant from `<data_path>/captions/`.
    ///
    /// `Schmedium` loads both the short and medium stores and mixes them
    /// element-wise with a fair coin derived from `key`.
    pub fn load(data_path: &Path, variant: CaptionVariant, key: RngKey) -> Result<Self> {
        let dir = data_path.join("captions");
        match variant {
            CaptionVariant::Schmedium => {
                let short = Self::load_file(&dir.join(CaptionVariant::Short.file_name()))?;
                let medium = Self::load_file(&dir.join(CaptionVariant::Medium.file_name()))?;
                ensure!(
                    short.len() == medium.len(),
                    "short ({}) and medium ({}) caption stores differ in length",
                    short.len(),
                    medium.len()
                );
                let mut rng = key.to_rng();
                let captions = short
                    .into_iter()
                    .zip(medium)
                    .map(|(s, m)| if rng.gen::<f32>() > 0.5 { s } else { m })
                    .collect();
                Ok(Self { captions })
            }
            variant => {
                let captions = Self::load_file(&dir.join(variant.file_name()))?;
                Ok(Self { captions })
            }
        }
    }

    pub fn from_vec(captions: Vec<String>) -> Self {
        Self { captions }
    }

    fn load_file(path: &Path) -> Result<Vec<String>> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read caption store {:?}", path))?;
        let captions: Vec<String> = serde_json::from_str(&contents)
            .with_context(|| format!("caption store {:?} is not a JSON string array", path))?;
        Ok(captions)
    }

    pub fn len(&self) -> usize {
        self.captions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captions.is_empty()
    }

    /// Fetch captions by stimulus id.
    pub fn fetch(&self, ids: &[u64]) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            let idx = id as usize;
            if idx >= self.captions.len() {
                bail!(
                    "stimulus id {} outside caption store of {} entries",
                    id,
                    self.captions.len()
                );
            }
            out.push(self.captions[idx].clone());
        }
        Ok(out)
    }
}
