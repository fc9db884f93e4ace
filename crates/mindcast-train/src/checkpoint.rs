//! Checkpoint persistence.
//!
//! A checkpoint is a directory `<model_dir>/<tag>/` holding one burn record
//! per model part (`ridge`, `backbone`, `prior`, `prior_txt`), the optimizer
//! record, and `state.json` with the epoch counter, scheduler position, and
//! metric histories. The `last` tag is overwritten on the checkpoint
//! interval; `best` is written whenever the held-out loss improves.
//!
//! Fine-tuning from a multi-subject pretraining run loads every part except
//! the per-subject ridge weights, whose shapes belong to other subjects.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use mindcast_models::MindcastModel;
use serde::{Deserialize, Serialize};

pub const TAG_LAST: &str = "last";
pub const TAG_BEST: &str = "best";

/// Resumable (non-tensor) training state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Next epoch to run.
    pub epoch: usize,
    /// Optimizer steps taken (learning-rate scheduler position).
    pub scheduler_step: usize,
    /// Per-iteration training losses, across the whole run.
    pub train_losses: Vec<f64>,
    /// Per-epoch held-out losses.
    pub test_losses: Vec<f64>,
    /// Per-iteration learning rates.
    pub lrs: Vec<f64>,
    pub best_test_loss: f64,
}

impl Default for TrainerState {
    fn default() -> Self {
        Self {
            epoch: 0,
            scheduler_step: 0,
            train_losses: Vec::new(),
            test_losses: Vec::new(),
            lrs: Vec::new(),
            best_test_loss: 1e9,
        }
    }
}

fn tag_dir(model_dir: &Path, tag: &str) -> PathBuf {
    model_dir.join(tag)
}

/// Write a full checkpoint under `<model_dir>/<tag>/`.
pub fn save_checkpoint<B, O>(
    model_dir: &Path,
    tag: &str,
    model: &MindcastModel<B>,
    optim: &O,
    state: &TrainerState,
) -> Result<()>
where
    B: AutodiffBackend,
    O: Optimizer<MindcastModel<B>, B>,
{
    let dir = tag_dir(model_dir, tag);
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {:?}", dir))?;
    let recorder = CompactRecorder::new();

    model
        .ridge
        .clone()
        .save_file(dir.join("ridge"), &recorder)
        .context("failed to save ridge record")?;
    model
        .backbone
        .clone()
        .save_file(dir.join("backbone"), &recorder)
        .context("failed to save backbone record")?;
    if let Some(prior) = &model.prior {
        prior
            .clone()
            .save_file(dir.join("prior"), &recorder)
            .context("failed to save prior record")?;
    }
    if let Some(prior_text) = &model.prior_text {
        prior_text
            .clone()
            .save_file(dir.join("prior_txt"), &recorder)
            .context("failed to save text prior record")?;
    }
    recorder
        .record(optim.to_record(), dir.join("optimizer"))
        .context("failed to save optimizer record")?;

    write_state(&dir, state)?;
    println!("---saved {:?} ckpt---", dir);
    Ok(())
}

/// Load the `<tag>` checkpoint into `model`/`optim`, returning its state.
///
/// Missing checkpoints are a fatal error on an explicit resume: this loader
/// does not silently start over.
pub fn load_checkpoint<B, O>(
    model_dir: &Path,
    tag: &str,
    device: &B::Device,
    model: &mut MindcastModel<B>,
    optim: &mut O,
) -> Result<TrainerState>
where
    B: AutodiffBackend,
    O: Optimizer<MindcastModel<B>, B> + Clone,
{
    let dir = tag_dir(model_dir, tag);
    println!("---loading {:?} ckpt---", dir);
    let recorder = CompactRecorder::new();

    model.ridge = model
        .ridge
        .clone()
        .load_file(dir.join("ridge"), &recorder, device)
        .context("failed to load ridge record")?;
    load_shared_parts(&dir, device, model, &recorder)?;

    let record = recorder
        .load(dir.join("optimizer"), device)
        .context("failed to load optimizer record")?;
    *optim = optim.clone().load_record(record);

    read_state(&dir)
}

/// Load a multi-subject pretraining checkpoint for single-subject
/// fine-tuning: backbone and priors only, fresh ridge/optimizer/state.
pub fn load_pretrained<B: AutodiffBackend>(
    ckpt_dir: &Path,
    tag: &str,
    device: &B::Device,
    model: &mut MindcastModel<B>,
) -> Result<()> {
    let dir = tag_dir(ckpt_dir, tag);
    println!("---loading pretrained {:?} (ridge excluded)---", dir);
    let recorder = CompactRecorder::new();
    load_shared_parts(&dir, device, model, &recorder)
}

fn load_shared_parts<B: AutodiffBackend>(
    dir: &Path,
    device: &B::Device,
    model: &mut MindcastModel<B>,
    recorder: &CompactRecorder,
) -> Result<()> {
    model.backbone = model
        .backbone
        .clone()
        .load_file(dir.join("backbone"), recorder, device)
        .context("failed to load backbone record")?;

    if let Some(prior) = model.prior.take() {
        model.prior = Some(
            prior
                .load_file(dir.join("prior"), recorder, device)
                .context("failed to load prior record")?,
        );
    }
    if let Some(prior_text) = model.prior_text.take() {
        model.prior_text = Some(
            prior_text
                .load_file(dir.join("prior_txt"), recorder, device)
                .context("failed to load text prior record")?,
        );
    }
    Ok(())
}

fn write_state(dir: &Path, state: &TrainerState) -> Result<()> {
    let json = serde_json::to_string_pretty(state).context("failed to serialize state")?;
    std::fs::write(dir.join("state.json"), json)
        .with_context(|| format!("failed to write state.json in {:?}", dir))?;
    Ok(())
}

fn read_state(dir: &Path) -> Result<TrainerState> {
    let path = dir.join("state.json");
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read checkpoint state {:?}", path))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse checkpoint state {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip_is_exact() {
        let dir = std::env::temp_dir().join(format!("mindcast-ckpt-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let state = TrainerState {
            epoch: 17,
            scheduler_step: 1581,
            train_losses: vec![2.25, 1.125, 0.75],
            test_losses: vec![1.5],
            lrs: vec![2.9296875e-4, 1.220703125e-4],
            best_test_loss: 1.5,
        };
        write_state(&dir, &state).unwrap();
        let restored = read_state(&dir).unwrap();

        assert_eq!(restored, state);
        assert_eq!(restored.epoch, 17);
        assert_eq!(restored.scheduler_step, 1581);
        assert_eq!(restored.lrs, state.lrs);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_state_is_error() {
        let dir = std::env::temp_dir().join("mindcast-ckpt-none");
        assert!(read_state(&dir).is_err());
    }
}
