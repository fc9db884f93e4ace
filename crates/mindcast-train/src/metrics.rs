//! Epoch-scoped metric accumulation and logging.
//!
//! Running sums are reset at the start of each epoch and divided by the
//! iteration count at epoch end. The averaged record is printed and appended
//! to `metrics.jsonl` in the model's output directory.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// Running sums for one epoch of one branch (train or test).
#[derive(Debug, Clone, Default)]
pub struct EpochMetrics {
    pub loss_total: f64,
    pub loss_clip: f64,
    pub loss_prior: f64,
    pub loss_prior_txt: f64,
    pub loss_blurry: f64,
    pub fwd_pct_correct: f64,
    pub bwd_pct_correct: f64,
    pub recon_cossim: f64,
    pub recon_cossim_txt: f64,
    pub recon_mse: f64,
    pub recon_mse_txt: f64,
    pub blurry_pixcorr: f64,
    iterations: usize,
}

impl EpochMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one finished iteration.
    pub fn tick(&mut self) {
        self.iterations += 1;
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Averaged values with a branch prefix (`train/` or `test/`).
    pub fn averaged(&self, prefix: &str) -> BTreeMap<String, f64> {
        let n = self.iterations.max(1) as f64;
        let mut out = BTreeMap::new();
        let mut put = |name: &str, value: f64| {
            out.insert(format!("{prefix}/{name}"), value / n);
        };
        put("loss", self.loss_total);
        put("loss_clip", self.loss_clip);
        put("loss_prior", self.loss_prior);
        put("loss_prior_txt", self.loss_prior_txt);
        put("loss_blurry", self.loss_blurry);
        put("fwd_pct_correct", self.fwd_pct_correct);
        put("bwd_pct_correct", self.bwd_pct_correct);
        put("recon_cossim", self.recon_cossim);
        put("recon_cossim_txt", self.recon_cossim_txt);
        put("recon_mse", self.recon_mse);
        put("recon_mse_txt", self.recon_mse_txt);
        put("blurry_pixcorr", self.blurry_pixcorr);
        out
    }

    /// Mean total loss over the epoch.
    pub fn mean_loss(&self) -> f64 {
        self.loss_total / self.iterations.max(1) as f64
    }
}

/// One line of the JSONL metrics log.
#[derive(Debug, Serialize)]
pub struct EpochLog {
    pub epoch: usize,
    pub lr: f64,
    #[serde(flatten)]
    pub entries: BTreeMap<String, f64>,
}

/// Appends epoch records to `<model_dir>/metrics.jsonl`.
pub struct MetricsLogger {
    file: std::fs::File,
}

impl MetricsLogger {
    pub fn create(model_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(model_dir)
            .with_context(|| format!("failed to create {:?}", model_dir))?;
        let path = model_dir.join("metrics.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open metrics log {:?}", path))?;
        Ok(Self { file })
    }

    pub fn log(&mut self, record: &EpochLog) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialize epoch log")?;
        writeln!(self.file, "{line}").context("failed to append to metrics log")?;
        Ok(())
    }
}
