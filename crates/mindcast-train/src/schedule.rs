//! Temperature and learning-rate schedules.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Fixed temperature of the mixup-phase contrastive loss.
pub const MIXCO_TEMP: f32 = 0.006;
/// Fixed temperature of the evaluation contrastive loss.
pub const EVAL_CLIP_TEMP: f32 = 0.006;
/// Soft contrastive temperature at the start of the post-mixup phase.
pub const SOFT_TEMP_START: f32 = 0.004;
/// Soft contrastive temperature at the end of training.
pub const SOFT_TEMP_END: f32 = 0.0075;

/// Cosine anneal from `start` to `end` over `steps` values (inclusive ends).
pub fn cosine_anneal(start: f32, end: f32, steps: usize) -> Vec<f32> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..steps)
            .map(|i| {
                let theta = std::f32::consts::PI * i as f32 / (steps - 1) as f32;
                end + (start - end) / 2.0 * (1.0 + theta.cos())
            })
            .collect(),
    }
}

/// Per-epoch contrastive temperature schedule.
///
/// During the first `floor(mixup_pct * num_epochs)` epochs the contrastive
/// loss is the mixup-aware NCE at [`MIXCO_TEMP`]; afterwards the soft
/// contrastive loss anneals from [`SOFT_TEMP_START`] to [`SOFT_TEMP_END`].
#[derive(Debug, Clone)]
pub struct SoftClipTempSchedule {
    mixup_epochs: usize,
    temps: Vec<f32>,
}

impl SoftClipTempSchedule {
    pub fn new(mixup_pct: f64, num_epochs: usize) -> Self {
        let mixup_epochs = (mixup_pct * num_epochs as f64).floor() as usize;
        let temps = cosine_anneal(SOFT_TEMP_START, SOFT_TEMP_END, num_epochs - mixup_epochs)
            .into_iter()
            // the anneal endpoints can land an ulp outside the bounds
            .map(|t| t.clamp(SOFT_TEMP_START, SOFT_TEMP_END))
            .collect();
        Self {
            mixup_epochs,
            temps,
        }
    }

    pub fn mixup_epochs(&self) -> usize {
        self.mixup_epochs
    }

    pub fn mixup_active(&self, epoch: usize) -> bool {
        epoch < self.mixup_epochs
    }

    /// Soft contrastive temperature for a post-mixup epoch; `None` while the
    /// mixup phase is still running.
    pub fn temperature(&self, epoch: usize) -> Option<f32> {
        if self.mixup_active(epoch) {
            None
        } else {
            self.temps.get(epoch - self.mixup_epochs).copied()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum LrSchedulerType {
    /// One-cycle: short warmup to `max_lr`, cosine anneal down to
    /// `max_lr / 25000`.
    Cycle,
    /// Linear ramp from `max_lr / 3` to `max_lr` over the full run.
    Linear,
}

const CYCLE_DIV_FACTOR: f64 = 25.0;
const CYCLE_FINAL_DIV_FACTOR: f64 = 1000.0;
const LINEAR_START_FACTOR: f64 = 1.0 / 3.0;

/// Stateful per-iteration learning-rate schedule.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    kind: LrSchedulerType,
    max_lr: f64,
    total_steps: usize,
    /// Warmup fraction for the one-cycle schedule.
    pct_start: f64,
    step: usize,
}

impl LrSchedule {
    pub fn new(kind: LrSchedulerType, max_lr: f64, total_steps: usize, num_epochs: usize) -> Self {
        Self {
            kind,
            max_lr,
            total_steps: total_steps.max(1),
            pct_start: (2.0 / num_epochs.max(1) as f64).min(1.0),
            step: 0,
        }
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.step)
    }

    /// Advance one optimizer step.
    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Restore the scheduler position (checkpoint resume).
    pub fn set_step(&mut self, step: usize) {
        self.step = step;
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        let frac = (step as f64 / self.total_steps as f64).clamp(0.0, 1.0);
        match self.kind {
            LrSchedulerType::Linear => {
                self.max_lr * (LINEAR_START_FACTOR + (1.0 - LINEAR_START_FACTOR) * frac)
            }
            LrSchedulerType::Cycle => {
                let initial = self.max_lr / CYCLE_DIV_FACTOR;
                let final_lr = initial / CYCLE_FINAL_DIV_FACTOR;
                if frac < self.pct_start {
                    let p = frac / self.pct_start;
                    initial
                        + (self.max_lr - initial) * (1.0 - (std::f64::consts::PI * p).cos()) / 2.0
                } else {
                    let p = (frac - self.pct_start) / (1.0 - self.pct_start);
                    final_lr
                        + (self.max_lr - final_lr) * (1.0 + (std::f64::consts::PI * p).cos()) / 2.0
                }
            }
        }
    }
}
