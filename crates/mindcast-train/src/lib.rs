//! # mindcast-train
//!
//! Training orchestration for the Mindcast brain-decoding pipeline: the CLI
//! configuration and its resolved plan, loss aggregation, temperature and
//! learning-rate schedules, epoch metrics, checkpointing, held-out
//! evaluation, and the epoch loop driver.

pub mod checkpoint;
pub mod config;
pub mod evaluation;
pub mod losses;
pub mod metrics;
pub mod schedule;
pub mod trainer;

pub use checkpoint::{load_checkpoint, load_pretrained, save_checkpoint, TrainerState};
pub use config::{TrainArgs, TrainPlan};
pub use evaluation::{build_test_set, group_repeats, TestSet};
pub use schedule::{cosine_anneal, LrSchedule, LrSchedulerType, SoftClipTempSchedule};
pub use trainer::{Rank, TrainInputs, Trainer};
