//! Training configuration: the CLI surface and the resolved plan.
//!
//! `TrainArgs` is the raw flag set; [`TrainPlan::resolve`] turns it into the
//! derived quantities the loop needs (subject list, per-subject batch size,
//! iterations per epoch, held-out sample count) and rejects inconsistent
//! combinations up front.

use anyhow::{ensure, Result};
use clap::Parser;
use mindcast_core::PathArgs;
use mindcast_data::CaptionVariant;

use crate::schedule::LrSchedulerType;

/// Samples recorded per scanning session.
pub const SESSION_SAMPLES: usize = 750;
/// Sessions available per subject when pretraining across subjects.
pub const MULTI_SUBJECT_SESSIONS: usize = 40;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Train the Mindcast brain-decoding model")]
pub struct TrainArgs {
    /// Model name, used for checkpoint directories and log files
    #[arg(long, default_value = "testing", env = "MINDCAST_MODEL_NAME")]
    pub model_name: String,

    #[command(flatten)]
    pub paths: PathArgs,

    /// Subject to validate on (1..=8)
    #[arg(long, default_value_t = 1)]
    pub subj: u32,

    /// Pretrain across all subjects except `--subj`
    #[arg(long)]
    pub multi_subject: bool,

    /// Checkpoint directory of a multi-subject pretraining run to fine-tune
    /// from (loads everything except the per-subject ridge weights)
    #[arg(long)]
    pub multisubject_ckpt: Option<std::path::PathBuf>,

    /// Number of training sessions to include
    #[arg(long, default_value_t = 1)]
    pub num_sessions: usize,

    /// Global batch size, split across subjects
    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,

    /// Data-parallel replica count managed by an external launcher
    #[arg(long, default_value_t = 1, env = "MINDCAST_NUM_DEVICES")]
    pub num_devices: usize,

    /// Train the diffusion prior instead of direct embedding regression
    #[arg(long)]
    pub use_prior: bool,

    /// Also decode captions (text embedding head + text prior)
    #[arg(long)]
    pub dual_guidance: bool,

    /// Disable blurry latent reconstruction
    #[arg(long)]
    pub no_blurry_recon: bool,

    /// Proportion of training spent in the mixup phase before switching to
    /// the soft contrastive loss
    #[arg(long, default_value_t = 0.33)]
    pub mixup_pct: f64,

    /// Contrastive loss weight
    #[arg(long, default_value_t = 1.0)]
    pub clip_scale: f32,

    /// Diffusion prior loss weight
    #[arg(long, default_value_t = 30.0)]
    pub prior_scale: f32,

    /// Blurry reconstruction loss weight
    #[arg(long, default_value_t = 0.5)]
    pub blur_scale: f32,

    /// Past presentations to include as sequence context
    #[arg(long, default_value_t = 0)]
    pub seq_past: usize,

    /// Future presentations to include as sequence context
    #[arg(long, default_value_t = 0)]
    pub seq_future: usize,

    #[arg(long, default_value_t = 150)]
    pub num_epochs: usize,

    /// Hidden width of the shared voxel space
    #[arg(long, default_value_t = 1024)]
    pub hidden_dim: usize,

    /// Residual blocks in the backbone
    #[arg(long, default_value_t = 4)]
    pub n_blocks: usize,

    #[arg(long, value_enum, default_value = "cycle")]
    pub lr_scheduler_type: LrSchedulerType,

    #[arg(long, default_value_t = 3e-4)]
    pub max_lr: f64,

    #[arg(long, default_value_t = 1e-2)]
    pub weight_decay: f64,

    /// Disable checkpoint writes
    #[arg(long)]
    pub no_ckpt_saving: bool,

    /// Save a backup checkpoint every N epochs
    #[arg(long, default_value_t = 5)]
    pub ckpt_interval: usize,

    /// Resume from the `last` checkpoint of this model
    #[arg(long)]
    pub resume_from_ckpt: bool,

    /// Use the pre-release (smaller) held-out split
    #[arg(long)]
    pub old_test: bool,

    /// Caption variant to train text guidance against
    #[arg(long, default_value = "medium", value_parser = parse_caption_variant)]
    pub caption_type: CaptionVariant,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

fn parse_caption_variant(s: &str) -> Result<CaptionVariant, String> {
    CaptionVariant::parse(s).ok_or_else(|| format!("unknown caption variant '{s}'"))
}

/// Derived training plan.
#[derive(Debug, Clone)]
pub struct TrainPlan {
    pub model_name: String,
    /// Subjects trained on, in ridge-encoder order.
    pub subj_list: Vec<u32>,
    /// Subject evaluated on (always index 0 of `subj_list` for ridge lookup).
    pub eval_subj: u32,
    pub per_subject_batch: usize,
    pub iterations_per_epoch: usize,
    pub num_epochs: usize,
    pub num_sessions: usize,
    pub num_test: usize,
    pub seq_past: usize,
    pub seq_future: usize,
    pub mixup_pct: f64,
    pub clip_scale: f32,
    pub prior_scale: f32,
    pub blur_scale: f32,
    pub use_prior: bool,
    pub dual_guidance: bool,
    pub blurry_recon: bool,
    pub lr_scheduler_type: LrSchedulerType,
    pub max_lr: f64,
    pub weight_decay: f64,
    pub ckpt_saving: bool,
    pub ckpt_interval: usize,
    pub resume_from_ckpt: bool,
    pub hidden_dim: usize,
    pub n_blocks: usize,
    pub caption_type: CaptionVariant,
    pub seed: u64,
}

impl TrainPlan {
    pub fn resolve(args: &TrainArgs) -> Result<Self> {
        ensure!(
            (1..=8).contains(&args.subj),
            "--subj must be in 1..=8, got {}",
            args.subj
        );
        ensure!(args.num_devices >= 1, "--num-devices must be at least 1");
        ensure!(
            (0.0..=1.0).contains(&args.mixup_pct),
            "--mixup-pct must be in [0, 1], got {}",
            args.mixup_pct
        );
        ensure!(args.ckpt_interval >= 1, "--ckpt-interval must be at least 1");

        let subj_list: Vec<u32> = if args.multi_subject {
            (1..=8).filter(|&s| s != args.subj).collect()
        } else {
            vec![args.subj]
        };

        let sessions = if args.multi_subject {
            MULTI_SUBJECT_SESSIONS
        } else {
            args.num_sessions
        };
        let samples_per_epoch = SESSION_SAMPLES * sessions / args.num_devices;

        let per_subject_batch = args.batch_size / subj_list.len();
        ensure!(
            per_subject_batch >= 1,
            "global batch size {} is smaller than the subject count {}",
            args.batch_size,
            subj_list.len()
        );

        let iterations_per_epoch =
            samples_per_epoch / (per_subject_batch * subj_list.len());
        ensure!(
            iterations_per_epoch >= 1,
            "configuration yields zero iterations per epoch \
             (samples_per_epoch={samples_per_epoch}, batch={per_subject_batch})"
        );

        // multi-subject runs cannot validate on the held-out person
        let eval_subj = subj_list[0];
        let num_test = held_out_count(eval_subj, !args.old_test);

        Ok(Self {
            model_name: args.model_name.clone(),
            subj_list,
            eval_subj,
            per_subject_batch,
            iterations_per_epoch,
            num_epochs: args.num_epochs,
            num_sessions: args.num_sessions,
            num_test,
            seq_past: args.seq_past,
            seq_future: args.seq_future,
            mixup_pct: args.mixup_pct,
            clip_scale: args.clip_scale,
            prior_scale: args.prior_scale,
            blur_scale: args.blur_scale,
            use_prior: args.use_prior,
            dual_guidance: args.dual_guidance,
            blurry_recon: !args.no_blurry_recon,
            lr_scheduler_type: args.lr_scheduler_type,
            max_lr: args.max_lr,
            weight_decay: args.weight_decay,
            ckpt_saving: !args.no_ckpt_saving,
            ckpt_interval: args.ckpt_interval,
            resume_from_ckpt: args.resume_from_ckpt,
            hidden_dim: args.hidden_dim,
            n_blocks: args.n_blocks,
            caption_type: args.caption_type,
            seed: args.seed,
        })
    }

    pub fn seq_len(&self) -> usize {
        self.seq_past + 1 + self.seq_future
    }

    /// Last epoch index (exclusive) of the mixup phase.
    pub fn mixup_epochs(&self) -> usize {
        (self.mixup_pct * self.num_epochs as f64).floor() as usize
    }

    pub fn total_steps(&self) -> usize {
        self.num_epochs * self.iterations_per_epoch
    }

    /// Sessions each subject's stream reads.
    pub fn sessions_per_subject(&self) -> usize {
        if self.subj_list.len() > 1 {
            MULTI_SUBJECT_SESSIONS
        } else {
            self.num_sessions
        }
    }
}

/// Held-out sample count per validation subject.
fn held_out_count(subj: u32, new_test: bool) -> usize {
    if new_test {
        match subj {
            3 | 6 => 2371,
            4 | 8 => 2188,
            _ => 3000,
        }
    } else {
        match subj {
            3 | 6 => 2113,
            4 | 8 => 1985,
            _ => 2770,
        }
    }
}
