//! Training entry point.
//!
//! Wires the resolved configuration to the data plumbing and the loop
//! driver: loads the caption store and embedding/latent tables, builds one
//! [`SubjectRecord`] per training subject, restores checkpoints when asked,
//! and hands everything to [`Trainer::run`]. Exits non-zero on any fatal
//! error, including a non-finite training loss.

use anyhow::{Context, Result};
use burn::optim::AdamWConfig;
use clap::Parser;
use mindcast_core::{init_device, PathConfig, RngKey, TrainBackend};
use mindcast_data::{
    load_event_shard, CaptionStore, ShardedEventStream, StimulusArchive, SubjectRecord,
};
use mindcast_models::{
    BrainBackboneConfig, CachedEmbeddings, CachedLatents, LatentCodec, MindcastModel,
    MindcastModelConfig, NoisePriorConfig, RidgeEncoderConfig,
};
use mindcast_train::checkpoint::TAG_LAST;
use mindcast_train::metrics::MetricsLogger;
use mindcast_train::{
    load_checkpoint, load_pretrained, Rank, TrainArgs, TrainInputs, TrainPlan, Trainer,
    TrainerState,
};

fn main() -> Result<()> {
    let args = TrainArgs::parse();
    let paths = PathConfig::from_path_args(args.paths.clone());
    let plan = TrainPlan::resolve(&args)?;

    let rank = Rank {
        index: std::env::var("RANK")
            .ok()
            .and_then(|r| r.parse().ok())
            .unwrap_or(0),
        world_size: args.num_devices,
    };
    println!(
        "pid={} rank={}/{} subjects={:?} batch={}x{} iterations/epoch={}",
        std::process::id(),
        rank.index,
        rank.world_size,
        plan.subj_list,
        plan.per_subject_batch,
        plan.subj_list.len(),
        plan.iterations_per_epoch,
    );
    paths.print_summary();

    let device = init_device();
    let key = RngKey::new(plan.seed);

    // data and frozen-collaborator tables
    let captions = CaptionStore::load(paths.data_path(), plan.caption_type, key.fold_in(1))?;
    let embedder = CachedEmbeddings::load(paths.cache_dir(), &plan.caption_type.to_string())?;
    let codec = if plan.blurry_recon {
        Some(CachedLatents::load(paths.cache_dir())?)
    } else {
        None
    };
    let archive = if plan.blurry_recon {
        Some(StimulusArchive::load(
            &paths.data_path().join("images.safetensors"),
        )?)
    } else {
        None
    };

    let mut subjects = Vec::with_capacity(plan.subj_list.len());
    for (i, &subj) in plan.subj_list.iter().enumerate() {
        let stream = ShardedEventStream::discover(
            paths.data_path(),
            subj,
            plan.sessions_per_subject(),
            plan.per_subject_batch,
            key.fold_in(100 + i as u64),
        )?;
        let record = SubjectRecord::from_npy(subj, paths.data_path(), Box::new(stream))?;
        println!("subj{:02}: {} voxels", subj, record.num_voxels());
        subjects.push(record);
    }

    let test_events = load_event_shard(
        &paths
            .data_path()
            .join(format!("behav/subj{:02}/test.behav.npy", plan.eval_subj)),
    )
    .context("failed to load held-out events")?;

    // model dimensions follow the loaded tables
    let clip_dim = embedder.image_dim();
    let retrieval_dim = embedder.hidden_dim();
    let text_dim = embedder.text_dim();
    let latent_dim = codec.as_ref().map(|c| c.latent_dim());

    let mut model_config = MindcastModelConfig::new(
        RidgeEncoderConfig::new(
            subjects.iter().map(|s| s.num_voxels()).collect(),
            plan.hidden_dim,
        ),
        BrainBackboneConfig::new(plan.hidden_dim, plan.seq_len(), retrieval_dim, clip_dim)
            .with_text_dim(plan.dual_guidance.then_some(text_dim))
            .with_latent_dim(latent_dim)
            .with_n_blocks(plan.n_blocks),
    );
    if plan.use_prior {
        model_config = model_config.with_prior(Some(NoisePriorConfig::new(clip_dim, clip_dim)));
        if plan.dual_guidance {
            model_config =
                model_config.with_prior_text(Some(NoisePriorConfig::new(text_dim, text_dim)));
        }
    }

    let mut model = model_config.init::<TrainBackend>(&device);
    let mut optim = AdamWConfig::new()
        .with_weight_decay(plan.weight_decay as f32)
        .init::<TrainBackend, MindcastModel<TrainBackend>>();

    let model_dir = paths.model_dir(&plan.model_name);
    std::fs::create_dir_all(&model_dir)
        .with_context(|| format!("failed to create {:?}", model_dir))?;

    let mut state = TrainerState::default();
    if let Some(ckpt) = &args.multisubject_ckpt {
        if !plan.resume_from_ckpt {
            load_pretrained(ckpt, TAG_LAST, &device, &mut model)?;
        }
    }
    if plan.resume_from_ckpt {
        state = load_checkpoint(&model_dir, TAG_LAST, &device, &mut model, &mut optim)?;
        println!("resumed at epoch {}", state.epoch);
    }

    let mut inputs = TrainInputs {
        subjects,
        test_events,
        captions,
        embedder: Box::new(embedder),
        codec: codec.map(|c| Box::new(c) as Box<dyn LatentCodec<TrainBackend>>),
        archive,
    };

    let mut logger = MetricsLogger::create(&model_dir)?;
    let mut trainer = Trainer::new(plan, rank, device, &model_dir);
    trainer.run(model, optim, &mut inputs, state, &mut logger)?;
    Ok(())
}
