//! End-to-end loop test on synthetic data: two subjects, two epochs (one in
//! the mixup phase, one past it), regression + contrastive + blurry losses,
//! checkpointing, and resume.

use burn::optim::AdamWConfig;
use mindcast_core::{init_device, RngKey, TrainBackend};
use mindcast_data::{
    BehavioralEvent, CaptionStore, CaptionVariant, ContextWindow, InMemoryEventStream,
    StimulusArchive, SubjectRecord,
};
use mindcast_models::{
    BrainBackboneConfig, CachedEmbeddings, CachedLatents, EmbeddingTable, LatentCodec,
    MindcastModel, MindcastModelConfig, RidgeEncoderConfig,
};
use mindcast_train::checkpoint::TAG_LAST;
use mindcast_train::metrics::MetricsLogger;
use mindcast_train::{
    load_checkpoint, LrSchedulerType, Rank, TrainInputs, TrainPlan, Trainer, TrainerState,
};
use ndarray::Array2;

const N_STIMULI: usize = 8;
const CLIP_DIM: usize = 5;
const RETRIEVAL_DIM: usize = 6;
const LATENT_DIM: usize = 4;
const HIDDEN_DIM: usize = 8;

fn event(stimulus_id: u64, voxel_row: usize) -> BehavioralEvent {
    BehavioralEvent {
        stimulus_id,
        voxel_row,
        shared: false,
        past: ContextWindow::default(),
        future: ContextWindow::default(),
    }
}

fn subject(id: u32, n_voxels: usize, batch_size: usize) -> SubjectRecord {
    let voxels = Array2::from_shape_fn((N_STIMULI, n_voxels), |(r, c)| {
        0.1 * (r as f32 + 1.0) - 0.05 * c as f32
    });
    let events: Vec<_> = (0..N_STIMULI).map(|i| event(i as u64, i)).collect();
    SubjectRecord::new(
        id,
        voxels,
        Box::new(InMemoryEventStream::new(
            events,
            batch_size,
            RngKey::new(id as u64),
        )),
    )
}

fn ramp_table(dim: usize) -> EmbeddingTable {
    let data: Vec<f32> = (0..N_STIMULI * dim)
        .map(|i| 0.05 * (i as f32 + 1.0) * if i % 2 == 0 { 1.0 } else { -1.0 })
        .collect();
    EmbeddingTable::from_raw(data, N_STIMULI, dim)
}

fn plan(model_name: &str, num_epochs: usize) -> TrainPlan {
    TrainPlan {
        model_name: model_name.to_string(),
        subj_list: vec![1, 2],
        eval_subj: 1,
        per_subject_batch: 4,
        iterations_per_epoch: 2,
        num_epochs,
        num_sessions: 1,
        num_test: 6,
        seq_past: 0,
        seq_future: 0,
        mixup_pct: 0.5,
        clip_scale: 1.0,
        prior_scale: 30.0,
        blur_scale: 0.5,
        use_prior: false,
        dual_guidance: false,
        blurry_recon: true,
        lr_scheduler_type: LrSchedulerType::Cycle,
        max_lr: 1e-3,
        weight_decay: 1e-2,
        ckpt_saving: true,
        ckpt_interval: 1,
        resume_from_ckpt: false,
        hidden_dim: HIDDEN_DIM,
        n_blocks: 1,
        caption_type: CaptionVariant::Medium,
        seed: 42,
    }
}

fn inputs(batch_size: usize) -> TrainInputs<TrainBackend> {
    // held-out split: stimulus 0 x3, 1 x2, 2 x1 -> 3 averaged triplets
    let test_events = vec![
        event(0, 0),
        event(0, 1),
        event(0, 2),
        event(1, 3),
        event(1, 4),
        event(2, 5),
    ];

    let codec = CachedLatents::from_table(ramp_table(LATENT_DIM)).with_decoder(
        (0..LATENT_DIM * 4).map(|i| 0.1 * i as f32).collect(),
        1,
        2,
        2,
    );
    let archive_data: Vec<f32> = (0..N_STIMULI * 4).map(|i| (i % 7) as f32 * 0.1).collect();

    TrainInputs {
        subjects: vec![subject(1, 6, batch_size), subject(2, 9, batch_size)],
        test_events,
        captions: CaptionStore::from_vec(
            (0..N_STIMULI).map(|i| format!("stimulus {i}")).collect(),
        ),
        embedder: Box::new(CachedEmbeddings::from_tables(
            ramp_table(CLIP_DIM),
            ramp_table(RETRIEVAL_DIM),
            ramp_table(3),
        )),
        codec: Some(Box::new(codec) as Box<dyn LatentCodec<TrainBackend>>),
        archive: Some(StimulusArchive::from_raw(archive_data, N_STIMULI, 1, 2, 2)),
    }
}

fn model(device: &<TrainBackend as burn::prelude::Backend>::Device) -> MindcastModel<TrainBackend> {
    MindcastModelConfig::new(
        RidgeEncoderConfig::new(vec![6, 9], HIDDEN_DIM),
        BrainBackboneConfig::new(HIDDEN_DIM, 1, RETRIEVAL_DIM, CLIP_DIM)
            .with_latent_dim(Some(LATENT_DIM))
            .with_n_blocks(1),
    )
    .init(device)
}

#[test]
fn two_epoch_run_trains_checkpoints_and_resumes() {
    let device = init_device();
    let model_dir = std::env::temp_dir().join(format!("mindcast-e2e-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&model_dir);
    std::fs::create_dir_all(&model_dir).unwrap();

    let plan = plan("e2e", 2);
    let mut inputs = inputs(plan.per_subject_batch);
    let optim = AdamWConfig::new()
        .with_weight_decay(1e-2)
        .init::<TrainBackend, MindcastModel<TrainBackend>>();
    let mut logger = MetricsLogger::create(&model_dir).unwrap();

    let mut trainer: Trainer<TrainBackend> =
        Trainer::new(plan.clone(), Rank::single(), device.clone(), &model_dir);
    let (_, state) = trainer
        .run(
            model(&device),
            optim,
            &mut inputs,
            TrainerState::default(),
            &mut logger,
        )
        .unwrap();

    // 2 epochs x 2 iterations, every loss finite
    assert_eq!(state.epoch, 2);
    assert_eq!(state.train_losses.len(), 4);
    assert!(state.train_losses.iter().all(|l| l.is_finite()));
    assert_eq!(state.lrs.len(), 4);
    assert_eq!(state.scheduler_step, 4);

    // one held-out evaluation per epoch
    assert_eq!(state.test_losses.len(), 2);
    assert!(state.test_losses.iter().all(|l| l.is_finite()));
    assert!(state.best_test_loss < 1e9);

    // checkpoints and metric log on disk
    assert!(model_dir.join("last/state.json").exists());
    assert!(model_dir.join("best/state.json").exists());
    let log = std::fs::read_to_string(model_dir.join("metrics.jsonl")).unwrap();
    assert_eq!(log.lines().count(), 2);

    // resume restores epoch, learning-rate history, and scheduler position
    let mut restored_model = model(&device);
    let mut restored_optim = AdamWConfig::new()
        .with_weight_decay(1e-2)
        .init::<TrainBackend, MindcastModel<TrainBackend>>();
    let restored = load_checkpoint(
        &model_dir,
        TAG_LAST,
        &device,
        &mut restored_model,
        &mut restored_optim,
    )
    .unwrap();
    assert_eq!(restored.epoch, state.epoch);
    assert_eq!(restored.scheduler_step, state.scheduler_step);
    assert_eq!(restored.lrs, state.lrs);
    assert_eq!(restored.train_losses, state.train_losses);

    std::fs::remove_dir_all(&model_dir).ok();
}

#[test]
#[should_panic(expected = "held-out batch")]
fn wrong_held_out_length_panics() {
    let device = init_device();
    let model_dir = std::env::temp_dir().join(format!("mindcast-badtest-{}", std::process::id()));
    std::fs::create_dir_all(&model_dir).unwrap();

    let plan = plan("badtest", 1);
    let mut inputs = inputs(plan.per_subject_batch);
    inputs.test_events.pop(); // 5 events against num_test = 6

    let optim = AdamWConfig::new().init::<TrainBackend, MindcastModel<TrainBackend>>();
    let mut logger = MetricsLogger::create(&model_dir).unwrap();
    let mut trainer: Trainer<TrainBackend> =
        Trainer::new(plan, Rank::single(), device.clone(), &model_dir);

    let _ = trainer.run(
        model(&device),
        optim,
        &mut inputs,
        TrainerState::default(),
        &mut logger,
    );
}
