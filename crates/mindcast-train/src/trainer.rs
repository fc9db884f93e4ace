//! Training/evaluation loop driver.
//!
//! Epoch state machine: assemble the epoch's batches, run forward/backward
//! over every iteration, evaluate the held-out set on the main process,
//! write checkpoints, hit the synchronization barrier, and move on. The loop
//! terminates when the configured epoch count is reached; a non-finite total
//! loss terminates it immediately.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use mindcast_core::metrics::{
    batchwise_cosine_similarity, l2_normalize_rows, mean_cosine_similarity, pixcorr,
    topk_accuracy,
};
use mindcast_core::RngKey;
use mindcast_data::{
    AssemblerConfig, BehavioralEvent, CaptionStore, EpochAssembler, EpochBatches,
    StimulusArchive, SubjectRecord,
};
use mindcast_models::{ClipEmbedder, LatentCodec, MindcastModel};

use crate::checkpoint::{save_checkpoint, TrainerState, TAG_BEST, TAG_LAST};
use crate::config::TrainPlan;
use crate::evaluation::{build_test_set, TestSet};
use crate::losses::{check_finite, l1_loss, mixco_nce, mixup_targets, soft_clip_loss};
use crate::metrics::{EpochLog, EpochMetrics, MetricsLogger};
use crate::schedule::{LrSchedule, SoftClipTempSchedule, EVAL_CLIP_TEMP, MIXCO_TEMP};

/// Position of this process in a data-parallel launch.
///
/// Replication itself belongs to an external launcher; the loop only needs
/// to know whether it is the main process (evaluation, logging, checkpoints)
/// and where the end-of-epoch barrier sits.
#[derive(Clone, Copy, Debug)]
pub struct Rank {
    pub index: usize,
    pub world_size: usize,
}

impl Rank {
    pub fn single() -> Self {
        Self {
            index: 0,
            world_size: 1,
        }
    }

    pub fn is_main_process(&self) -> bool {
        self.index == 0
    }

    /// End-of-epoch synchronization hook. A no-op in a single-process run.
    pub fn barrier(&self) {}
}

/// Everything the loop consumes besides the model and optimizer.
pub struct TrainInputs<B: Backend> {
    pub subjects: Vec<SubjectRecord>,
    /// Raw held-out events; must hold the entire split.
    pub test_events: Vec<BehavioralEvent>,
    pub captions: CaptionStore,
    pub embedder: Box<dyn ClipEmbedder<B>>,
    /// Latent codec; required when blurry reconstruction is on.
    pub codec: Option<Box<dyn LatentCodec<B>>>,
    /// Image archive, used for the pixel-correlation metric.
    pub archive: Option<StimulusArchive>,
}

pub struct Trainer<B: AutodiffBackend> {
    plan: TrainPlan,
    rank: Rank,
    device: B::Device,
    assembler: EpochAssembler,
    temp_schedule: SoftClipTempSchedule,
    lr_schedule: LrSchedule,
    model_dir: PathBuf,
    test_set: Option<TestSet<B>>,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(plan: TrainPlan, rank: Rank, device: B::Device, model_dir: &Path) -> Self {
        let assembler = EpochAssembler::new(AssemblerConfig {
            batch_size: plan.per_subject_batch,
            iterations_per_epoch: plan.iterations_per_epoch,
            seq_past: plan.seq_past,
            seq_future: plan.seq_future,
        });
        let temp_schedule = SoftClipTempSchedule::new(plan.mixup_pct, plan.num_epochs);
        let lr_schedule = LrSchedule::new(
            plan.lr_scheduler_type,
            plan.max_lr,
            plan.total_steps(),
            plan.num_epochs,
        );
        Self {
            plan,
            rank,
            device,
            assembler,
            temp_schedule,
            lr_schedule,
            model_dir: model_dir.to_path_buf(),
            test_set: None,
        }
    }

    /// Run the remaining epochs, returning the trained model and final state.
    pub fn run<O>(
        &mut self,
        mut model: MindcastModel<B>,
        mut optim: O,
        inputs: &mut TrainInputs<B>,
        mut state: TrainerState,
        logger: &mut MetricsLogger,
    ) -> Result<(MindcastModel<B>, TrainerState)>
    where
        O: Optimizer<MindcastModel<B>, B>,
    {
        let key = RngKey::new(self.plan.seed);
        self.lr_schedule.set_step(state.scheduler_step);
        println!(
            "{} starting with epoch {} / {}",
            self.plan.model_name, state.epoch, self.plan.num_epochs
        );

        for epoch in state.epoch..self.plan.num_epochs {
            let epoch_key = key.fold_in(epoch as u64 + 1);
            let mixup_active = self.temp_schedule.mixup_active(epoch);

            // pre-load every iteration's batch for this epoch
            let batches = self.assembler.assemble::<B>(
                &mut inputs.subjects,
                mixup_active,
                epoch_key,
                &self.device,
            )?;

            let mut train_metrics = EpochMetrics::new();
            for it in 0..batches.iterations() {
                model = self.train_iteration(
                    model,
                    &mut optim,
                    inputs,
                    &batches,
                    epoch,
                    it,
                    epoch_key.fold_in(1 + it as u64),
                    &mut train_metrics,
                    &mut state,
                )?;
            }

            if self.rank.is_main_process() {
                let test_metrics =
                    self.evaluate(&model, inputs, epoch_key.fold_in(u64::MAX))?;
                let mean_test_loss = test_metrics.mean_loss();
                state.test_losses.push(mean_test_loss);
                state.epoch = epoch + 1;

                let lr = state.lrs.last().copied().unwrap_or(self.plan.max_lr);
                println!(
                    "epoch {:3}: train_loss={:.4} test_loss={:.4} lr={:.3e} fwd={:.3} bwd={:.3}",
                    epoch,
                    train_metrics.mean_loss(),
                    mean_test_loss,
                    lr,
                    train_metrics.averaged("train")["train/fwd_pct_correct"],
                    train_metrics.averaged("train")["train/bwd_pct_correct"],
                );

                let mut entries = train_metrics.averaged("train");
                entries.extend(test_metrics.averaged("test"));
                entries.insert("train/num_steps".into(), state.train_losses.len() as f64);
                entries.insert("test/num_steps".into(), state.test_losses.len() as f64);
                logger.log(&EpochLog { epoch, lr, entries })?;

                if self.plan.ckpt_saving && epoch % self.plan.ckpt_interval == 0 {
                    save_checkpoint(&self.model_dir, TAG_LAST, &model, &optim, &state)?;
                }
                if self.plan.ckpt_saving && state.best_test_loss > mean_test_loss {
                    state.best_test_loss = mean_test_loss;
                    save_checkpoint(&self.model_dir, TAG_BEST, &model, &optim, &state)?;
                }
            } else {
                state.epoch = epoch + 1;
            }

            // other ranks must not race into the next epoch
            self.rank.barrier();
            drop(batches);
        }

        println!("===Finished!===");
        if self.plan.ckpt_saving && self.rank.is_main_process() {
            save_checkpoint(&self.model_dir, TAG_LAST, &model, &optim, &state)?;
        }
        Ok((model, state))
    }

    #[allow(clippy::too_many_arguments)]
    fn train_iteration<O>(
        &mut self,
        model: MindcastModel<B>,
        optim: &mut O,
        inputs: &TrainInputs<B>,
        batches: &EpochBatches<B>,
        epoch: usize,
        it: usize,
        key: RngKey,
        metrics: &mut EpochMetrics,
        state: &mut TrainerState,
    ) -> Result<MindcastModel<B>>
    where
        O: Optimizer<MindcastModel<B>, B>,
    {
        let device = self.device.clone();
        let plan = &self.plan;

        let ids = batches.concat_stimulus_ids(it);
        let captions = inputs.captions.fetch(&ids)?;
        assert_eq!(
            ids.len(),
            captions.len(),
            "stimulus ids and captions disagree in count"
        );

        let clip_target = inputs.embedder.embed_image(&ids, &device)?;
        let clip_hidden = inputs.embedder.embed_image_hidden(&ids, &device)?;
        let clip_text = if plan.dual_guidance {
            Some(inputs.embedder.embed_text(&ids, &device)?)
        } else {
            None
        };

        let voxel_inputs: Vec<(usize, Tensor<B, 3>)> = (0..batches.num_subjects())
            .map(|s| (s, batches.subject_batch(s, it).voxels.clone()))
            .collect();
        let out = model.forward(voxel_inputs);
        assert_eq!(
            out.retrieval.dims()[0],
            ids.len(),
            "backbone batch rows and stimulus ids disagree"
        );

        let mixup = batches.concat_mixup(it);
        let mut loss: Tensor<B, 1> = Tensor::zeros([1], &device);

        // (b)/(c): diffusion prior terms, or direct embedding regression
        if let Some(prior) = &model.prior {
            let (loss_prior, prior_out) =
                prior.loss(out.clip.clone(), clip_target.clone(), key.fold_in(11));
            metrics.loss_prior += scalar(&loss_prior) as f64;
            loss = loss + loss_prior * plan.prior_scale;
            metrics.recon_cossim +=
                mean_cosine_similarity(prior_out.clone(), clip_target.clone()) as f64;
            metrics.recon_mse += scalar(&MseLoss::new().forward(
                prior_out,
                clip_target.clone(),
                Reduction::Mean,
            )) as f64;

            if let (Some(prior_text), Some(text_out), Some(text_target)) =
                (&model.prior_text, &out.text, &clip_text)
            {
                let (loss_prior_txt, prior_out_txt) =
                    prior_text.loss(text_out.clone(), text_target.clone(), key.fold_in(12));
                metrics.loss_prior_txt += scalar(&loss_prior_txt) as f64;
                loss = loss + loss_prior_txt * plan.prior_scale;
                metrics.recon_cossim_txt +=
                    mean_cosine_similarity(prior_out_txt, text_target.clone()) as f64;
            }
        } else {
            let loss_mse =
                MseLoss::new().forward(out.clip.clone(), clip_target.clone(), Reduction::Mean);
            metrics.recon_mse += scalar(&loss_mse) as f64;
            metrics.recon_cossim +=
                mean_cosine_similarity(out.clip.clone(), clip_target.clone()) as f64;
            loss = loss + loss_mse;

            if let (Some(text_out), Some(text_target)) = (&out.text, &clip_text) {
                let loss_mse_txt =
                    MseLoss::new().forward(text_out.clone(), text_target.clone(), Reduction::Mean);
                metrics.recon_mse_txt += scalar(&loss_mse_txt) as f64;
                metrics.recon_cossim_txt +=
                    mean_cosine_similarity(text_out.clone(), text_target.clone()) as f64;
                loss = loss + loss_mse_txt;
            }
        }

        // (a): contrastive retrieval loss
        if plan.clip_scale > 0.0 {
            let preds_norm = l2_normalize_rows(out.retrieval.clone());
            let targs_norm = l2_normalize_rows(clip_hidden.clone());

            let loss_clip = match &mixup {
                Some(state_m) => mixco_nce(
                    preds_norm.clone(),
                    targs_norm.clone(),
                    MIXCO_TEMP,
                    Some(state_m),
                ),
                None => {
                    let temp = self
                        .temp_schedule
                        .temperature(epoch)
                        .context("soft contrastive temperature schedule exhausted")?;
                    soft_clip_loss(preds_norm.clone(), targs_norm.clone(), temp)
                }
            };
            metrics.loss_clip += scalar(&loss_clip) as f64;
            loss = loss + loss_clip * plan.clip_scale;

            let fwd = batchwise_cosine_similarity(preds_norm.clone(), targs_norm.clone());
            metrics.fwd_pct_correct += topk_accuracy(fwd, 1) as f64;
            let bwd = batchwise_cosine_similarity(targs_norm, preds_norm);
            metrics.bwd_pct_correct += topk_accuracy(bwd, 1) as f64;
        }

        // (d): blurry latent reconstruction
        if let (Some(blur_pred), Some(codec)) = (&out.blur, inputs.codec.as_ref()) {
            let mut latent_target = codec.encode(&ids, &device)?;
            if let Some(state_m) = &mixup {
                latent_target = mixup_targets(latent_target, state_m);
            }
            let loss_blurry = l1_loss(blur_pred.clone(), latent_target);
            metrics.loss_blurry += scalar(&loss_blurry) as f64;
            loss = loss + loss_blurry * plan.blur_scale;

            // pixel correlation on a random fifth of the batch; decoding is
            // too slow to run on everything
            if codec.can_decode() {
                if let Some(archive) = &inputs.archive {
                    let subset = random_subset(ids.len(), key.fold_in(13));
                    let sel = index_tensor::<B>(&subset, &device);
                    let decoded = codec.decode(blur_pred.clone().detach().select(0, sel))?;
                    let sub_ids: Vec<u64> = subset.iter().map(|&i| ids[i]).collect();
                    let reference = archive.fetch::<B>(&sub_ids, &device)?;
                    metrics.blurry_pixcorr += pixcorr(reference, decoded) as f64;
                }
            }
        }

        let total = check_finite(&loss, "train")?;
        metrics.loss_total += total as f64;
        metrics.tick();

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        let lr = self.lr_schedule.current_lr();
        let model = optim.step(lr, model, grads);
        self.lr_schedule.advance();

        state.train_losses.push(total as f64);
        state.lrs.push(lr);
        state.scheduler_step = self.lr_schedule.step_count();
        Ok(model)
    }

    /// Evaluate the held-out set: one exact-length batch, repeat-averaged
    /// triplets, no mixup, fixed contrastive temperature.
    fn evaluate(
        &mut self,
        model: &MindcastModel<B>,
        inputs: &TrainInputs<B>,
        key: RngKey,
    ) -> Result<EpochMetrics> {
        assert_eq!(
            inputs.test_events.len(),
            self.plan.num_test,
            "held-out batch holds {} events, configuration expects {}",
            inputs.test_events.len(),
            self.plan.num_test
        );
        if self.test_set.is_none() {
            self.test_set = Some(build_test_set::<B>(
                &inputs.subjects[0],
                &inputs.test_events,
                self.plan.num_test,
                self.plan.seq_past,
                self.plan.seq_future,
                &self.device,
            )?);
        }
        let test_set = self.test_set.as_ref().expect("test set just built");
        let device = self.device.clone();
        let plan = &self.plan;

        let pool = test_set.score_pool();
        let ids = &test_set.stimulus_ids[..pool];
        let [_, seq, voxels] = test_set.voxels.dims();
        let voxel_batch = test_set.voxels.clone().slice([0..pool, 0..seq, 0..voxels]);

        let captions = inputs.captions.fetch(ids)?;
        assert_eq!(captions.len(), pool, "held-out captions disagree in count");

        let clip_target = inputs.embedder.embed_image(ids, &device)?;
        let clip_hidden = inputs.embedder.embed_image_hidden(ids, &device)?;
        let clip_text = if plan.dual_guidance {
            Some(inputs.embedder.embed_text(ids, &device)?)
        } else {
            None
        };

        // validation always runs through the first ridge head
        let encoded = model.ridge.forward(voxel_batch, 0);
        let out = model.backbone.forward(encoded);

        let mut metrics = EpochMetrics::new();
        let mut loss: Tensor<B, 1> = Tensor::zeros([1], &device);

        // prior/regression terms are scored on a random fifth of the pool
        let subset = random_subset(pool, key.fold_in(1));
        let sel = index_tensor::<B>(&subset, &device);
        let clip_sub = out.clip.clone().select(0, sel.clone());
        let target_sub = clip_target.clone().select(0, sel.clone());

        if let Some(prior) = &model.prior {
            let (loss_prior, prior_out) =
                prior.loss(clip_sub, target_sub.clone(), key.fold_in(2));
            metrics.loss_prior += scalar(&loss_prior) as f64;
            loss = loss + loss_prior * plan.prior_scale;
            metrics.recon_cossim += mean_cosine_similarity(prior_out, target_sub) as f64;

            if let (Some(prior_text), Some(text_out), Some(text_target)) =
                (&model.prior_text, &out.text, &clip_text)
            {
                let text_sub = text_out.clone().select(0, sel.clone());
                let text_target_sub = text_target.clone().select(0, sel.clone());
                let (loss_prior_txt, prior_out_txt) =
                    prior_text.loss(text_sub, text_target_sub.clone(), key.fold_in(3));
                metrics.loss_prior_txt += scalar(&loss_prior_txt) as f64;
                loss = loss + loss_prior_txt * plan.prior_scale;
                metrics.recon_cossim_txt +=
                    mean_cosine_similarity(prior_out_txt, text_target_sub) as f64;
            }
        } else {
            let loss_mse = MseLoss::new().forward(clip_sub.clone(), target_sub.clone(), Reduction::Mean);
            metrics.recon_mse += scalar(&loss_mse) as f64;
            metrics.recon_cossim += mean_cosine_similarity(clip_sub, target_sub) as f64;
            loss = loss + loss_mse;

            if let (Some(text_out), Some(text_target)) = (&out.text, &clip_text) {
                let text_sub = text_out.clone().select(0, sel.clone());
                let text_target_sub = text_target.clone().select(0, sel);
                let loss_mse_txt = MseLoss::new().forward(
                    text_sub.clone(),
                    text_target_sub.clone(),
                    Reduction::Mean,
                );
                metrics.recon_mse_txt += scalar(&loss_mse_txt) as f64;
                metrics.recon_cossim_txt +=
                    mean_cosine_similarity(text_sub, text_target_sub) as f64;
                loss = loss + loss_mse_txt;
            }
        }

        if plan.clip_scale > 0.0 {
            let preds_norm = l2_normalize_rows(out.retrieval.clone());
            let targs_norm = l2_normalize_rows(clip_hidden.clone());
            let loss_clip = soft_clip_loss(preds_norm.clone(), targs_norm.clone(), EVAL_CLIP_TEMP);
            metrics.loss_clip += scalar(&loss_clip) as f64;
            loss = loss + loss_clip * plan.clip_scale;

            let fwd = batchwise_cosine_similarity(preds_norm.clone(), targs_norm.clone());
            metrics.fwd_pct_correct += topk_accuracy(fwd, 1) as f64;
            let bwd = batchwise_cosine_similarity(targs_norm, preds_norm);
            metrics.bwd_pct_correct += topk_accuracy(bwd, 1) as f64;
        }

        if let (Some(blur_pred), Some(codec)) = (&out.blur, inputs.codec.as_ref()) {
            if codec.can_decode() {
                if let Some(archive) = &inputs.archive {
                    let subset = random_subset(pool, key.fold_in(4));
                    let sel = index_tensor::<B>(&subset, &device);
                    let decoded = codec.decode(blur_pred.clone().detach().select(0, sel))?;
                    let sub_ids: Vec<u64> = subset.iter().map(|&i| ids[i]).collect();
                    let reference = archive.fetch::<B>(&sub_ids, &device)?;
                    metrics.blurry_pixcorr += pixcorr(reference, decoded) as f64;
                }
            }
        }

        metrics.loss_total += check_finite(&loss, "test")? as f64;
        metrics.tick();
        Ok(metrics)
    }
}

fn scalar<B: Backend>(t: &Tensor<B, 1>) -> f32 {
    t.clone().into_data().to_vec().expect("scalar tensor")[0]
}

/// Random fifth of `0..n` (at least one index), without replacement.
fn random_subset(n: usize, key: RngKey) -> Vec<usize> {
    use rand::seq::SliceRandom;
    let take = (n / 5).max(1).min(n);
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = key.to_rng();
    indices.shuffle(&mut rng);
    indices.truncate(take);
    indices
}

fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let idx: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    Tensor::from_data(TensorData::new(idx, [indices.len()]), device)
}
