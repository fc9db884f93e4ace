//! Multi-subject epoch assembler.
//!
//! Before each epoch the trainer pre-loads every iteration's batch for every
//! subject: pulling event batches from the per-subject streams (restarting
//! them when a pass runs dry), collapsing repeated presentations of the same
//! stimulus to their first occurrence, gathering the voxel sequences with
//! past/future context, and applying mixup while the schedule is inside the
//! mixup phase. The assembled [`EpochBatches`] owns everything an epoch's
//! training iterations need and is dropped when the epoch ends.

use anyhow::{bail, ensure, Result};
use burn::prelude::*;
use indexmap::IndexMap;
use mindcast_core::RngKey;

use crate::events::{BehavioralEvent, SENTINEL};
use crate::mixup::{mixco, MixupState};
use crate::subject::SubjectRecord;

/// How to substitute a context timepoint whose sentinel marks it unavailable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SentinelPolicy {
    /// Substitute the current timepoint's voxels (training path).
    CurrentTimepoint,
    /// Substitute a zero vector (evaluation path).
    Zero,
}

#[derive(Clone, Copy, Debug)]
pub struct AssemblerConfig {
    /// Per-subject batch size (events pulled per iteration).
    pub batch_size: usize,
    pub iterations_per_epoch: usize,
    pub seq_past: usize,
    pub seq_future: usize,
}

impl AssemblerConfig {
    pub fn seq_len(&self) -> usize {
        self.seq_past + 1 + self.seq_future
    }
}

/// One subject's share of one iteration.
#[derive(Debug)]
pub struct SubjectBatch<B: Backend> {
    /// De-duplicated stimulus ids, in first-occurrence order. All other
    /// fields of the batch are aligned to this ordering.
    pub stimulus_ids: Vec<u64>,
    /// Voxel sequences `[n_unique, seq_len, n_voxels]` (mixed when `mixup`
    /// is present).
    pub voxels: Tensor<B, 3>,
    pub mixup: Option<MixupState>,
}

/// All batches of one epoch, indexed `[subject][iteration]`.
#[derive(Debug)]
pub struct EpochBatches<B: Backend> {
    batches: Vec<Vec<SubjectBatch<B>>>,
    pub subject_ids: Vec<u32>,
    iterations: usize,
}

impl<B: Backend> EpochBatches<B> {
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn num_subjects(&self) -> usize {
        self.subject_ids.len()
    }

    pub fn subject_batch(&self, subject: usize, iteration: usize) -> &SubjectBatch<B> {
        &self.batches[subject][iteration]
    }

    /// Stimulus ids of one iteration, concatenated across subjects.
    pub fn concat_stimulus_ids(&self, iteration: usize) -> Vec<u64> {
        self.batches
            .iter()
            .flat_map(|per_subject| per_subject[iteration].stimulus_ids.iter().copied())
            .collect()
    }

    /// Mixup state of one iteration over the concatenated batch, with each
    /// subject's permutation re-based onto its slot offset. `None` outside
    /// the mixup phase.
    pub fn concat_mixup(&self, iteration: usize) -> Option<MixupState> {
        let parts: Option<Vec<&MixupState>> = self
            .batches
            .iter()
            .map(|per_subject| per_subject[iteration].mixup.as_ref())
            .collect();
        parts.map(|parts| MixupState::concat_with_offsets(&parts))
    }
}

/// Builds [`EpochBatches`] from subject records.
pub struct EpochAssembler {
    config: AssemblerConfig,
}

impl EpochAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Assemble every iteration of one epoch.
    ///
    /// Streams are treated as infinite: a pass that runs dry is restarted
    /// until the iteration quota is met. A stream that cannot produce a
    /// single batch after a restart is a fatal configuration error.
    pub fn assemble<B: Backend>(
        &self,
        subjects: &mut [SubjectRecord],
        mixup_active: bool,
        key: RngKey,
        device: &B::Device,
    ) -> Result<EpochBatches<B>> {
        ensure!(!subjects.is_empty(), "assembler needs at least one subject");

        let mut batches = Vec::with_capacity(subjects.len());
        for (s, subject) in subjects.iter_mut().enumerate() {
            let subject_key = key.fold_in(s as u64);
            let mut per_subject = Vec::with_capacity(self.config.iterations_per_epoch);
            let mut starved_restarts = 0u32;

            while per_subject.len() < self.config.iterations_per_epoch {
                match subject.stream.next_batch()? {
                    Some(events) => {
                        starved_restarts = 0;
                        let iter_key = subject_key.fold_in(per_subject.len() as u64);
                        per_subject.push(self.build_subject_batch::<B>(
                            subject,
                            &events,
                            mixup_active,
                            iter_key,
                            device,
                        )?);
                    }
                    None => {
                        starved_restarts += 1;
                        if starved_restarts > 1 {
                            bail!(
                                "subject {:02}: event stream produced no batch even after a \
                                 restart (fewer samples than one batch of {}?)",
                                subject.id,
                                self.config.batch_size
                            );
                        }
                        subject.stream.restart()?;
                    }
                }
            }
            batches.push(per_subject);
        }

        Ok(EpochBatches {
            subject_ids: subjects.iter().map(|s| s.id).collect(),
            batches,
            iterations: self.config.iterations_per_epoch,
        })
    }

    fn build_subject_batch<B: Backend>(
        &self,
        subject: &SubjectRecord,
        events: &[BehavioralEvent],
        mixup_active: bool,
        key: RngKey,
        device: &B::Device,
    ) -> Result<SubjectBatch<B>> {
        // collapse repeated presentations to their first occurrence
        let mut first_seen: IndexMap<u64, &BehavioralEvent> = IndexMap::new();
        for event in events {
            first_seen.entry(event.stimulus_id).or_insert(event);
        }
        let unique: Vec<&BehavioralEvent> = first_seen.values().copied().collect();
        assert!(
            unique.len() <= self.config.batch_size,
            "de-duplicated rows ({}) exceed the per-subject batch size ({})",
            unique.len(),
            self.config.batch_size
        );

        let voxels = build_sequence_voxels::<B>(
            subject,
            &unique,
            self.config.seq_past,
            self.config.seq_future,
            SentinelPolicy::CurrentTimepoint,
            device,
        )?;

        let (voxels, mixup) = if mixup_active {
            let (mixed, state) = mixco(voxels, key, device);
            (mixed, Some(state))
        } else {
            (voxels, None)
        };

        Ok(SubjectBatch {
            stimulus_ids: first_seen.keys().copied().collect(),
            voxels,
            mixup,
        })
    }
}

/// Gather voxel sequences `[n, seq_len, n_voxels]` for a set of events.
///
/// Sequence order is current timepoint, then past context (nearest first),
/// then future context. Unavailable context timepoints (sentinel `-1`, or a
/// window shorter than requested) follow `policy`; shared held-out context
/// samples are always zeroed so the held-out set cannot leak into training.
pub fn build_sequence_voxels<B: Backend>(
    subject: &SubjectRecord,
    events: &[&BehavioralEvent],
    seq_past: usize,
    seq_future: usize,
    policy: SentinelPolicy,
    device: &B::Device,
) -> Result<Tensor<B, 3>> {
    let n = events.len();
    let n_voxels = subject.num_voxels();
    let seq_len = seq_past + 1 + seq_future;

    let mut flat = Vec::with_capacity(n * seq_len * n_voxels);
    for event in events {
        subject.copy_row(event.voxel_row, &mut flat)?;

        for p in 0..seq_past {
            push_context_row(subject, event, &event.past, p, policy, &mut flat)?;
        }
        for p in 0..seq_future {
            push_context_row(subject, event, &event.future, p, policy, &mut flat)?;
        }
    }

    let t = Tensor::<B, 1>::from_data(flat.as_slice(), device);
    Ok(t.reshape([n, seq_len, n_voxels]))
}

fn push_context_row(
    subject: &SubjectRecord,
    event: &BehavioralEvent,
    window: &crate::events::ContextWindow,
    step: usize,
    policy: SentinelPolicy,
    flat: &mut Vec<f32>,
) -> Result<()> {
    let row = window.rows.get(step).copied().unwrap_or(SENTINEL);
    let shared = window.shared.get(step).copied().unwrap_or(false);

    if shared {
        subject.push_zero_row(flat);
        return Ok(());
    }
    if row == SENTINEL {
        match policy {
            SentinelPolicy::CurrentTimepoint => subject.copy_row(event.voxel_row, flat)?,
            SentinelPolicy::Zero => subject.push_zero_row(flat),
        }
        return Ok(());
    }
    subject.copy_row(row as usize, flat)
}
