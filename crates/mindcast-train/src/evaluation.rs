//! Held-out evaluation set construction.
//!
//! Evaluation reads the entire held-out split as one batch (its length must
//! equal the configured `num_test` exactly), groups repeated presentations of
//! each stimulus into triplets (padding by repetition when fewer than three
//! repeats exist), and averages the triplet voxels into one sequence per
//! unique stimulus. No mixup is applied on this path, and unavailable
//! sequence context is zeroed rather than substituted.

use anyhow::Result;
use burn::prelude::*;
use indexmap::IndexMap;
use mindcast_data::{build_sequence_voxels, BehavioralEvent, SentinelPolicy, SubjectRecord};

/// Maximum number of averaged samples scored per evaluation pass.
pub const EVAL_SCORE_POOL: usize = 300;

/// Group events by stimulus id into averaging triplets.
///
/// Every stimulus contributes exactly three event indices: a single
/// presentation is repeated three times, two presentations become
/// `[a, b, a]`, and three or more keep their first three.
pub fn group_repeats(ids: &[u64]) -> Vec<(u64, [usize; 3])> {
    let mut by_stimulus: IndexMap<u64, Vec<usize>> = IndexMap::new();
    for (i, &id) in ids.iter().enumerate() {
        by_stimulus.entry(id).or_default().push(i);
    }

    by_stimulus
        .into_iter()
        .map(|(id, locs)| {
            let triplet = match locs.len() {
                1 => [locs[0], locs[0], locs[0]],
                2 => [locs[0], locs[1], locs[0]],
                _ => [locs[0], locs[1], locs[2]],
            };
            (id, triplet)
        })
        .collect()
}

/// Averaged held-out samples: one voxel sequence per unique stimulus.
pub struct TestSet<B: Backend> {
    pub stimulus_ids: Vec<u64>,
    /// `[n_unique, seq_len, n_voxels]`, repeat-averaged.
    pub voxels: Tensor<B, 3>,
}

impl<B: Backend> TestSet<B> {
    pub fn len(&self) -> usize {
        self.stimulus_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stimulus_ids.is_empty()
    }

    /// Number of averaged samples actually scored.
    pub fn score_pool(&self) -> usize {
        self.len().min(EVAL_SCORE_POOL)
    }
}

/// Build the evaluation set from the raw held-out events.
///
/// The event batch must hold the entire held-out split: a mismatch with
/// `num_test` means the data on disk does not match the configuration and
/// halts the run.
pub fn build_test_set<B: Backend>(
    subject: &SubjectRecord,
    events: &[BehavioralEvent],
    num_test: usize,
    seq_past: usize,
    seq_future: usize,
    device: &B::Device,
) -> Result<TestSet<B>> {
    assert_eq!(
        events.len(),
        num_test,
        "held-out batch holds {} events, configuration expects {}",
        events.len(),
        num_test
    );

    let ids: Vec<u64> = events.iter().map(|e| e.stimulus_id).collect();
    let groups = group_repeats(&ids);

    let mut stimulus_ids = Vec::with_capacity(groups.len());
    let mut averaged = Vec::with_capacity(groups.len());
    for (id, triplet) in groups {
        assert_eq!(triplet.len(), 3);
        let refs: Vec<&BehavioralEvent> = triplet.iter().map(|&i| &events[i]).collect();
        let voxels = build_sequence_voxels::<B>(
            subject,
            &refs,
            seq_past,
            seq_future,
            SentinelPolicy::Zero,
            device,
        )?;
        averaged.push(voxels.mean_dim(0));
        stimulus_ids.push(id);
    }

    Ok(TestSet {
        stimulus_ids,
        voxels: Tensor::cat(averaged, 0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_repeats_pads_to_triplets() {
        // stimulus 5: one repeat, 6: two repeats, 7: three, 8: four
        let ids = [5, 6, 7, 6, 7, 8, 7, 8, 8, 8];
        let groups = group_repeats(&ids);
        assert_eq!(groups.len(), 4);

        let by_id: IndexMap<u64, [usize; 3]> = groups.into_iter().collect();
        assert_eq!(by_id[&5], [0, 0, 0], "single repeat padded three ways");
        assert_eq!(by_id[&6], [1, 3, 1], "two repeats padded as [a, b, a]");
        assert_eq!(by_id[&7], [2, 4, 6], "three repeats kept");
        assert_eq!(by_id[&8], [5, 7, 8], "extra repeats truncated to three");
    }

    #[test]
    fn test_group_repeats_preserves_first_occurrence_order() {
        let ids = [9, 3, 9, 1];
        let order: Vec<u64> = group_repeats(&ids).into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![9, 3, 1]);
    }
}
