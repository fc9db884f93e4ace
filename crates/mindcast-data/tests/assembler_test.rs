//! Integration tests for the multi-subject epoch assembler.

use mindcast_core::{NdBackend, RngKey};
use mindcast_data::{
    build_sequence_voxels, AssemblerConfig, BehavioralEvent, ContextWindow, EpochAssembler,
    InMemoryEventStream, SentinelPolicy, SubjectRecord, SENTINEL,
};
use ndarray::Array2;

/// Voxel matrix where every value in row r equals r, so gathered rows are
/// recognizable in the output.
fn marked_voxels(samples: usize, voxels: usize) -> Array2<f32> {
    Array2::from_shape_fn((samples, voxels), |(r, _)| r as f32)
}

fn event(stimulus_id: u64, voxel_row: usize) -> BehavioralEvent {
    BehavioralEvent {
        stimulus_id,
        voxel_row,
        shared: false,
        past: ContextWindow::default(),
        future: ContextWindow::default(),
    }
}

fn subject_with_events(id: u32, events: Vec<BehavioralEvent>, batch_size: usize) -> SubjectRecord {
    let max_row = events.iter().map(|e| e.voxel_row).max().unwrap_or(0);
    SubjectRecord::new(
        id,
        marked_voxels(max_row + 1, 3),
        Box::new(InMemoryEventStream::new(events, batch_size, RngKey::new(id as u64))),
    )
}

#[test]
fn dedup_collapses_repeats_to_first_occurrence() {
    // 4 events but only 2 unique stimuli
    let events = vec![event(7, 0), event(7, 1), event(9, 2), event(9, 3)];
    let mut subjects = vec![subject_with_events(1, events, 4)];

    let assembler = EpochAssembler::new(AssemblerConfig {
        batch_size: 4,
        iterations_per_epoch: 1,
        seq_past: 0,
        seq_future: 0,
    });
    let device = Default::default();
    let batches = assembler
        .assemble::<NdBackend>(&mut subjects, false, RngKey::new(0), &device)
        .unwrap();

    let batch = batches.subject_batch(0, 0);
    assert!(batch.stimulus_ids.len() <= 4);
    assert_eq!(batch.stimulus_ids.len(), 2);
    assert_eq!(batch.voxels.dims()[0], 2);

    // first occurrence wins: whichever stimulus comes first in the shuffled
    // order, its first event's voxel row is the one gathered
    let rows: Vec<f32> = batch.voxels.clone().into_data().to_vec().unwrap();
    for (i, &id) in batch.stimulus_ids.iter().enumerate() {
        let row_val = rows[i * 3];
        match id {
            7 => assert!(row_val == 0.0 || row_val == 1.0),
            9 => assert!(row_val == 2.0 || row_val == 3.0),
            other => panic!("unexpected stimulus id {other}"),
        }
    }
}

#[test]
fn stream_restarts_until_iteration_quota() {
    // 4 events, batch 2 -> one pass holds 2 iterations, epoch needs 5
    let events = vec![event(1, 0), event(2, 1), event(3, 2), event(4, 3)];
    let mut subjects = vec![subject_with_events(1, events, 2)];

    let assembler = EpochAssembler::new(AssemblerConfig {
        batch_size: 2,
        iterations_per_epoch: 5,
        seq_past: 0,
        seq_future: 0,
    });
    let device = Default::default();
    let batches = assembler
        .assemble::<NdBackend>(&mut subjects, false, RngKey::new(0), &device)
        .unwrap();
    assert_eq!(batches.iterations(), 5);
    for i in 0..5 {
        assert!(!batches.subject_batch(0, i).stimulus_ids.is_empty());
    }
}

#[test]
fn empty_stream_is_fatal() {
    let mut subjects = vec![subject_with_events(1, Vec::new(), 2)];
    let assembler = EpochAssembler::new(AssemblerConfig {
        batch_size: 2,
        iterations_per_epoch: 1,
        seq_past: 0,
        seq_future: 0,
    });
    let device = Default::default();
    let err = assembler
        .assemble::<NdBackend>(&mut subjects, false, RngKey::new(0), &device)
        .unwrap_err();
    assert!(err.to_string().contains("no batch"));
}

#[test]
fn mixup_state_present_only_when_active() {
    let events = vec![event(1, 0), event(2, 1), event(3, 2), event(4, 3)];
    let device = Default::default();

    let assembler = EpochAssembler::new(AssemblerConfig {
        batch_size: 4,
        iterations_per_epoch: 2,
        seq_past: 0,
        seq_future: 0,
    });

    let mut subjects = vec![subject_with_events(1, events.clone(), 4)];
    let with_mixup = assembler
        .assemble::<NdBackend>(&mut subjects, true, RngKey::new(0), &device)
        .unwrap();
    assert!(with_mixup.subject_batch(0, 0).mixup.is_some());
    assert!(with_mixup.concat_mixup(0).is_some());

    let mut subjects = vec![subject_with_events(1, events, 4)];
    let without_mixup = assembler
        .assemble::<NdBackend>(&mut subjects, false, RngKey::new(0), &device)
        .unwrap();
    assert!(without_mixup.subject_batch(0, 0).mixup.is_none());
    assert!(without_mixup.concat_mixup(0).is_none());
}

#[test]
fn concat_mixup_offsets_across_subjects() {
    let events_a = vec![event(1, 0), event(2, 1)];
    let events_b = vec![event(3, 0), event(4, 1)];
    let mut subjects = vec![
        subject_with_events(1, events_a, 2),
        subject_with_events(2, events_b, 2),
    ];

    let assembler = EpochAssembler::new(AssemblerConfig {
        batch_size: 2,
        iterations_per_epoch: 1,
        seq_past: 0,
        seq_future: 0,
    });
    let device = Default::default();
    let batches = assembler
        .assemble::<NdBackend>(&mut subjects, true, RngKey::new(0), &device)
        .unwrap();

    let merged = batches.concat_mixup(0).unwrap();
    assert_eq!(merged.len(), 4);
    // subject 0 permutes within rows 0..2, subject 1 within rows 2..4
    assert!(merged.perm[..2].iter().all(|&p| p < 2));
    assert!(merged.perm[2..].iter().all(|&p| (2..4).contains(&p)));

    let ids = batches.concat_stimulus_ids(0);
    assert_eq!(ids.len(), 4);
}

#[test]
fn sentinel_context_substitution() {
    let mut e = event(5, 2);
    e.past = ContextWindow {
        rows: vec![1, SENTINEL],
        shared: vec![false, false],
    };
    let subject = subject_with_events(1, vec![e.clone()], 1);
    let device = Default::default();

    // training policy: sentinel -> current timepoint's voxels
    let t = build_sequence_voxels::<NdBackend>(
        &subject,
        &[&e],
        2,
        0,
        SentinelPolicy::CurrentTimepoint,
        &device,
    )
    .unwrap();
    assert_eq!(t.dims(), [1, 3, 3]);
    let vals: Vec<f32> = t.into_data().to_vec().unwrap();
    assert_eq!(&vals[0..3], &[2.0; 3], "current timepoint row");
    assert_eq!(&vals[3..6], &[1.0; 3], "valid past row");
    assert_eq!(&vals[6..9], &[2.0; 3], "sentinel replaced by current");

    // evaluation policy: sentinel -> zeros
    let t = build_sequence_voxels::<NdBackend>(
        &subject,
        &[&e],
        2,
        0,
        SentinelPolicy::Zero,
        &device,
    )
    .unwrap();
    let vals: Vec<f32> = t.into_data().to_vec().unwrap();
    assert_eq!(&vals[6..9], &[0.0; 3], "sentinel zeroed");
}

#[test]
fn shared_context_rows_are_masked() {
    let mut e = event(5, 2);
    e.future = ContextWindow {
        rows: vec![1],
        shared: vec![true],
    };
    let subject = subject_with_events(1, vec![e.clone()], 1);
    let device = Default::default();

    let t = build_sequence_voxels::<NdBackend>(
        &subject,
        &[&e],
        0,
        1,
        SentinelPolicy::CurrentTimepoint,
        &device,
    )
    .unwrap();
    let vals: Vec<f32> = t.into_data().to_vec().unwrap();
    assert_eq!(&vals[0..3], &[2.0; 3]);
    assert_eq!(&vals[3..6], &[0.0; 3], "shared context masked to zero");
}
