//! Behavioral event records.
//!
//! Each fMRI sample is described by a behavioral event: which stimulus image
//! was shown, which row of the subject's voxel matrix holds the response,
//! whether the stimulus belongs to the shared held-out set, and the voxel
//! rows of the surrounding presentations (past/future context). The on-disk
//! layout mirrors the behavioral arrays of the source dataset: f32 arrays of
//! shape `[samples, window, fields]` with the stimulus id in field 0, the
//! voxel row in field 5, and the shared flag in the last field.

use anyhow::{ensure, Result};
use ndarray::Array3;

/// Marks a context timepoint with no recorded presentation.
pub const SENTINEL: i64 = -1;

/// Field index of the stimulus (image) id.
pub const FIELD_STIMULUS: usize = 0;
/// Field index of the voxel row.
pub const FIELD_VOXEL_ROW: usize = 5;

/// Past or future presentation context for one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextWindow {
    /// Voxel row per context step; [`SENTINEL`] when unavailable.
    pub rows: Vec<i64>,
    /// Held-out ("shared") flag per context step.
    pub shared: Vec<bool>,
}

impl ContextWindow {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One stimulus presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BehavioralEvent {
    pub stimulus_id: u64,
    pub voxel_row: usize,
    pub shared: bool,
    pub past: ContextWindow,
    pub future: ContextWindow,
}

fn context_from_array(arr: &Array3<f32>, sample: usize) -> ContextWindow {
    let (_, window, fields) = arr.dim();
    let mut rows = Vec::with_capacity(window);
    let mut shared = Vec::with_capacity(window);
    for p in 0..window {
        rows.push(arr[[sample, p, FIELD_VOXEL_ROW]] as i64);
        shared.push(arr[[sample, p, fields - 1]] == 1.0);
    }
    ContextWindow { rows, shared }
}

/// Build events from the behavioral arrays of one shard.
///
/// `behav` holds the current presentation per sample; `past`/`future` hold
/// the context windows and may be omitted when no sequence context is used.
pub fn events_from_arrays(
    behav: &Array3<f32>,
    past: Option<&Array3<f32>>,
    future: Option<&Array3<f32>>,
) -> Result<Vec<BehavioralEvent>> {
    let (n, _, fields) = behav.dim();
    ensure!(
        fields > FIELD_VOXEL_ROW,
        "behavioral array has {} fields, need at least {}",
        fields,
        FIELD_VOXEL_ROW + 1
    );
    if let Some(past) = past {
        ensure!(
            past.dim().0 == n,
            "past-context array has {} samples, behavioral array has {}",
            past.dim().0,
            n
        );
    }
    if let Some(future) = future {
        ensure!(
            future.dim().0 == n,
            "future-context array has {} samples, behavioral array has {}",
            future.dim().0,
            n
        );
    }

    let mut events = Vec::with_capacity(n);
    for i in 0..n {
        let stimulus_id = behav[[i, 0, FIELD_STIMULUS]] as i64;
        let voxel_row = behav[[i, 0, FIELD_VOXEL_ROW]] as i64;
        ensure!(
            stimulus_id >= 0 && voxel_row >= 0,
            "sample {} has negative stimulus id or voxel row",
            i
        );
        events.push(BehavioralEvent {
            stimulus_id: stimulus_id as u64,
            voxel_row: voxel_row as usize,
            shared: behav[[i, 0, fields - 1]] == 1.0,
            past: past.map(|a| context_from_array(a, i)).unwrap_or_default(),
            future: future.map(|a| context_from_array(a, i)).unwrap_or_default(),
        });
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn behav_array(entries: &[(u64, usize, bool)]) -> Array3<f32> {
        let mut arr = Array3::<f32>::zeros((entries.len(), 1, 8));
        for (i, &(stim, row, shared)) in entries.iter().enumerate() {
            arr[[i, 0, FIELD_STIMULUS]] = stim as f32;
            arr[[i, 0, FIELD_VOXEL_ROW]] = row as f32;
            arr[[i, 0, 7]] = if shared { 1.0 } else { 0.0 };
        }
        arr
    }

    #[test]
    fn test_events_from_arrays_basic() {
        let behav = behav_array(&[(10, 0, false), (11, 1, true)]);
        let events = events_from_arrays(&behav, None, None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].stimulus_id, 10);
        assert_eq!(events[0].voxel_row, 0);
        assert!(!events[0].shared);
        assert!(events[1].shared);
        assert!(events[0].past.is_empty());
    }

    #[test]
    fn test_context_with_sentinel() {
        let behav = behav_array(&[(10, 2, false)]);
        let mut past = Array3::<f32>::zeros((1, 2, 8));
        past[[0, 0, FIELD_VOXEL_ROW]] = 5.0;
        past[[0, 1, FIELD_VOXEL_ROW]] = SENTINEL as f32;
        past[[0, 1, 7]] = 1.0;

        let events = events_from_arrays(&behav, Some(&past), None).unwrap();
        assert_eq!(events[0].past.rows, vec![5, SENTINEL]);
        assert_eq!(events[0].past.shared, vec![false, true]);
    }

    #[test]
    fn test_mismatched_context_rejected() {
        let behav = behav_array(&[(10, 0, false), (11, 1, false)]);
        let past = Array3::<f32>::zeros((1, 1, 8));
        assert!(events_from_arrays(&behav, Some(&past), None).is_err());
    }
}
