//! Per-subject sample streams.
//!
//! A subject's training data arrives as a stream of fixed-size event batches.
//! The epoch assembler treats every stream as infinite: when a pass over the
//! underlying data is exhausted before the epoch has enough iterations, the
//! stream is restarted (reshuffled) and reading continues.
//!
//! Two implementations cover the two dataset variants:
//! - [`ShardedEventStream`] reads behavioral `.npy` shards from disk with a
//!   shuffle buffer, for the archive-backed primary dataset.
//! - [`InMemoryEventStream`] serves a fixed event list, for the secondary
//!   dataset variant that ships as in-memory tensors.

use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mindcast_core::RngKey;
use ndarray::Array3;
use ndarray_npy::ReadNpyExt;
use rand::seq::SliceRandom;

use crate::events::{events_from_arrays, BehavioralEvent};

/// A restartable stream of event batches.
pub trait EventStream: Send {
    /// Next batch of exactly `batch_size` events, or `None` when the current
    /// pass is exhausted (trailing partial batches are dropped).
    fn next_batch(&mut self) -> Result<Option<Vec<BehavioralEvent>>>;

    /// Restart the stream for a fresh pass over the data.
    fn restart(&mut self) -> Result<()>;

    /// Batch size this stream was built with.
    fn batch_size(&self) -> usize;
}

/// Event stream over behavioral `.npy` shards.
///
/// Each shard is a trio of files sharing a stem: `<stem>.behav.npy` plus
/// optional `<stem>.past.npy` / `<stem>.future.npy` context arrays. Shard
/// order and a bounded shuffle buffer are reseeded on every restart, so
/// consecutive passes see different sample orders but the whole schedule is
/// determined by the seed key.
pub struct ShardedEventStream {
    shards: Vec<PathBuf>,
    batch_size: usize,
    shuffle_buffer: usize,
    key: RngKey,
    pass: u64,
    shard_order: Vec<usize>,
    shard_cursor: usize,
    buffer: VecDeque<BehavioralEvent>,
}

impl ShardedEventStream {
    pub fn new(shards: Vec<PathBuf>, batch_size: usize, key: RngKey) -> Result<Self> {
        anyhow::ensure!(!shards.is_empty(), "sharded stream needs at least one shard");
        let mut stream = Self {
            shard_order: (0..shards.len()).collect(),
            shards,
            batch_size,
            shuffle_buffer: 750,
            key,
            pass: 0,
            shard_cursor: 0,
            buffer: VecDeque::new(),
        };
        stream.reshuffle();
        Ok(stream)
    }

    /// Discover shards under `<data_path>/behav/subj<NN>/`, taking the first
    /// `num_sessions` in filename order.
    pub fn discover(
        data_path: &Path,
        subject_id: u32,
        num_sessions: usize,
        batch_size: usize,
        key: RngKey,
    ) -> Result<Self> {
        let dir = data_path.join(format!("behav/subj{:02}", subject_id));
        let mut shards: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to list behavioral shards in {:?}", dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    // the held-out split lives in the same directory
                    .map(|n| n.ends_with(".behav.npy") && !n.starts_with("test"))
                    .unwrap_or(false)
            })
            .collect();
        shards.sort();
        shards.truncate(num_sessions);
        anyhow::ensure!(
            !shards.is_empty(),
            "no behavioral shards found in {:?}",
            dir
        );
        Self::new(shards, batch_size, key)
    }

    pub fn with_shuffle_buffer(mut self, size: usize) -> Self {
        self.shuffle_buffer = size.max(1);
        self
    }

    fn reshuffle(&mut self) {
        let mut rng = self.key.fold_in(self.pass).to_rng();
        self.shard_order.shuffle(&mut rng);
        self.shard_cursor = 0;
        self.buffer.clear();
    }

    fn load_shard(&self, shard_idx: usize) -> Result<Vec<BehavioralEvent>> {
        let mut events = load_event_shard(&self.shards[shard_idx])?;

        let mut rng = self
            .key
            .fold_in(self.pass)
            .fold_in(shard_idx as u64 + 1)
            .to_rng();
        // bounded shuffle windows approximate the original's streaming buffer
        for chunk in events.chunks_mut(self.shuffle_buffer) {
            chunk.shuffle(&mut rng);
        }
        Ok(events)
    }
}

impl EventStream for ShardedEventStream {
    fn next_batch(&mut self) -> Result<Option<Vec<BehavioralEvent>>> {
        while self.buffer.len() < self.batch_size {
            if self.shard_cursor >= self.shard_order.len() {
                // pass exhausted; leftovers smaller than a batch are dropped
                self.buffer.clear();
                return Ok(None);
            }
            let shard_idx = self.shard_order[self.shard_cursor];
            self.shard_cursor += 1;
            self.buffer.extend(self.load_shard(shard_idx)?);
        }
        Ok(Some(self.buffer.drain(..self.batch_size).collect()))
    }

    fn restart(&mut self) -> Result<()> {
        self.pass += 1;
        self.reshuffle();
        Ok(())
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Event stream over a fixed in-memory event list.
pub struct InMemoryEventStream {
    events: Vec<BehavioralEvent>,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
    key: RngKey,
    pass: u64,
}

impl InMemoryEventStream {
    pub fn new(events: Vec<BehavioralEvent>, batch_size: usize, key: RngKey) -> Self {
        let mut stream = Self {
            order: (0..events.len()).collect(),
            events,
            batch_size,
            cursor: 0,
            key,
            pass: 0,
        };
        stream.reshuffle();
        stream
    }

    fn reshuffle(&mut self) {
        let mut rng = self.key.fold_in(self.pass).to_rng();
        self.order.shuffle(&mut rng);
        self.cursor = 0;
    }
}

impl EventStream for InMemoryEventStream {
    fn next_batch(&mut self) -> Result<Option<Vec<BehavioralEvent>>> {
        if self.cursor + self.batch_size > self.order.len() {
            return Ok(None);
        }
        let batch = self.order[self.cursor..self.cursor + self.batch_size]
            .iter()
            .map(|&i| self.events[i].clone())
            .collect();
        self.cursor += self.batch_size;
        Ok(Some(batch))
    }

    fn restart(&mut self) -> Result<()> {
        self.pass += 1;
        self.reshuffle();
        Ok(())
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Read one behavioral shard in file order.
///
/// `behav_path` is the `<stem>.behav.npy` file; `<stem>.past.npy` and
/// `<stem>.future.npy` are picked up when present.
pub fn load_event_shard(behav_path: &Path) -> Result<Vec<BehavioralEvent>> {
    let behav = read_npy_3d(behav_path)?;

    let stem = behav_path
        .to_str()
        .and_then(|p| p.strip_suffix(".behav.npy"))
        .map(str::to_owned)
        .with_context(|| format!("unexpected shard file name {:?}", behav_path))?;
    let past = read_optional_npy_3d(&PathBuf::from(format!("{stem}.past.npy")))?;
    let future = read_optional_npy_3d(&PathBuf::from(format!("{stem}.future.npy")))?;

    events_from_arrays(&behav, past.as_ref(), future.as_ref())
        .with_context(|| format!("bad behavioral shard {:?}", behav_path))
}

fn read_npy_3d(path: &Path) -> Result<Array3<f32>> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    Array3::<f32>::read_npy(file).with_context(|| format!("failed to parse {:?} as npy", path))
}

fn read_optional_npy_3d(path: &Path) -> Result<Option<Array3<f32>>> {
    if path.exists() {
        Ok(Some(read_npy_3d(path)?))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ContextWindow;

    fn event(stimulus_id: u64, voxel_row: usize) -> BehavioralEvent {
        BehavioralEvent {
            stimulus_id,
            voxel_row,
            shared: false,
            past: ContextWindow::default(),
            future: ContextWindow::default(),
        }
    }

    #[test]
    fn test_in_memory_stream_batches_then_exhausts() {
        let events: Vec<_> = (0..10).map(|i| event(i, i as usize)).collect();
        let mut stream = InMemoryEventStream::new(events, 4, RngKey::new(1));

        assert_eq!(stream.next_batch().unwrap().unwrap().len(), 4);
        assert_eq!(stream.next_batch().unwrap().unwrap().len(), 4);
        // 2 leftovers < batch_size: pass ends
        assert!(stream.next_batch().unwrap().is_none());

        stream.restart().unwrap();
        assert_eq!(stream.next_batch().unwrap().unwrap().len(), 4);
    }

    #[test]
    fn test_in_memory_stream_reshuffles_between_passes() {
        let events: Vec<_> = (0..8).map(|i| event(i, i as usize)).collect();
        let mut stream = InMemoryEventStream::new(events, 8, RngKey::new(7));

        let first: Vec<u64> = stream
            .next_batch()
            .unwrap()
            .unwrap()
            .iter()
            .map(|e| e.stimulus_id)
            .collect();
        stream.restart().unwrap();
        let second: Vec<u64> = stream
            .next_batch()
            .unwrap()
            .unwrap()
            .iter()
            .map(|e| e.stimulus_id)
            .collect();

        let mut sorted_first = first.clone();
        sorted_first.sort_unstable();
        let mut sorted_second = second.clone();
        sorted_second.sort_unstable();
        assert_eq!(sorted_first, sorted_second, "same events each pass");
        assert_ne!(first, second, "order should change between passes");
    }
}
