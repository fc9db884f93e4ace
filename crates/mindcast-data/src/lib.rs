//! # mindcast-data
//!
//! Data plumbing for the Mindcast pipeline: the stimulus archive and caption
//! store, behavioral event records and per-subject streams, mixup
//! augmentation, and the multi-subject epoch assembler.

pub mod assembler;
pub mod events;
pub mod mixup;
pub mod stimuli;
pub mod stream;
pub mod subject;

pub use assembler::{
    build_sequence_voxels, AssemblerConfig, EpochAssembler, EpochBatches, SentinelPolicy,
    SubjectBatch,
};
pub use events::{BehavioralEvent, ContextWindow, SENTINEL};
pub use mixup::{mixco, MixupState};
pub use stimuli::{CaptionStore, CaptionVariant, StimulusArchive};
pub use stream::{load_event_shard, EventStream, InMemoryEventStream, ShardedEventStream};
pub use subject::SubjectRecord;
