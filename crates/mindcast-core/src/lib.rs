//! # mindcast-core
//!
//! Shared infrastructure for the Mindcast brain-decoding pipeline: backend
//! type aliases, the deterministic RNG key system, retrieval/reconstruction
//! metric primitives, and path configuration.

pub mod backend;
pub mod metrics;
pub mod paths;
pub mod rng;

pub use backend::{init_device, NdBackend, TrainBackend};
pub use paths::{PathArgs, PathConfig};
pub use rng::RngKey;
