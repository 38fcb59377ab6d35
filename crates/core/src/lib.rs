//! Domain building blocks for gated batch execution.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the work chunk entity and the status state machine that governs it.

pub mod chunk;
pub mod error;
pub mod id;
pub mod status;
pub mod step;

pub use chunk::{NewWorkChunk, RecordCounts, StatusChange, WorkChunk};
pub use error::{DomainError, DomainResult};
pub use id::{ChunkId, JobInstanceId};
pub use status::WorkChunkStatus;
pub use step::StepId;
