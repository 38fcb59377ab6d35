//! Work chunk store boundary.
//!
//! The store is the single shared mutable resource of the engine. It records
//! job instances and their chunks and offers exactly one way to change a
//! chunk's status: [`ChunkStore::update_chunk_status`], a compare-and-swap on
//! the current status that reports how many rows it changed. Nothing in the
//! engine reads a status and then writes it back.
//!
//! Implementations:
//!
//! - [`InMemoryChunkStore`]: tests/dev, single process
//! - `PostgresChunkStore` (feature `postgres`): durable, shared by many processes

pub mod in_memory;
pub mod iter;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use batchgate_core::{
    ChunkId, JobInstanceId, NewWorkChunk, StatusChange, StepId, WorkChunk, WorkChunkStatus,
};

use crate::instance::JobInstance;

pub use in_memory::InMemoryChunkStore;
pub use iter::{ChunkIter, DEFAULT_PAGE_SIZE};
#[cfg(feature = "postgres")]
pub use postgres::PostgresChunkStore;

/// Store operation error.
///
/// Infrastructure failures and integrity conflicts. A compare-and-swap that
/// does not match is *not* an error; it returns zero rows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkStoreError {
    #[error("job instance not found: {0}")]
    InstanceNotFound(JobInstanceId),

    #[error("job instance already exists: {0}")]
    DuplicateInstance(JobInstanceId),

    #[error("work chunk already exists: {0}")]
    DuplicateChunk(ChunkId),

    #[error("sequence {sequence} already taken in step {step}")]
    DuplicateSequence { step: StepId, sequence: u32 },

    #[error("illegal chunk transition {from} -> {to}")]
    IllegalTransition {
        from: WorkChunkStatus,
        to: WorkChunkStatus,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl ChunkStoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Reject edges the chunk state machine does not allow, before any write.
pub(crate) fn check_transition(
    expected: WorkChunkStatus,
    new: WorkChunkStatus,
) -> Result<(), ChunkStoreError> {
    if expected.can_transition_to(new) {
        Ok(())
    } else {
        Err(ChunkStoreError::IllegalTransition {
            from: expected,
            to: new,
        })
    }
}

/// Position in the canonical chunk ordering of an instance.
///
/// Chunks are ordered by step ordinal, then per-step sequence, then id. Paged
/// scans resume strictly after the cursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCursor {
    pub step_ordinal: u32,
    pub sequence: u32,
    pub chunk_id: ChunkId,
}

impl ChunkCursor {
    pub fn of(chunk: &WorkChunk) -> Self {
        Self {
            step_ordinal: chunk.step_ordinal,
            sequence: chunk.sequence,
            chunk_id: chunk.id,
        }
    }
}

/// Durable record of job instances and their work chunks.
pub trait ChunkStore: Send + Sync {
    /// Persist a new job instance.
    fn create_instance(&self, instance: JobInstance) -> Result<JobInstanceId, ChunkStoreError>;

    fn fetch_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, ChunkStoreError>;

    /// Overwrite status and degraded flag of an existing instance. Sealed
    /// steps are only changed through [`seal_step`](Self::seal_step).
    fn update_instance(&self, instance: &JobInstance) -> Result<(), ChunkStoreError>;

    /// Delete an instance and, in cascade, all of its chunks. Returns the
    /// number of chunks removed.
    fn delete_instance(&self, id: JobInstanceId) -> Result<usize, ChunkStoreError>;

    /// Instances that are not `COMPLETED`.
    fn list_active_instances(&self) -> Result<Vec<JobInstanceId>, ChunkStoreError>;

    /// Record that a step's chunk set is fully written. Returns `true` if the
    /// step was not sealed before.
    fn seal_step(&self, id: JobInstanceId, step: &StepId) -> Result<bool, ChunkStoreError>;

    /// Persist a new chunk in its initial status.
    ///
    /// Fails with `DuplicateSequence` if a sibling in the same step already
    /// holds the sequence.
    fn create_chunk(&self, chunk: NewWorkChunk) -> Result<ChunkId, ChunkStoreError>;

    fn fetch_chunk(
        &self,
        id: ChunkId,
        include_data: bool,
    ) -> Result<Option<WorkChunk>, ChunkStoreError>;

    /// Atomically move `id` from `expected` to `new`, recording `change`.
    ///
    /// Returns the number of rows updated: `1` if the chunk was in `expected`,
    /// `0` otherwise (including when the chunk does not exist). An edge the
    /// state machine does not allow fails with `IllegalTransition` and
    /// writes nothing, so terminal chunks never change.
    fn update_chunk_status(
        &self,
        id: ChunkId,
        expected: WorkChunkStatus,
        new: WorkChunkStatus,
        change: &StatusChange,
    ) -> Result<usize, ChunkStoreError>;

    /// One page of an instance's chunks in canonical order, strictly after
    /// `after`.
    fn fetch_chunk_page(
        &self,
        instance: JobInstanceId,
        include_data: bool,
        after: Option<&ChunkCursor>,
        limit: usize,
    ) -> Result<Vec<WorkChunk>, ChunkStoreError>;

    fn count_chunks_by_step_and_status(
        &self,
        instance: JobInstanceId,
        step: &StepId,
        status: WorkChunkStatus,
    ) -> Result<usize, ChunkStoreError>;

    /// Highest sequence used in `step`, if any chunk exists there.
    fn max_sequence(
        &self,
        instance: JobInstanceId,
        step: &StepId,
    ) -> Result<Option<u32>, ChunkStoreError>;

    /// Lazy, restartable iterator over every chunk of an instance.
    fn fetch_all_chunks_iterator(
        &self,
        instance: JobInstanceId,
        include_data: bool,
    ) -> ChunkIter<'_, Self>
    where
        Self: Sized,
    {
        ChunkIter::new(self, instance, include_data, DEFAULT_PAGE_SIZE)
    }
}

impl<S> ChunkStore for Arc<S>
where
    S: ChunkStore + ?Sized,
{
    fn create_instance(&self, instance: JobInstance) -> Result<JobInstanceId, ChunkStoreError> {
        (**self).create_instance(instance)
    }

    fn fetch_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, ChunkStoreError> {
        (**self).fetch_instance(id)
    }

    fn update_instance(&self, instance: &JobInstance) -> Result<(), ChunkStoreError> {
        (**self).update_instance(instance)
    }

    fn delete_instance(&self, id: JobInstanceId) -> Result<usize, ChunkStoreError> {
        (**self).delete_instance(id)
    }

    fn list_active_instances(&self) -> Result<Vec<JobInstanceId>, ChunkStoreError> {
        (**self).list_active_instances()
    }

    fn seal_step(&self, id: JobInstanceId, step: &StepId) -> Result<bool, ChunkStoreError> {
        (**self).seal_step(id, step)
    }

    fn create_chunk(&self, chunk: NewWorkChunk) -> Result<ChunkId, ChunkStoreError> {
        (**self).create_chunk(chunk)
    }

    fn fetch_chunk(
        &self,
        id: ChunkId,
        include_data: bool,
    ) -> Result<Option<WorkChunk>, ChunkStoreError> {
        (**self).fetch_chunk(id, include_data)
    }

    fn update_chunk_status(
        &self,
        id: ChunkId,
        expected: WorkChunkStatus,
        new: WorkChunkStatus,
        change: &StatusChange,
    ) -> Result<usize, ChunkStoreError> {
        (**self).update_chunk_status(id, expected, new, change)
    }

    fn fetch_chunk_page(
        &self,
        instance: JobInstanceId,
        include_data: bool,
        after: Option<&ChunkCursor>,
        limit: usize,
    ) -> Result<Vec<WorkChunk>, ChunkStoreError> {
        (**self).fetch_chunk_page(instance, include_data, after, limit)
    }

    fn count_chunks_by_step_and_status(
        &self,
        instance: JobInstanceId,
        step: &StepId,
        status: WorkChunkStatus,
    ) -> Result<usize, ChunkStoreError> {
        (**self).count_chunks_by_step_and_status(instance, step, status)
    }

    fn max_sequence(
        &self,
        instance: JobInstanceId,
        step: &StepId,
    ) -> Result<Option<u32>, ChunkStoreError> {
        (**self).max_sequence(instance, step)
    }
}
