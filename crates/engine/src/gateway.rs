//! Enqueue gateway: `READY → QUEUED` plus exactly one dispatch notification.
//!
//! The compare-and-swap is the single source of truth for "has this chunk
//! been dispatched". A notification is published only by the caller whose
//! swap changed a row, so concurrent enqueue attempts on the same chunk yield
//! one notification at most. If publishing fails the chunk stays `QUEUED`;
//! redriving it is left to the orchestrator.

use chrono::Utc;
use tracing::{debug, warn};

use batchgate_core::{ChunkId, StatusChange, WorkChunk, WorkChunkStatus};
use batchgate_events::{ChunkReadyEvent, NotificationBus};

use crate::error::EngineResult;
use crate::store::ChunkStore;

/// Result of an enqueue attempt. Neither variant is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The chunk moved `READY → QUEUED`. `notified` is false when the
    /// transport refused the notification.
    Queued { notified: bool },
    /// The chunk was not `READY` (or does not exist); nothing changed.
    NotReady,
}

impl EnqueueOutcome {
    pub fn rows_updated(&self) -> usize {
        match self {
            Self::Queued { .. } => 1,
            Self::NotReady => 0,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

pub struct EnqueueGateway<S, B> {
    store: S,
    bus: B,
}

impl<S, B> EnqueueGateway<S, B>
where
    S: ChunkStore,
    B: NotificationBus<ChunkReadyEvent>,
{
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    /// Enqueue by id, reporting the rows updated (0 or 1) to `on_result`.
    pub fn enqueue_work_chunk_for_processing<F>(
        &self,
        chunk_id: ChunkId,
        on_result: F,
    ) -> EngineResult<EnqueueOutcome>
    where
        F: FnOnce(usize),
    {
        let outcome = self.enqueue(chunk_id)?;
        on_result(outcome.rows_updated());
        Ok(outcome)
    }

    pub fn enqueue(&self, chunk_id: ChunkId) -> EngineResult<EnqueueOutcome> {
        match self.store.fetch_chunk(chunk_id, false)? {
            Some(chunk) => self.enqueue_chunk(&chunk),
            None => {
                debug!(chunk_id = %chunk_id, "enqueue skipped: chunk not found");
                Ok(EnqueueOutcome::NotReady)
            }
        }
    }

    /// Enqueue a chunk already in hand. Only its identity is used; the
    /// status it carries may be stale and is not trusted.
    pub fn enqueue_chunk(&self, chunk: &WorkChunk) -> EngineResult<EnqueueOutcome> {
        let rows = self.store.update_chunk_status(
            chunk.id,
            WorkChunkStatus::Ready,
            WorkChunkStatus::Queued,
            &StatusChange::none(),
        )?;
        if rows == 0 {
            debug!(
                job_instance_id = %chunk.job_instance_id,
                chunk_id = %chunk.id,
                "enqueue skipped: chunk not ready"
            );
            return Ok(EnqueueOutcome::NotReady);
        }

        let event = ChunkReadyEvent::new(
            chunk.job_instance_id,
            chunk.id,
            chunk.target_step_id.clone(),
            Utc::now(),
        );
        let notified = match self.bus.publish(event) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    job_instance_id = %chunk.job_instance_id,
                    chunk_id = %chunk.id,
                    error = %err,
                    "chunk queued but notification failed; left for redrive"
                );
                false
            }
        };

        debug!(
            job_instance_id = %chunk.job_instance_id,
            chunk_id = %chunk.id,
            step_id = %chunk.target_step_id,
            notified,
            "work chunk queued"
        );
        Ok(EnqueueOutcome::Queued { notified })
    }
}
