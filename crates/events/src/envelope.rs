use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use batchgate_core::{ChunkId, JobInstanceId, StepId};

/// Notification that a chunk moved `READY -> QUEUED` and may be claimed.
///
/// Exactly one of these is published per successful transition. The chunk
/// payload is not carried here; a worker fetches it when it dequeues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReadyEvent {
    event_id: Uuid,
    job_instance_id: JobInstanceId,
    chunk_id: ChunkId,
    target_step_id: StepId,
    enqueued_at: DateTime<Utc>,
}

impl ChunkReadyEvent {
    pub fn new(
        job_instance_id: JobInstanceId,
        chunk_id: ChunkId,
        target_step_id: StepId,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            job_instance_id,
            chunk_id,
            target_step_id,
            enqueued_at,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn job_instance_id(&self) -> JobInstanceId {
        self.job_instance_id
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn target_step_id(&self) -> &StepId {
        &self.target_step_id
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Key a deduplicating transport can use; one per chunk dispatch.
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}", self.chunk_id, self.event_id)
    }
}
