//! Work chunk entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::{ChunkId, JobInstanceId};
use crate::status::WorkChunkStatus;
use crate::step::StepId;

/// A unit of work targeting one step of one job instance.
///
/// `status` is the single source of truth the state machine governs. Once a
/// chunk reaches a terminal status it is never written again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkChunk {
    pub id: ChunkId,
    pub job_instance_id: JobInstanceId,
    pub target_step_id: StepId,
    /// Position of `target_step_id` in the job definition (0 = first step).
    pub step_ordinal: u32,
    /// Stable per-step ordinal, unique among chunks sharing `target_step_id`.
    pub sequence: u32,
    /// Chunk whose processing emitted this one, if any.
    pub parent_chunk_id: Option<ChunkId>,
    pub status: WorkChunkStatus,
    /// Opaque worker payload. `None` when fetched without data.
    pub data: Option<JsonValue>,
    pub records_processed: u64,
    pub records_errored: u64,
    /// Number of times a worker reported a retryable failure.
    pub error_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkChunk {
    /// Materialize a chunk from a creation request.
    pub fn from_new(new: NewWorkChunk, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            job_instance_id: new.job_instance_id,
            target_step_id: new.target_step_id,
            step_ordinal: new.step_ordinal,
            sequence: new.sequence,
            parent_chunk_id: new.parent_chunk_id,
            status: new.initial_status,
            data: Some(new.data),
            records_processed: 0,
            records_errored: 0,
            error_count: 0,
            error_message: None,
            created_at: now,
            started_at: None,
            ended_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status change plus its side data.
    ///
    /// Callers are expected to have verified the edge (compare-and-swap on the
    /// current status); this only records the consequences.
    pub fn apply(&mut self, new_status: WorkChunkStatus, change: &StatusChange, now: DateTime<Utc>) {
        match new_status {
            WorkChunkStatus::InProgress => {
                self.started_at = Some(now);
            }
            WorkChunkStatus::Completed | WorkChunkStatus::Failed | WorkChunkStatus::Errored => {
                self.ended_at = Some(now);
                if let Some(counts) = change.records {
                    self.records_processed = counts.processed;
                    self.records_errored = counts.errored;
                }
                if new_status == WorkChunkStatus::Errored {
                    self.error_count = self.error_count.saturating_add(1);
                }
                if change.error_message.is_some() {
                    self.error_message = change.error_message.clone();
                }
            }
            WorkChunkStatus::GateWaiting | WorkChunkStatus::Ready | WorkChunkStatus::Queued => {}
        }
        self.status = new_status;
        self.updated_at = now;
    }

    /// Copy without the payload, as returned by scans that skip data.
    pub fn without_data(&self) -> Self {
        Self {
            data: None,
            ..self.clone()
        }
    }
}

/// Request to persist a new chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkChunk {
    pub id: ChunkId,
    pub job_instance_id: JobInstanceId,
    pub target_step_id: StepId,
    pub step_ordinal: u32,
    pub sequence: u32,
    pub parent_chunk_id: Option<ChunkId>,
    pub data: JsonValue,
    pub initial_status: WorkChunkStatus,
}

/// Success/failure tallies reported by a worker.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub processed: u64,
    pub errored: u64,
}

impl RecordCounts {
    pub fn new(processed: u64, errored: u64) -> Self {
        Self { processed, errored }
    }
}

/// Extra data persisted alongside a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusChange {
    pub records: Option<RecordCounts>,
    pub error_message: Option<String>,
}

impl StatusChange {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_records(mut self, records: RecordCounts) -> Self {
        self.records = Some(records);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}
