//! Dequeue/completion coordinator: the worker-facing half of the state machine.
//!
//! Both operations are a single compare-and-swap. Losing the swap is the
//! normal outcome of a race and is reported as "nothing to claim" or a
//! rejected completion, never as an error.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use batchgate_core::{ChunkId, RecordCounts, StatusChange, WorkChunk, WorkChunkStatus};

use crate::error::{EngineError, EngineResult};
use crate::store::ChunkStore;

/// Worker's classification of how processing ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ChunkOutcome {
    Succeeded,
    /// Retryable; the chunk goes to `ERRORED`.
    Errored { message: String },
    /// Not retryable; the chunk goes to `FAILED`.
    Failed { message: String },
}

impl ChunkOutcome {
    pub fn target_status(&self) -> WorkChunkStatus {
        match self {
            Self::Succeeded => WorkChunkStatus::Completed,
            Self::Errored { .. } => WorkChunkStatus::Errored,
            Self::Failed { .. } => WorkChunkStatus::Failed,
        }
    }

    fn message(&self) -> Option<&str> {
        match self {
            Self::Succeeded => None,
            Self::Errored { message } | Self::Failed { message } => Some(message),
        }
    }
}

/// Completion report sent by a worker after processing a dequeued chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkChunkCompletionEvent {
    pub chunk_id: ChunkId,
    pub records_processed: u64,
    pub records_errored: u64,
    pub outcome: ChunkOutcome,
}

impl WorkChunkCompletionEvent {
    pub fn new(chunk_id: ChunkId, records_processed: u64, records_errored: u64) -> Self {
        Self {
            chunk_id,
            records_processed,
            records_errored,
            outcome: ChunkOutcome::Succeeded,
        }
    }

    pub fn errored(chunk_id: ChunkId, message: impl Into<String>) -> Self {
        Self {
            chunk_id,
            records_processed: 0,
            records_errored: 0,
            outcome: ChunkOutcome::Errored {
                message: message.into(),
            },
        }
    }

    pub fn failed(chunk_id: ChunkId, message: impl Into<String>) -> Self {
        Self {
            chunk_id,
            records_processed: 0,
            records_errored: 0,
            outcome: ChunkOutcome::Failed {
                message: message.into(),
            },
        }
    }

    pub fn with_records(mut self, processed: u64, errored: u64) -> Self {
        self.records_processed = processed;
        self.records_errored = errored;
        self
    }

    fn status_change(&self) -> StatusChange {
        let change = StatusChange::none()
            .with_records(RecordCounts::new(self.records_processed, self.records_errored));
        match self.outcome.message() {
            Some(message) => change.with_error(message),
            None => change,
        }
    }
}

/// What happened to a completion report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The chunk moved out of `IN_PROGRESS` into `status`.
    Applied { status: WorkChunkStatus },
    /// The chunk was not `IN_PROGRESS`; `current` is its status, or `None`
    /// if it no longer exists.
    Rejected { current: Option<WorkChunkStatus> },
}

impl CompletionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

pub struct WorkChunkCoordinator<S> {
    store: S,
}

impl<S> WorkChunkCoordinator<S>
where
    S: ChunkStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Claim a `QUEUED` chunk. Returns the chunk with its payload, or `None`
    /// if it is missing or someone else already claimed it.
    pub fn on_work_chunk_dequeue(&self, chunk_id: ChunkId) -> EngineResult<Option<WorkChunk>> {
        let rows = self.store.update_chunk_status(
            chunk_id,
            WorkChunkStatus::Queued,
            WorkChunkStatus::InProgress,
            &StatusChange::none(),
        )?;
        if rows == 0 {
            debug!(chunk_id = %chunk_id, "dequeue found nothing to claim");
            return Ok(None);
        }

        let chunk = self
            .store
            .fetch_chunk(chunk_id, true)?
            .ok_or(EngineError::ChunkNotFound(chunk_id))?;
        debug!(
            job_instance_id = %chunk.job_instance_id,
            chunk_id = %chunk_id,
            step_id = %chunk.target_step_id,
            "work chunk claimed"
        );
        Ok(Some(chunk))
    }

    /// Record a worker's outcome for an `IN_PROGRESS` chunk.
    pub fn on_work_chunk_completion(
        &self,
        event: &WorkChunkCompletionEvent,
    ) -> EngineResult<CompletionOutcome> {
        let target = event.outcome.target_status();
        let rows = self.store.update_chunk_status(
            event.chunk_id,
            WorkChunkStatus::InProgress,
            target,
            &event.status_change(),
        )?;

        if rows == 1 {
            match &event.outcome {
                ChunkOutcome::Succeeded => debug!(
                    chunk_id = %event.chunk_id,
                    records_processed = event.records_processed,
                    records_errored = event.records_errored,
                    "work chunk completed"
                ),
                ChunkOutcome::Errored { message } => info!(
                    chunk_id = %event.chunk_id,
                    error = %message,
                    "work chunk errored; eligible for requeue"
                ),
                ChunkOutcome::Failed { message } => warn!(
                    chunk_id = %event.chunk_id,
                    error = %message,
                    "work chunk failed"
                ),
            }
            return Ok(CompletionOutcome::Applied { status: target });
        }

        let current = self
            .store
            .fetch_chunk(event.chunk_id, false)?
            .map(|chunk| chunk.status);
        debug!(
            chunk_id = %event.chunk_id,
            current = ?current,
            "completion rejected: chunk not in progress"
        );
        Ok(CompletionOutcome::Rejected { current })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use batchgate_core::{JobInstanceId, NewWorkChunk, StepId};

    use crate::definition::JobDefinitionKey;
    use crate::instance::JobInstance;
    use crate::store::InMemoryChunkStore;

    fn seed(store: &InMemoryChunkStore, status: WorkChunkStatus) -> ChunkId {
        let instance: JobInstanceId = store
            .create_instance(JobInstance::new(JobDefinitionKey::new("import", 1)))
            .unwrap();
        store
            .create_chunk(NewWorkChunk {
                id: ChunkId::new(),
                job_instance_id: instance,
                target_step_id: StepId::parse("extract").unwrap(),
                step_ordinal: 0,
                sequence: 0,
                parent_chunk_id: None,
                data: serde_json::json!({"rows": [1, 2, 3]}),
                initial_status: status,
            })
            .unwrap()
    }

    #[test]
    fn dequeue_then_complete_keeps_payload() {
        let store = InMemoryChunkStore::arc();
        let coordinator = WorkChunkCoordinator::new(store.clone());
        let id = seed(&store, WorkChunkStatus::Queued);

        let claimed = coordinator.on_work_chunk_dequeue(id).unwrap().unwrap();
        assert_eq!(claimed.status, WorkChunkStatus::InProgress);
        assert!(claimed.started_at.is_some());

        let outcome = coordinator
            .on_work_chunk_completion(&WorkChunkCompletionEvent::new(id, 3, 0))
            .unwrap();
        assert_eq!(
            outcome,
            CompletionOutcome::Applied {
                status: WorkChunkStatus::Completed
            }
        );

        let done = store.fetch_chunk(id, true).unwrap().unwrap();
        assert_eq!(done.status, WorkChunkStatus::Completed);
        assert_eq!(done.records_processed, 3);
        assert_eq!(done.data, Some(serde_json::json!({"rows": [1, 2, 3]})));
    }

    #[test]
    fn dequeue_requires_queued() {
        let store = InMemoryChunkStore::arc();
        let coordinator = WorkChunkCoordinator::new(store.clone());
        for status in WorkChunkStatus::ALL {
            if status == WorkChunkStatus::Queued {
                continue;
            }
            let id = seed(&store, status);
            assert!(coordinator.on_work_chunk_dequeue(id).unwrap().is_none(), "{status}");
        }
        assert!(coordinator.on_work_chunk_dequeue(ChunkId::new()).unwrap().is_none());
    }

    #[test]
    fn concurrent_dequeues_have_one_winner() {
        let store = InMemoryChunkStore::arc();
        let coordinator = Arc::new(WorkChunkCoordinator::new(store.clone()));
        let id = seed(&store, WorkChunkStatus::Queued);

        let winners: usize = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                thread::spawn(move || coordinator.on_work_chunk_dequeue(id).unwrap().is_some())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn duplicate_completion_is_rejected_with_current_status() {
        let store = InMemoryChunkStore::arc();
        let coordinator = WorkChunkCoordinator::new(store.clone());
        let id = seed(&store, WorkChunkStatus::Queued);
        coordinator.on_work_chunk_dequeue(id).unwrap();

        let failed = WorkChunkCompletionEvent::failed(id, "bad row").with_records(1, 2);
        assert!(coordinator.on_work_chunk_completion(&failed).unwrap().is_applied());
        assert_eq!(
            coordinator
                .on_work_chunk_completion(&WorkChunkCompletionEvent::new(id, 9, 0))
                .unwrap(),
            CompletionOutcome::Rejected {
                current: Some(WorkChunkStatus::Failed)
            }
        );

        let chunk = store.fetch_chunk(id, false).unwrap().unwrap();
        assert_eq!(chunk.records_errored, 2);
        assert_eq!(chunk.error_message.as_deref(), Some("bad row"));
    }

    #[test]
    fn errored_completion_counts_attempts() {
        let store = InMemoryChunkStore::arc();
        let coordinator = WorkChunkCoordinator::new(store.clone());
        let id = seed(&store, WorkChunkStatus::Queued);
        coordinator.on_work_chunk_dequeue(id).unwrap();
        coordinator
            .on_work_chunk_completion(&WorkChunkCompletionEvent::errored(id, "timeout"))
            .unwrap();

        let chunk = store.fetch_chunk(id, false).unwrap().unwrap();
        assert_eq!(chunk.status, WorkChunkStatus::Errored);
        assert_eq!(chunk.error_count, 1);
    }
}
