//! Reference chunk worker.
//!
//! Listens for dispatch notifications, claims the chunk, runs the step's
//! processor and reports the outcome. Payloads the processor emits become
//! chunks of the next step, parented to the processed chunk. Emission happens
//! before completion is reported; a worker that dies in between leaves the
//! chunk `IN_PROGRESS` for the orchestrator's timeout handling.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use batchgate_core::{WorkChunk, WorkChunkStatus};
use batchgate_events::{ChunkReadyEvent, Subscription};

use crate::coordinator::{CompletionOutcome, WorkChunkCompletionEvent, WorkChunkCoordinator};
use crate::creation::ChunkCreator;
use crate::definition::JobDefinitionRegistry;
use crate::error::{EngineError, EngineResult};
use crate::processor::{ChunkSink, StepOutcome};
use crate::store::ChunkStore;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to wait for a notification before checking for shutdown
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "batchgate-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub claimed: u64,
    /// Notifications for chunks someone else claimed first.
    pub missed: u64,
    pub completed: u64,
    pub errored: u64,
    pub failed: u64,
    pub emitted: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request shutdown and wait for the current chunk to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// What processing one notification led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkResult {
    /// The chunk was not `QUEUED` any more.
    Missed,
    Processed {
        outcome: CompletionOutcome,
        emitted: usize,
    },
}

pub struct ChunkWorker<S> {
    store: S,
    coordinator: WorkChunkCoordinator<S>,
    creator: ChunkCreator<S>,
    registry: Arc<JobDefinitionRegistry>,
}

impl<S> ChunkWorker<S>
where
    S: ChunkStore + Clone + 'static,
{
    pub fn new(store: S, registry: Arc<JobDefinitionRegistry>) -> Self {
        Self {
            coordinator: WorkChunkCoordinator::new(store.clone()),
            creator: ChunkCreator::new(store.clone(), registry.clone()),
            store,
            registry,
        }
    }

    /// Claim and process the chunk named by `event`.
    pub fn process_one(&self, event: &ChunkReadyEvent) -> EngineResult<WorkResult> {
        let Some(chunk) = self.coordinator.on_work_chunk_dequeue(event.chunk_id())? else {
            return Ok(WorkResult::Missed);
        };

        let (completion, emitted) = match self.run_processor(&chunk) {
            Ok(result) => result,
            Err(err) if err.is_structural() => {
                error!(chunk_id = %chunk.id, error = %err, "chunk cannot be processed");
                (WorkChunkCompletionEvent::failed(chunk.id, err.to_string()), 0)
            }
            Err(err) => {
                warn!(chunk_id = %chunk.id, error = %err, "chunk processing interrupted");
                (WorkChunkCompletionEvent::errored(chunk.id, err.to_string()), 0)
            }
        };

        let outcome = self.coordinator.on_work_chunk_completion(&completion)?;
        Ok(WorkResult::Processed { outcome, emitted })
    }

    fn run_processor(&self, chunk: &WorkChunk) -> EngineResult<(WorkChunkCompletionEvent, usize)> {
        let instance = self
            .store
            .fetch_instance(chunk.job_instance_id)?
            .ok_or(EngineError::JobInstanceNotFound(chunk.job_instance_id))?;
        let definition = self.registry.require(&instance.definition)?;
        let step = definition.require_step(&chunk.target_step_id)?;

        let Some(processor) = step.processor.clone() else {
            return Ok((
                WorkChunkCompletionEvent::failed(
                    chunk.id,
                    format!("no processor registered for step {}", step.id),
                ),
                0,
            ));
        };

        let mut sink = ChunkSink::new();
        let event = match processor.process(chunk, &mut sink) {
            StepOutcome::Success(records) => {
                WorkChunkCompletionEvent::new(chunk.id, records.processed, records.errored)
            }
            StepOutcome::Retryable { error, records } => {
                return Ok((
                    WorkChunkCompletionEvent::errored(chunk.id, error)
                        .with_records(records.processed, records.errored),
                    0,
                ));
            }
            StepOutcome::Fatal { error, records } => {
                return Ok((
                    WorkChunkCompletionEvent::failed(chunk.id, error)
                        .with_records(records.processed, records.errored),
                    0,
                ));
            }
        };

        let outputs = sink.into_outputs();
        let Some(next) = definition.next_step(step.ordinal) else {
            if !outputs.is_empty() {
                warn!(
                    chunk_id = %chunk.id,
                    step_id = %step.id,
                    discarded = outputs.len(),
                    "last step emitted chunks; discarded"
                );
            }
            return Ok((event, 0));
        };

        let emitted = outputs.len();
        for data in outputs {
            self.creator
                .emit_chunk(chunk.job_instance_id, &next.id, Some(chunk.id), data)?;
        }
        Ok((event, emitted))
    }

    /// Spawn the worker on its own thread, consuming `subscription`.
    pub fn spawn(
        self,
        subscription: Subscription<ChunkReadyEvent>,
        config: WorkerConfig,
    ) -> EngineResult<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(self, subscription, config, shutdown_rx, stats_clone))
            .map_err(|e| EngineError::Spawn(format!("{name}: {e}")))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn worker_loop<S>(
    worker: ChunkWorker<S>,
    subscription: Subscription<ChunkReadyEvent>,
    config: WorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) where
    S: ChunkStore + Clone + 'static,
{
    info!(worker = %config.name, "chunk worker started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let event = match subscription.recv_timeout(config.poll_interval) {
            Ok(event) => event,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Ok(mut s) = stats.lock() {
                    s.uptime_secs = start_time.elapsed().as_secs();
                }
                continue;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        let result = worker.process_one(&event);
        let Ok(mut s) = stats.lock() else { continue };
        s.uptime_secs = start_time.elapsed().as_secs();
        match result {
            Ok(WorkResult::Missed) => s.missed += 1,
            Ok(WorkResult::Processed { outcome, emitted }) => {
                s.claimed += 1;
                s.emitted += emitted as u64;
                match outcome {
                    CompletionOutcome::Applied { status } => match status {
                        WorkChunkStatus::Completed => s.completed += 1,
                        WorkChunkStatus::Errored => s.errored += 1,
                        WorkChunkStatus::Failed => s.failed += 1,
                        _ => {}
                    },
                    CompletionOutcome::Rejected { current } => {
                        debug!(
                            worker = %config.name,
                            chunk_id = %event.chunk_id(),
                            current = ?current,
                            "completion rejected"
                        );
                    }
                }
            }
            Err(e) => {
                error!(
                    worker = %config.name,
                    chunk_id = %event.chunk_id(),
                    error = %e,
                    "failed to process chunk"
                );
            }
        }
    }

    info!(worker = %config.name, "chunk worker stopped");
}
