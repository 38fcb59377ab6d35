//! Engine facade wiring the registry, store, bus and the four components.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use batchgate_core::{ChunkId, JobInstanceId, StepId, WorkChunk};
use batchgate_events::{ChunkReadyEvent, InMemoryNotificationBus, NotificationBus, Subscription};

use crate::config::EngineConfig;
use crate::coordinator::{CompletionOutcome, WorkChunkCompletionEvent, WorkChunkCoordinator};
use crate::creation::ChunkCreator;
use crate::definition::{JobDefinition, JobDefinitionKey, JobDefinitionRegistry};
use crate::error::{EngineError, EngineResult};
use crate::gateway::EnqueueOutcome;
use crate::hierarchy::ChunkBatch;
use crate::instance::JobInstance;
use crate::maintenance::{MaintenanceReport, MaintenanceRunner};
use crate::retry::RequeuePolicy;
use crate::service::MaintenanceService;
use crate::store::{ChunkStore, InMemoryChunkStore};
use crate::worker::ChunkWorker;

/// Engine over the in-memory store and bus.
pub type InMemoryEngine =
    BatchEngine<Arc<InMemoryChunkStore>, Arc<InMemoryNotificationBus<ChunkReadyEvent>>>;

pub struct BatchEngine<S, B> {
    store: S,
    bus: B,
    config: EngineConfig,
    registry: Arc<JobDefinitionRegistry>,
    creator: ChunkCreator<S>,
    coordinator: WorkChunkCoordinator<S>,
    runner: Arc<MaintenanceRunner<S, B>>,
}

impl InMemoryEngine {
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            InMemoryChunkStore::arc(),
            Arc::new(InMemoryNotificationBus::new()),
            config,
        )
    }
}

impl<S, B> BatchEngine<S, B>
where
    S: ChunkStore + Clone + 'static,
    B: NotificationBus<ChunkReadyEvent> + Clone + 'static,
{
    /// Build an engine using the configured retry policy.
    pub fn new(store: S, bus: B, config: EngineConfig) -> Self {
        let requeue: Arc<dyn RequeuePolicy> = Arc::new(config.retry.clone());
        Self::with_requeue_policy(store, bus, config, requeue)
    }

    /// Build an engine with a custom requeue policy; `config.retry` is ignored.
    pub fn with_requeue_policy(
        store: S,
        bus: B,
        config: EngineConfig,
        requeue: Arc<dyn RequeuePolicy>,
    ) -> Self {
        let registry = Arc::new(JobDefinitionRegistry::new());
        let runner = MaintenanceRunner::new(store.clone(), bus.clone(), registry.clone(), requeue)
            .with_gate_policy(config.gate)
            .with_page_size(config.maintenance.page_size);
        Self {
            creator: ChunkCreator::new(store.clone(), registry.clone()),
            coordinator: WorkChunkCoordinator::new(store.clone()),
            runner: Arc::new(runner),
            store,
            bus,
            config,
            registry,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobDefinitionRegistry> {
        &self.registry
    }

    pub fn register_definition(&self, definition: JobDefinition) -> EngineResult<Arc<JobDefinition>> {
        self.registry.register(definition)
    }

    pub fn subscribe(&self) -> Subscription<ChunkReadyEvent> {
        self.bus.subscribe()
    }

    pub fn start_instance(&self, key: &JobDefinitionKey) -> EngineResult<JobInstance> {
        self.creator.start_instance(key)
    }

    pub fn fetch_instance(&self, id: JobInstanceId) -> EngineResult<JobInstance> {
        self.store
            .fetch_instance(id)?
            .ok_or(EngineError::JobInstanceNotFound(id))
    }

    /// Delete an instance with all its chunks; returns the chunks removed.
    pub fn delete_instance(&self, id: JobInstanceId) -> EngineResult<usize> {
        Ok(self.store.delete_instance(id)?)
    }

    pub fn create_first_chunk(
        &self,
        definition: &JobDefinition,
        instance_id: JobInstanceId,
        data: JsonValue,
    ) -> EngineResult<ChunkId> {
        self.creator.create_first_chunk(definition, instance_id, data)
    }

    pub fn create_chunk_in_step(
        &self,
        instance_id: JobInstanceId,
        step: &StepId,
        gated: bool,
        data: JsonValue,
    ) -> EngineResult<ChunkId> {
        self.creator.create_chunk_in_step(instance_id, step, gated, data)
    }

    pub fn create_batch(&self, instance_id: JobInstanceId, batch: ChunkBatch) -> EngineResult<Vec<ChunkId>> {
        self.creator.create_batch(instance_id, batch)
    }

    pub fn seal_step(&self, instance_id: JobInstanceId, step: &StepId) -> EngineResult<bool> {
        self.creator.seal_step(instance_id, step)
    }

    pub fn fetch_chunk(&self, id: ChunkId, include_data: bool) -> EngineResult<WorkChunk> {
        self.store
            .fetch_chunk(id, include_data)?
            .ok_or(EngineError::ChunkNotFound(id))
    }

    pub fn run_maintenance_pass(&self, instance_id: JobInstanceId) -> EngineResult<MaintenanceReport> {
        self.runner.run_maintenance_pass(instance_id)
    }

    pub fn enqueue_work_chunk_for_processing<F>(
        &self,
        chunk_id: ChunkId,
        on_result: F,
    ) -> EngineResult<EnqueueOutcome>
    where
        F: FnOnce(usize),
    {
        self.runner
            .gateway()
            .enqueue_work_chunk_for_processing(chunk_id, on_result)
    }

    pub fn on_work_chunk_dequeue(&self, chunk_id: ChunkId) -> EngineResult<Option<WorkChunk>> {
        self.coordinator.on_work_chunk_dequeue(chunk_id)
    }

    pub fn on_work_chunk_completion(
        &self,
        event: &WorkChunkCompletionEvent,
    ) -> EngineResult<CompletionOutcome> {
        self.coordinator.on_work_chunk_completion(event)
    }

    /// Background maintenance over all active instances, per `config.maintenance`.
    pub fn maintenance_service(&self) -> MaintenanceService<S, B> {
        MaintenanceService::new(self.runner.clone(), self.config.maintenance.clone())
    }

    /// A reference worker sharing this engine's store and registry.
    pub fn worker(&self) -> ChunkWorker<S> {
        ChunkWorker::new(self.store.clone(), self.registry.clone())
    }
}
