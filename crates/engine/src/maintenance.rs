//! Maintenance runner: gate promotion and dispatch for one job instance.
//!
//! A pass works from a snapshot of the instance's chunks (taken without
//! payloads) and applies every change as a compare-and-swap, so it can run
//! next to workers that dequeue and complete chunks. A pass:
//!
//! 1. checks every chunk names a declared step (structural errors abort),
//! 2. seals every step whose chunk set can no longer grow,
//! 3. promotes `GATE_WAITING` chunks of each step whose predecessor is done,
//!    in ascending step order,
//! 4. asks the requeue policy about `ERRORED` chunks,
//! 5. hands every `READY` chunk to the enqueue gateway,
//! 6. derives the instance status from the resulting states.
//!
//! Passes for one instance are single-flight: an overlapping call returns a
//! skipped report. Different instances run concurrently.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use batchgate_core::{
    ChunkId, DomainError, JobInstanceId, StatusChange, StepId, WorkChunk, WorkChunkStatus,
};
use batchgate_events::{ChunkReadyEvent, NotificationBus};

use crate::definition::{JobDefinition, JobDefinitionRegistry};
use crate::error::{EngineError, EngineResult};
use crate::gate::{GateBlock, GatePolicy, GateVerdict, StepTally, ZeroChunkStepPolicy};
use crate::gateway::{EnqueueGateway, EnqueueOutcome};
use crate::instance::{JobInstance, JobInstanceStatus};
use crate::retry::{RequeueDecision, RequeuePolicy};
use crate::store::{ChunkStore, DEFAULT_PAGE_SIZE};

/// A gate that stayed shut in a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedGate {
    /// Step whose chunks are waiting.
    pub step: StepId,
    pub waiting: usize,
    pub reason: GateBlock,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub instance_id: JobInstanceId,
    /// Another pass for the instance was in flight; nothing was done.
    pub skipped: bool,
    pub promoted: usize,
    pub requeued: usize,
    pub enqueued: usize,
    /// `READY` chunks another path queued first.
    pub already_dispatched: usize,
    /// `ERRORED` chunks still backing off.
    pub waiting_retry: usize,
    pub blocked_gates: Vec<BlockedGate>,
    /// `ERRORED` chunks whose retry budget is spent.
    pub exhausted: Vec<ChunkId>,
    /// Steps sealed by this pass.
    pub sealed: Vec<StepId>,
    /// Steps without chunks that the zero-chunk policy does not accept yet;
    /// they hold back instance completion.
    pub unaccepted_empty_steps: Vec<StepId>,
    pub instance_status: JobInstanceStatus,
    pub degraded: bool,
}

impl MaintenanceReport {
    fn new(instance: &JobInstance) -> Self {
        Self {
            instance_id: instance.id,
            skipped: false,
            promoted: 0,
            requeued: 0,
            enqueued: 0,
            already_dispatched: 0,
            waiting_retry: 0,
            blocked_gates: Vec::new(),
            exhausted: Vec::new(),
            sealed: Vec::new(),
            unaccepted_empty_steps: Vec::new(),
            instance_status: instance.status,
            degraded: instance.degraded,
        }
    }

    fn skipped(instance_id: JobInstanceId) -> Self {
        Self {
            instance_id,
            skipped: true,
            promoted: 0,
            requeued: 0,
            enqueued: 0,
            already_dispatched: 0,
            waiting_retry: 0,
            blocked_gates: Vec::new(),
            exhausted: Vec::new(),
            sealed: Vec::new(),
            unaccepted_empty_steps: Vec::new(),
            instance_status: JobInstanceStatus::default(),
            degraded: false,
        }
    }

    /// True if the pass moved any chunk.
    pub fn changed_chunks(&self) -> bool {
        self.promoted + self.requeued + self.enqueued > 0
    }
}

/// Removes the instance from the in-flight set when the pass ends.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<JobInstanceId>>,
    id: JobInstanceId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

pub struct MaintenanceRunner<S, B> {
    store: S,
    gateway: EnqueueGateway<S, B>,
    registry: Arc<JobDefinitionRegistry>,
    gate: GatePolicy,
    requeue: Arc<dyn RequeuePolicy>,
    page_size: usize,
    in_flight: Mutex<HashSet<JobInstanceId>>,
}

impl<S, B> MaintenanceRunner<S, B>
where
    S: ChunkStore + Clone,
    B: NotificationBus<ChunkReadyEvent>,
{
    pub fn new(
        store: S,
        bus: B,
        registry: Arc<JobDefinitionRegistry>,
        requeue: Arc<dyn RequeuePolicy>,
    ) -> Self {
        Self {
            gateway: EnqueueGateway::new(store.clone(), bus),
            store,
            registry,
            gate: GatePolicy::default(),
            requeue,
            page_size: DEFAULT_PAGE_SIZE,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_gate_policy(mut self, gate: GatePolicy) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn gateway(&self) -> &EnqueueGateway<S, B> {
        &self.gateway
    }

    /// Run one pass over `instance_id`.
    pub fn run_maintenance_pass(&self, instance_id: JobInstanceId) -> EngineResult<MaintenanceReport> {
        let Some(_guard) = self.enter(instance_id)? else {
            debug!(job_instance_id = %instance_id, "maintenance pass already in flight; skipped");
            return Ok(MaintenanceReport::skipped(instance_id));
        };

        let mut instance = self
            .store
            .fetch_instance(instance_id)?
            .ok_or(EngineError::JobInstanceNotFound(instance_id))?;
        let mut report = MaintenanceReport::new(&instance);
        if instance.status == JobInstanceStatus::Completed {
            return Ok(report);
        }
        let definition = self.registry.require(&instance.definition)?;

        let mut chunks = self.snapshot(instance_id)?;
        check_structure(&definition, &chunks)?;

        self.seal_settled_steps(&definition, &mut instance, &chunks, &mut report)?;
        self.promote_gated(&definition, &instance, &mut chunks, &mut report)?;
        self.requeue_errored(&mut chunks, &mut report)?;
        self.dispatch_ready(&mut chunks, &mut report)?;

        let (status, degraded) = self.derive_status(&definition, &instance, &chunks, &mut report);
        if instance.advance(status, degraded) {
            self.store.update_instance(&instance)?;
            info!(
                job_instance_id = %instance_id,
                status = %instance.status,
                degraded = instance.degraded,
                "job instance status advanced"
            );
        }
        report.instance_status = instance.status;
        report.degraded = instance.degraded;

        if report.changed_chunks() || !report.exhausted.is_empty() || !report.sealed.is_empty() {
            info!(
                job_instance_id = %instance_id,
                promoted = report.promoted,
                requeued = report.requeued,
                enqueued = report.enqueued,
                exhausted = report.exhausted.len(),
                sealed = report.sealed.len(),
                blocked_gates = report.blocked_gates.len(),
                "maintenance pass finished"
            );
        } else {
            debug!(
                job_instance_id = %instance_id,
                blocked_gates = report.blocked_gates.len(),
                "maintenance pass found nothing to do"
            );
        }
        Ok(report)
    }

    fn enter(&self, instance_id: JobInstanceId) -> EngineResult<Option<InFlight<'_>>> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| EngineError::LockPoisoned("maintenance in-flight set"))?;
        if !set.insert(instance_id) {
            return Ok(None);
        }
        Ok(Some(InFlight {
            set: &self.in_flight,
            id: instance_id,
        }))
    }

    fn snapshot(&self, instance_id: JobInstanceId) -> EngineResult<Vec<WorkChunk>> {
        let chunks = self
            .store
            .fetch_all_chunks_iterator(instance_id, false)
            .with_page_size(self.page_size)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chunks)
    }

    /// Seal every step whose chunk set is final.
    ///
    /// A processor emits its next-step chunks before its own chunk completes,
    /// so once step N-1 is final and all of its chunks are done, step N cannot
    /// receive more chunks. The first step is final once it has a chunk.
    fn seal_settled_steps(
        &self,
        definition: &JobDefinition,
        instance: &mut JobInstance,
        chunks: &[WorkChunk],
        report: &mut MaintenanceReport,
    ) -> EngineResult<()> {
        let tallies = tally_by_step(definition, chunks);
        let first = definition.first_step();
        let mut previous_final = tallies[0].total() > 0 || instance.is_sealed(&first.id);

        for step in definition.steps().iter().skip(1) {
            let previous = &tallies[step.ordinal as usize - 1];
            let previous_done = previous.done() == previous.total();
            if previous_final && previous_done && !instance.is_sealed(&step.id) {
                if self.store.seal_step(instance.id, &step.id)? {
                    debug!(
                        job_instance_id = %instance.id,
                        step_id = %step.id,
                        "step sealed after its producer step finished"
                    );
                    report.sealed.push(step.id.clone());
                }
                instance.sealed_steps.insert(step.id.clone());
            }
            previous_final = instance.is_sealed(&step.id);
        }
        Ok(())
    }

    fn promote_gated(
        &self,
        definition: &JobDefinition,
        instance: &JobInstance,
        chunks: &mut [WorkChunk],
        report: &mut MaintenanceReport,
    ) -> EngineResult<()> {
        let mut tallies = tally_by_step(definition, chunks);

        for step in definition.steps().iter().skip(1) {
            let ordinal = step.ordinal as usize;
            let waiting = tallies[ordinal].count(WorkChunkStatus::GateWaiting);
            if waiting == 0 {
                continue;
            }

            let verdict = if definition.is_gated() {
                let previous = &definition.steps()[ordinal - 1];
                self.gate
                    .evaluate(&tallies[ordinal - 1], instance.is_sealed(&previous.id))
            } else {
                GateVerdict::Open
            };

            match verdict {
                GateVerdict::Open => {
                    for chunk in chunks.iter_mut().filter(|c| {
                        c.step_ordinal == step.ordinal && c.status == WorkChunkStatus::GateWaiting
                    }) {
                        let rows = self.store.update_chunk_status(
                            chunk.id,
                            WorkChunkStatus::GateWaiting,
                            WorkChunkStatus::Ready,
                            &StatusChange::none(),
                        )?;
                        if rows == 1 {
                            chunk.status = WorkChunkStatus::Ready;
                            report.promoted += 1;
                        }
                    }
                    tallies[ordinal] = chunks
                        .iter()
                        .filter(|c| c.step_ordinal == step.ordinal)
                        .map(|c| c.status)
                        .collect();
                    debug!(
                        job_instance_id = %instance.id,
                        step_id = %step.id,
                        waiting,
                        "gate opened"
                    );
                }
                GateVerdict::Blocked(reason) => {
                    if matches!(reason, GateBlock::PredecessorFailed { .. }) {
                        warn!(
                            job_instance_id = %instance.id,
                            step_id = %step.id,
                            %reason,
                            "gate blocked by failed predecessor chunks"
                        );
                    }
                    report.blocked_gates.push(BlockedGate {
                        step: step.id.clone(),
                        waiting,
                        reason,
                    });
                }
            }
        }
        Ok(())
    }

    fn requeue_errored(
        &self,
        chunks: &mut [WorkChunk],
        report: &mut MaintenanceReport,
    ) -> EngineResult<()> {
        let now = Utc::now();
        for chunk in chunks
            .iter_mut()
            .filter(|c| c.status == WorkChunkStatus::Errored)
        {
            match self.requeue.decide(chunk, now) {
                RequeueDecision::Requeue => {
                    let rows = self.store.update_chunk_status(
                        chunk.id,
                        WorkChunkStatus::Errored,
                        WorkChunkStatus::Ready,
                        &StatusChange::none(),
                    )?;
                    if rows == 1 {
                        chunk.status = WorkChunkStatus::Ready;
                        report.requeued += 1;
                        debug!(
                            job_instance_id = %chunk.job_instance_id,
                            chunk_id = %chunk.id,
                            attempts = chunk.error_count,
                            "errored chunk requeued"
                        );
                    }
                }
                RequeueDecision::Wait { .. } => report.waiting_retry += 1,
                RequeueDecision::GiveUp => {
                    warn!(
                        job_instance_id = %chunk.job_instance_id,
                        chunk_id = %chunk.id,
                        attempts = chunk.error_count,
                        "errored chunk exhausted its retries"
                    );
                    report.exhausted.push(chunk.id);
                }
            }
        }
        Ok(())
    }

    fn dispatch_ready(
        &self,
        chunks: &mut [WorkChunk],
        report: &mut MaintenanceReport,
    ) -> EngineResult<()> {
        for chunk in chunks.iter_mut().filter(|c| c.status.is_workable()) {
            match self.gateway.enqueue_chunk(chunk)? {
                EnqueueOutcome::Queued { .. } => {
                    chunk.status = WorkChunkStatus::Queued;
                    report.enqueued += 1;
                }
                EnqueueOutcome::NotReady => report.already_dispatched += 1,
            }
        }
        Ok(())
    }

    /// Status the instance has reached given the post-pass chunk states.
    ///
    /// `Completed` needs at least one chunk, every chunk done, and every step
    /// without chunks accepted as empty by the gate policy. Empty steps that
    /// are not accepted are listed in the report.
    fn derive_status(
        &self,
        definition: &JobDefinition,
        instance: &JobInstance,
        chunks: &[WorkChunk],
        report: &mut MaintenanceReport,
    ) -> (JobInstanceStatus, bool) {
        let degraded = chunks.iter().any(|c| c.status == WorkChunkStatus::Failed);
        if chunks.is_empty() {
            return (JobInstanceStatus::Created, degraded);
        }

        let all_done = chunks.iter().all(|c| c.status.counts_as_done());
        let tallies = tally_by_step(definition, chunks);
        report.unaccepted_empty_steps = definition
            .steps()
            .iter()
            .zip(&tallies)
            .filter(|(_, tally)| tally.total() == 0)
            .filter(|(step, _)| match self.gate.zero_chunk_steps {
                ZeroChunkStepPolicy::VacuouslyComplete => false,
                ZeroChunkStepPolicy::RequireSealed => !instance.is_sealed(&step.id),
                ZeroChunkStepPolicy::Block => true,
            })
            .map(|(step, _)| step.id.clone())
            .collect();

        if all_done && !report.unaccepted_empty_steps.is_empty() {
            warn!(
                job_instance_id = %instance.id,
                steps = ?report.unaccepted_empty_steps,
                "every chunk is done but empty steps hold back completion"
            );
        }

        let status = if all_done && report.unaccepted_empty_steps.is_empty() {
            JobInstanceStatus::Completed
        } else if chunks.iter().any(|c| c.status.is_dispatched()) {
            JobInstanceStatus::Running
        } else {
            JobInstanceStatus::Created
        };
        (status, degraded)
    }
}

fn tally_by_step(definition: &JobDefinition, chunks: &[WorkChunk]) -> Vec<StepTally> {
    let mut tallies = vec![StepTally::default(); definition.step_count()];
    for chunk in chunks {
        if let Some(tally) = tallies.get_mut(chunk.step_ordinal as usize) {
            tally.record(chunk.status);
        }
    }
    tallies
}

/// Every chunk must target a declared step at the ordinal it was created with.
fn check_structure(definition: &JobDefinition, chunks: &[WorkChunk]) -> EngineResult<()> {
    for chunk in chunks {
        let step = definition.require_step(&chunk.target_step_id)?;
        if step.ordinal != chunk.step_ordinal {
            return Err(DomainError::invariant(format!(
                "chunk {} records ordinal {} for step {} declared at {}",
                chunk.id, chunk.step_ordinal, step.id, step.ordinal
            ))
            .into());
        }
    }
    Ok(())
}
