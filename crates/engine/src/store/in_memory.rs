//! In-memory chunk store for tests/dev.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use batchgate_core::{
    ChunkId, JobInstanceId, NewWorkChunk, StatusChange, StepId, WorkChunk, WorkChunkStatus,
};

use super::{check_transition, ChunkCursor, ChunkStore, ChunkStoreError};
use crate::instance::JobInstance;

#[derive(Debug, Default)]
struct State {
    instances: HashMap<JobInstanceId, JobInstance>,
    chunks: HashMap<ChunkId, WorkChunk>,
    /// Canonical ordering per instance.
    ordering: HashMap<JobInstanceId, BTreeMap<ChunkCursor, ChunkId>>,
    sequences: HashMap<(JobInstanceId, StepId), BTreeSet<u32>>,
}

/// In-memory chunk store.
///
/// A single `RwLock` guards all state, so every compare-and-swap is atomic
/// with respect to every other store operation.
#[derive(Debug, Default)]
pub struct InMemoryChunkStore {
    state: RwLock<State>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, ChunkStoreError> {
        self.state
            .read()
            .map_err(|_| ChunkStoreError::storage("chunk store lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, ChunkStoreError> {
        self.state
            .write()
            .map_err(|_| ChunkStoreError::storage("chunk store lock poisoned"))
    }
}

fn project(chunk: &WorkChunk, include_data: bool) -> WorkChunk {
    if include_data {
        chunk.clone()
    } else {
        chunk.without_data()
    }
}

impl ChunkStore for InMemoryChunkStore {
    fn create_instance(&self, instance: JobInstance) -> Result<JobInstanceId, ChunkStoreError> {
        let mut state = self.write()?;
        if state.instances.contains_key(&instance.id) {
            return Err(ChunkStoreError::DuplicateInstance(instance.id));
        }
        let id = instance.id;
        state.instances.insert(id, instance);
        state.ordering.insert(id, BTreeMap::new());
        Ok(id)
    }

    fn fetch_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, ChunkStoreError> {
        Ok(self.read()?.instances.get(&id).cloned())
    }

    fn update_instance(&self, instance: &JobInstance) -> Result<(), ChunkStoreError> {
        let mut state = self.write()?;
        match state.instances.get_mut(&instance.id) {
            Some(stored) => {
                stored.status = instance.status;
                stored.degraded = instance.degraded;
                stored.updated_at = instance.updated_at;
                Ok(())
            }
            None => Err(ChunkStoreError::InstanceNotFound(instance.id)),
        }
    }

    fn delete_instance(&self, id: JobInstanceId) -> Result<usize, ChunkStoreError> {
        let mut state = self.write()?;
        if state.instances.remove(&id).is_none() {
            return Err(ChunkStoreError::InstanceNotFound(id));
        }
        let ordering = state.ordering.remove(&id).unwrap_or_default();
        for chunk_id in ordering.values() {
            state.chunks.remove(chunk_id);
        }
        state.sequences.retain(|(instance, _), _| *instance != id);
        Ok(ordering.len())
    }

    fn list_active_instances(&self) -> Result<Vec<JobInstanceId>, ChunkStoreError> {
        let state = self.read()?;
        let mut active: Vec<_> = state
            .instances
            .values()
            .filter(|i| i.status.is_active())
            .map(|i| (i.created_at, i.id))
            .collect();
        active.sort();
        Ok(active.into_iter().map(|(_, id)| id).collect())
    }

    fn seal_step(&self, id: JobInstanceId, step: &StepId) -> Result<bool, ChunkStoreError> {
        let mut state = self.write()?;
        let instance = state
            .instances
            .get_mut(&id)
            .ok_or(ChunkStoreError::InstanceNotFound(id))?;
        let inserted = instance.sealed_steps.insert(step.clone());
        if inserted {
            instance.updated_at = Utc::now();
        }
        Ok(inserted)
    }

    fn create_chunk(&self, new: NewWorkChunk) -> Result<ChunkId, ChunkStoreError> {
        let mut state = self.write()?;
        if !state.instances.contains_key(&new.job_instance_id) {
            return Err(ChunkStoreError::InstanceNotFound(new.job_instance_id));
        }
        if state.chunks.contains_key(&new.id) {
            return Err(ChunkStoreError::DuplicateChunk(new.id));
        }

        let key = (new.job_instance_id, new.target_step_id.clone());
        if state
            .sequences
            .get(&key)
            .is_some_and(|taken| taken.contains(&new.sequence))
        {
            return Err(ChunkStoreError::DuplicateSequence {
                step: new.target_step_id,
                sequence: new.sequence,
            });
        }

        let chunk = WorkChunk::from_new(new, Utc::now());
        let id = chunk.id;
        state.sequences.entry(key).or_default().insert(chunk.sequence);
        state
            .ordering
            .entry(chunk.job_instance_id)
            .or_default()
            .insert(ChunkCursor::of(&chunk), id);
        state.chunks.insert(id, chunk);
        Ok(id)
    }

    fn fetch_chunk(
        &self,
        id: ChunkId,
        include_data: bool,
    ) -> Result<Option<WorkChunk>, ChunkStoreError> {
        Ok(self
            .read()?
            .chunks
            .get(&id)
            .map(|chunk| project(chunk, include_data)))
    }

    fn update_chunk_status(
        &self,
        id: ChunkId,
        expected: WorkChunkStatus,
        new: WorkChunkStatus,
        change: &StatusChange,
    ) -> Result<usize, ChunkStoreError> {
        check_transition(expected, new)?;
        let mut state = self.write()?;
        match state.chunks.get_mut(&id) {
            Some(chunk) if chunk.status == expected => {
                chunk.apply(new, change, Utc::now());
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    fn fetch_chunk_page(
        &self,
        instance: JobInstanceId,
        include_data: bool,
        after: Option<&ChunkCursor>,
        limit: usize,
    ) -> Result<Vec<WorkChunk>, ChunkStoreError> {
        let state = self.read()?;
        let Some(ordering) = state.ordering.get(&instance) else {
            return Ok(Vec::new());
        };
        let lower = match after {
            Some(cursor) => Bound::Excluded(cursor.clone()),
            None => Bound::Unbounded,
        };
        Ok(ordering
            .range((lower, Bound::Unbounded))
            .filter_map(|(_, id)| state.chunks.get(id))
            .take(limit)
            .map(|chunk| project(chunk, include_data))
            .collect())
    }

    fn count_chunks_by_step_and_status(
        &self,
        instance: JobInstanceId,
        step: &StepId,
        status: WorkChunkStatus,
    ) -> Result<usize, ChunkStoreError> {
        let state = self.read()?;
        let Some(ordering) = state.ordering.get(&instance) else {
            return Ok(0);
        };
        Ok(ordering
            .values()
            .filter_map(|id| state.chunks.get(id))
            .filter(|c| c.target_step_id == *step && c.status == status)
            .count())
    }

    fn max_sequence(
        &self,
        instance: JobInstanceId,
        step: &StepId,
    ) -> Result<Option<u32>, ChunkStoreError> {
        let state = self.read()?;
        Ok(state
            .sequences
            .get(&(instance, step.clone()))
            .and_then(|taken| taken.last().copied()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::JobDefinitionKey;
    use crate::store::ChunkStore;

    fn step(id: &str) -> StepId {
        StepId::parse(id).unwrap()
    }

    fn new_chunk(
        instance: JobInstanceId,
        step_id: &str,
        ordinal: u32,
        sequence: u32,
        status: WorkChunkStatus,
    ) -> NewWorkChunk {
        NewWorkChunk {
            id: ChunkId::new(),
            job_instance_id: instance,
            target_step_id: step(step_id),
            step_ordinal: ordinal,
            sequence,
            parent_chunk_id: None,
            data: serde_json::json!({"seq": sequence}),
            initial_status: status,
        }
    }

    fn store_with_instance() -> (InMemoryChunkStore, JobInstanceId) {
        let store = InMemoryChunkStore::new();
        let id = store
            .create_instance(JobInstance::new(JobDefinitionKey::new("import", 1)))
            .unwrap();
        (store, id)
    }

    #[test]
    fn compare_and_swap_only_matches_expected_status() {
        let (store, instance) = store_with_instance();
        let id = store
            .create_chunk(new_chunk(instance, "a", 0, 0, WorkChunkStatus::Ready))
            .unwrap();

        let none = StatusChange::none();
        assert_eq!(
            store
                .update_chunk_status(id, WorkChunkStatus::Queued, WorkChunkStatus::InProgress, &none)
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .update_chunk_status(id, WorkChunkStatus::Ready, WorkChunkStatus::Queued, &none)
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .update_chunk_status(id, WorkChunkStatus::Ready, WorkChunkStatus::Queued, &none)
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .update_chunk_status(ChunkId::new(), WorkChunkStatus::Ready, WorkChunkStatus::Queued, &none)
                .unwrap(),
            0
        );
    }

    #[test]
    fn terminal_chunks_refuse_every_transition() {
        let (store, instance) = store_with_instance();
        for (sequence, terminal) in [WorkChunkStatus::Completed, WorkChunkStatus::Failed]
            .into_iter()
            .enumerate()
        {
            let id = store
                .create_chunk(new_chunk(instance, "a", 0, sequence as u32, terminal))
                .unwrap();
            for target in WorkChunkStatus::ALL {
                let err = store
                    .update_chunk_status(id, terminal, target, &StatusChange::none())
                    .unwrap_err();
                assert_eq!(
                    err,
                    ChunkStoreError::IllegalTransition {
                        from: terminal,
                        to: target
                    }
                );
            }
            assert_eq!(store.fetch_chunk(id, false).unwrap().unwrap().status, terminal);
        }
    }

    #[test]
    fn edges_outside_the_state_machine_are_rejected_before_matching() {
        let (store, instance) = store_with_instance();
        let id = store
            .create_chunk(new_chunk(instance, "a", 0, 0, WorkChunkStatus::GateWaiting))
            .unwrap();

        assert!(matches!(
            store.update_chunk_status(
                id,
                WorkChunkStatus::GateWaiting,
                WorkChunkStatus::Queued,
                &StatusChange::none()
            ),
            Err(ChunkStoreError::IllegalTransition { .. })
        ));
        assert_eq!(
            store.fetch_chunk(id, false).unwrap().unwrap().status,
            WorkChunkStatus::GateWaiting
        );
    }

    #[test]
    fn duplicate_sequence_within_step_is_rejected() {
        let (store, instance) = store_with_instance();
        store
            .create_chunk(new_chunk(instance, "a", 0, 0, WorkChunkStatus::Ready))
            .unwrap();
        let err = store
            .create_chunk(new_chunk(instance, "a", 0, 0, WorkChunkStatus::Ready))
            .unwrap_err();
        assert!(matches!(err, ChunkStoreError::DuplicateSequence { sequence: 0, .. }));

        // Same sequence in another step is fine.
        store
            .create_chunk(new_chunk(instance, "b", 1, 0, WorkChunkStatus::GateWaiting))
            .unwrap();
        assert_eq!(store.max_sequence(instance, &step("a")).unwrap(), Some(0));
        assert_eq!(store.max_sequence(instance, &step("c")).unwrap(), None);
    }

    #[test]
    fn chunk_for_unknown_instance_is_rejected() {
        let store = InMemoryChunkStore::new();
        let err = store
            .create_chunk(new_chunk(JobInstanceId::new(), "a", 0, 0, WorkChunkStatus::Ready))
            .unwrap_err();
        assert!(matches!(err, ChunkStoreError::InstanceNotFound(_)));
    }

    #[test]
    fn iterator_pages_in_canonical_order_and_rewinds() {
        let (store, instance) = store_with_instance();
        for seq in (0..5).rev() {
            store
                .create_chunk(new_chunk(instance, "b", 1, seq, WorkChunkStatus::GateWaiting))
                .unwrap();
        }
        for seq in 0..3 {
            store
                .create_chunk(new_chunk(instance, "a", 0, seq, WorkChunkStatus::Ready))
                .unwrap();
        }

        let mut iter = store
            .fetch_all_chunks_iterator(instance, false)
            .with_page_size(2);
        let order: Vec<(u32, u32)> = iter
            .by_ref()
            .map(|c| c.map(|c| (c.step_ordinal, c.sequence)))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            order,
            vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2), (1, 3), (1, 4)]
        );
        assert!(iter.next().is_none());

        iter.rewind();
        let first = iter.next().unwrap().unwrap();
        assert_eq!((first.step_ordinal, first.sequence), (0, 0));
        assert!(first.data.is_none());
    }

    #[test]
    fn counts_by_step_and_status() {
        let (store, instance) = store_with_instance();
        store
            .create_chunk(new_chunk(instance, "a", 0, 0, WorkChunkStatus::Completed))
            .unwrap();
        store
            .create_chunk(new_chunk(instance, "a", 0, 1, WorkChunkStatus::Completed))
            .unwrap();
        store
            .create_chunk(new_chunk(instance, "a", 0, 2, WorkChunkStatus::Failed))
            .unwrap();

        assert_eq!(
            store
                .count_chunks_by_step_and_status(instance, &step("a"), WorkChunkStatus::Completed)
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .count_chunks_by_step_and_status(instance, &step("b"), WorkChunkStatus::Completed)
                .unwrap(),
            0
        );
    }

    #[test]
    fn delete_instance_cascades_to_chunks() {
        let (store, instance) = store_with_instance();
        let chunk = store
            .create_chunk(new_chunk(instance, "a", 0, 0, WorkChunkStatus::Ready))
            .unwrap();

        assert_eq!(store.delete_instance(instance).unwrap(), 1);
        assert!(store.fetch_chunk(chunk, true).unwrap().is_none());
        assert!(store.fetch_instance(instance).unwrap().is_none());
        assert!(matches!(
            store.delete_instance(instance),
            Err(ChunkStoreError::InstanceNotFound(_))
        ));
    }

    #[test]
    fn sealing_is_reported_once() {
        let (store, instance) = store_with_instance();
        assert!(store.seal_step(instance, &step("a")).unwrap());
        assert!(!store.seal_step(instance, &step("a")).unwrap());
        assert!(store.fetch_instance(instance).unwrap().unwrap().is_sealed(&step("a")));
    }
}
