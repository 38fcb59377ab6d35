//! Lazy paged iteration over an instance's chunks.

use std::collections::VecDeque;

use batchgate_core::{JobInstanceId, WorkChunk};

use super::{ChunkCursor, ChunkStore, ChunkStoreError};

/// Default number of chunks fetched per page.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Lazy, restartable sequence over all chunks of one job instance.
///
/// Pages are fetched on demand in canonical order. After a store error the
/// error is yielded once and iteration ends; [`rewind`] starts over from the
/// first chunk.
///
/// [`rewind`]: ChunkIter::rewind
pub struct ChunkIter<'a, S: ?Sized> {
    store: &'a S,
    instance: JobInstanceId,
    include_data: bool,
    page_size: usize,
    buffer: VecDeque<WorkChunk>,
    cursor: Option<ChunkCursor>,
    exhausted: bool,
}

impl<'a, S> ChunkIter<'a, S>
where
    S: ChunkStore + ?Sized,
{
    pub fn new(store: &'a S, instance: JobInstanceId, include_data: bool, page_size: usize) -> Self {
        Self {
            store,
            instance,
            include_data,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Restart from the first chunk.
    pub fn rewind(&mut self) {
        self.buffer.clear();
        self.cursor = None;
        self.exhausted = false;
    }

    fn fill(&mut self) -> Result<(), ChunkStoreError> {
        let page = self.store.fetch_chunk_page(
            self.instance,
            self.include_data,
            self.cursor.as_ref(),
            self.page_size,
        )?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(ChunkCursor::of(last));
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<S> Iterator for ChunkIter<'_, S>
where
    S: ChunkStore + ?Sized,
{
    type Item = Result<WorkChunk, ChunkStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchgate_core::{ChunkId, NewWorkChunk, StepId, WorkChunkStatus};

    use crate::definition::JobDefinitionKey;
    use crate::instance::JobInstance;
    use crate::store::InMemoryChunkStore;

    fn seeded(per_step: u32) -> (InMemoryChunkStore, JobInstanceId) {
        let store = InMemoryChunkStore::new();
        let instance = store
            .create_instance(JobInstance::new(JobDefinitionKey::new("scan", 1)))
            .unwrap();
        // written out of order so the iterator has to sort
        for sequence in (0..per_step).rev() {
            for (ordinal, name) in [(1, "load"), (0, "extract")] {
                store
                    .create_chunk(NewWorkChunk {
                        id: ChunkId::new(),
                        job_instance_id: instance,
                        target_step_id: StepId::parse(name).unwrap(),
                        step_ordinal: ordinal,
                        sequence,
                        parent_chunk_id: None,
                        data: serde_json::json!({ "sequence": sequence }),
                        initial_status: WorkChunkStatus::Ready,
                    })
                    .unwrap();
            }
        }
        (store, instance)
    }

    fn keys(iter: impl Iterator<Item = Result<WorkChunk, ChunkStoreError>>) -> Vec<(u32, u32)> {
        iter.map(|c| c.unwrap())
            .map(|c| (c.step_ordinal, c.sequence))
            .collect()
    }

    #[test]
    fn pages_through_every_chunk_in_order() {
        let (store, instance) = seeded(3);
        let iter = ChunkIter::new(&store, instance, false, 2);
        assert_eq!(
            keys(iter),
            vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]
        );
    }

    #[test]
    fn payload_is_only_loaded_on_request() {
        let (store, instance) = seeded(1);
        assert!(ChunkIter::new(&store, instance, false, 10).all(|c| c.unwrap().data.is_none()));
        assert!(ChunkIter::new(&store, instance, true, 10).all(|c| c.unwrap().data.is_some()));
    }

    #[test]
    fn rewind_starts_over() {
        let (store, instance) = seeded(2);
        let mut iter = ChunkIter::new(&store, instance, false, 1);
        let first: Vec<_> = iter.by_ref().take(3).map(|c| c.unwrap().id).collect();
        iter.rewind();
        let again: Vec<_> = iter.take(3).map(|c| c.unwrap().id).collect();
        assert_eq!(first, again);
    }

    #[test]
    fn unknown_instance_yields_nothing() {
        let (store, _) = seeded(2);
        assert_eq!(ChunkIter::new(&store, JobInstanceId::new(), false, 4).count(), 0);
    }
}
