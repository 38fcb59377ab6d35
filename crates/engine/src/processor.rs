//! Step processor capability.
//!
//! Business logic for a step is plugged in through [`StepProcessor`], resolved
//! from the job definition's step table rather than discovered at dispatch
//! time.

use serde_json::Value as JsonValue;

use batchgate_core::{RecordCounts, WorkChunk};

/// Outcome a processor reports for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success(RecordCounts),
    /// Transient failure; the chunk becomes `ERRORED` and may be requeued.
    Retryable { error: String, records: RecordCounts },
    /// Permanent failure; the chunk becomes `FAILED`.
    Fatal { error: String, records: RecordCounts },
}

impl StepOutcome {
    pub fn success(processed: u64, errored: u64) -> Self {
        Self::Success(RecordCounts::new(processed, errored))
    }

    pub fn retryable(error: impl Into<String>) -> Self {
        Self::Retryable {
            error: error.into(),
            records: RecordCounts::default(),
        }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        Self::Fatal {
            error: error.into(),
            records: RecordCounts::default(),
        }
    }
}

/// Collects the payloads a processor emits for the next step.
#[derive(Debug, Default)]
pub struct ChunkSink {
    outputs: Vec<JsonValue>,
}

impl ChunkSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit one chunk payload for the step after the chunk's own step.
    pub fn emit(&mut self, data: JsonValue) {
        self.outputs.push(data);
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn into_outputs(self) -> Vec<JsonValue> {
        self.outputs
    }
}

/// Processes the payload of a chunk targeting one step.
pub trait StepProcessor: Send + Sync {
    fn process(&self, chunk: &WorkChunk, sink: &mut ChunkSink) -> StepOutcome;
}

impl<F> StepProcessor for F
where
    F: Fn(&WorkChunk, &mut ChunkSink) -> StepOutcome + Send + Sync,
{
    fn process(&self, chunk: &WorkChunk, sink: &mut ChunkSink) -> StepOutcome {
        self(chunk, sink)
    }
}
