//! Gated batch job execution engine.
//!
//! A job definition declares ordered steps. Each step's work is split into
//! work chunks that move through a small state machine:
//!
//! ```text
//! GATE_WAITING → READY → QUEUED → IN_PROGRESS → COMPLETED
//!                  ↑                    ├──────→ FAILED
//!                  └──── ERRORED ←──────┘
//! ```
//!
//! In a gated job the chunks of step N wait until every chunk of step N-1 is
//! done. The [`MaintenanceRunner`] opens gates and dispatches `READY` chunks
//! through the [`EnqueueGateway`]; workers claim and finish chunks through the
//! [`WorkChunkCoordinator`]. Every status change is a compare-and-swap in the
//! [`ChunkStore`].

pub mod config;
pub mod coordinator;
pub mod creation;
pub mod definition;
pub mod engine;
pub mod error;
pub mod fixture;
pub mod gate;
pub mod gateway;
pub mod hierarchy;
pub mod instance;
pub mod maintenance;
pub mod processor;
pub mod retry;
pub mod service;
pub mod store;
pub mod worker;

pub use config::{EngineConfig, MaintenanceConfig};
pub use coordinator::{ChunkOutcome, CompletionOutcome, WorkChunkCompletionEvent, WorkChunkCoordinator};
pub use creation::ChunkCreator;
pub use definition::{JobDefinition, JobDefinitionKey, JobDefinitionRegistry, StepDescriptor};
pub use engine::{BatchEngine, InMemoryEngine};
pub use error::{EngineError, EngineResult};
pub use gate::{FailedChunkPolicy, GateBlock, GatePolicy, GateVerdict, StepTally, ZeroChunkStepPolicy};
pub use gateway::{EnqueueGateway, EnqueueOutcome};
pub use hierarchy::{BatchNode, ChunkBatch};
pub use instance::{JobInstance, JobInstanceStatus};
pub use maintenance::{BlockedGate, MaintenanceReport, MaintenanceRunner};
pub use processor::{ChunkSink, StepOutcome, StepProcessor};
pub use retry::{BackoffStrategy, RequeueDecision, RequeuePolicy, RetryPolicy};
pub use service::{MaintenanceHandle, MaintenanceService, MaintenanceStats, SweepSummary};
pub use store::{ChunkCursor, ChunkIter, ChunkStore, ChunkStoreError, InMemoryChunkStore};
#[cfg(feature = "postgres")]
pub use store::PostgresChunkStore;
pub use worker::{ChunkWorker, WorkResult, WorkerConfig, WorkerHandle, WorkerStats};
