//! Engine error model.
//!
//! Only structural and infrastructure failures live here. Expected races are
//! reported through return values (`Option`, rows updated, outcomes).

use thiserror::Error;

use batchgate_core::{ChunkId, DomainError, JobInstanceId};

use crate::definition::JobDefinitionKey;
use crate::store::ChunkStoreError;

/// Result type used by engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] ChunkStoreError),

    #[error("unknown job definition: {0}")]
    UnknownJobDefinition(JobDefinitionKey),

    #[error("job definition already registered: {0}")]
    DuplicateDefinition(JobDefinitionKey),

    #[error("job instance not found: {0}")]
    JobInstanceNotFound(JobInstanceId),

    #[error("work chunk not found: {0}")]
    ChunkNotFound(ChunkId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    #[error("failed to spawn {0} thread")]
    Spawn(String),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for data/programming errors the maintenance runner must not paper over.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Domain(_) | Self::UnknownJobDefinition(_) | Self::ChunkNotFound(_)
        )
    }
}
