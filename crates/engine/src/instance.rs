//! Job instances: one running execution of a job definition.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use batchgate_core::{JobInstanceId, StepId};

use crate::definition::JobDefinitionKey;

/// Status derived from an instance's chunks.
///
/// Only ever moves forward: `Created → Running → Completed`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobInstanceStatus {
    #[default]
    Created,
    Running,
    Completed,
}

impl JobInstanceStatus {
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Completed)
    }
}

impl core::fmt::Display for JobInstanceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let label = match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: JobInstanceId,
    pub definition: JobDefinitionKey,
    pub status: JobInstanceStatus,
    /// Set once any chunk of the instance ended `FAILED`.
    pub degraded: bool,
    /// Steps whose producers declared their chunk set complete.
    pub sealed_steps: BTreeSet<StepId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobInstance {
    pub fn new(definition: JobDefinitionKey) -> Self {
        let now = Utc::now();
        Self {
            id: JobInstanceId::new(),
            definition,
            status: JobInstanceStatus::Created,
            degraded: false,
            sealed_steps: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_sealed(&self, step: &StepId) -> bool {
        self.sealed_steps.contains(step)
    }

    /// Advance the status; backwards moves are ignored. Returns whether anything changed.
    pub fn advance(&mut self, status: JobInstanceStatus, degraded: bool) -> bool {
        let next = self.status.max(status);
        let degraded = self.degraded || degraded;
        if next == self.status && degraded == self.degraded {
            return false;
        }
        self.status = next;
        self.degraded = degraded;
        self.updated_at = Utc::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_never_moves_backwards() {
        let mut instance = JobInstance::new(JobDefinitionKey::new("import", 1));
        assert!(instance.advance(JobInstanceStatus::Running, false));
        assert!(!instance.advance(JobInstanceStatus::Created, false));
        assert_eq!(instance.status, JobInstanceStatus::Running);
    }

    #[test]
    fn degraded_is_sticky() {
        let mut instance = JobInstance::new(JobDefinitionKey::new("import", 1));
        assert!(instance.advance(JobInstanceStatus::Created, true));
        assert!(!instance.advance(JobInstanceStatus::Created, false));
        assert!(instance.degraded);
    }
}
