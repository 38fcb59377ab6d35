//! Job definitions and the registry that resolves them.
//!
//! A definition is an ordered step table plus the gating flag. Each step
//! carries its ordinal and, optionally, the processor that runs its chunks.
//! The table is built and validated once; nothing is looked up by reflection
//! at dispatch time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use batchgate_core::{DomainError, DomainResult, StepId};

use crate::error::{EngineError, EngineResult};
use crate::processor::StepProcessor;

/// Name/version identity of a job definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobDefinitionKey {
    pub name: String,
    pub version: u32,
}

impl JobDefinitionKey {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl core::fmt::Display for JobDefinitionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// One row of the step table.
#[derive(Clone)]
pub struct StepDescriptor {
    pub id: StepId,
    pub ordinal: u32,
    pub processor: Option<Arc<dyn StepProcessor>>,
}

impl core::fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("id", &self.id)
            .field("ordinal", &self.ordinal)
            .field("has_processor", &self.processor.is_some())
            .finish()
    }
}

/// Static description of a job: ordered steps and gating policy.
///
/// Immutable once built; share it through `Arc`.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    key: JobDefinitionKey,
    gated: bool,
    steps: Vec<StepDescriptor>,
    by_id: HashMap<StepId, usize>,
}

impl JobDefinition {
    pub fn builder(name: impl Into<String>, version: u32) -> JobDefinitionBuilder {
        JobDefinitionBuilder {
            key: JobDefinitionKey::new(name, version),
            gated: false,
            steps: Vec::new(),
        }
    }

    pub fn key(&self) -> &JobDefinitionKey {
        &self.key
    }

    pub fn is_gated(&self) -> bool {
        self.gated
    }

    pub fn steps(&self) -> &[StepDescriptor] {
        &self.steps
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn first_step(&self) -> &StepDescriptor {
        // The builder rejects empty step tables.
        &self.steps[0]
    }

    pub fn step(&self, id: &StepId) -> Option<&StepDescriptor> {
        self.by_id.get(id).map(|&idx| &self.steps[idx])
    }

    /// Look up a step, failing with a structural error if it is not declared.
    pub fn require_step(&self, id: &StepId) -> DomainResult<&StepDescriptor> {
        self.step(id)
            .ok_or_else(|| DomainError::unknown_step(format!("{id} (job {})", self.key)))
    }

    pub fn step_at(&self, ordinal: u32) -> Option<&StepDescriptor> {
        self.steps.get(ordinal as usize)
    }

    pub fn previous_step(&self, ordinal: u32) -> Option<&StepDescriptor> {
        ordinal.checked_sub(1).and_then(|prev| self.step_at(prev))
    }

    pub fn next_step(&self, ordinal: u32) -> Option<&StepDescriptor> {
        self.step_at(ordinal + 1)
    }

    pub fn is_first_step(&self, id: &StepId) -> bool {
        self.first_step().id == *id
    }
}

pub struct JobDefinitionBuilder {
    key: JobDefinitionKey,
    gated: bool,
    steps: Vec<(String, Option<Arc<dyn StepProcessor>>)>,
}

impl JobDefinitionBuilder {
    pub fn gated(mut self, gated: bool) -> Self {
        self.gated = gated;
        self
    }

    /// Append a step without a processor (chunks are handled elsewhere).
    pub fn step(mut self, id: impl Into<String>) -> Self {
        self.steps.push((id.into(), None));
        self
    }

    /// Append a step whose chunks are run by `processor`.
    pub fn step_with_processor(
        mut self,
        id: impl Into<String>,
        processor: impl StepProcessor + 'static,
    ) -> Self {
        self.steps.push((id.into(), Some(Arc::new(processor))));
        self
    }

    pub fn build(self) -> DomainResult<JobDefinition> {
        if self.key.name.trim().is_empty() {
            return Err(DomainError::validation("job definition name must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(DomainError::validation(format!(
                "job definition {} declares no steps",
                self.key
            )));
        }

        let mut seen = HashSet::new();
        let mut steps = Vec::with_capacity(self.steps.len());
        let mut by_id = HashMap::with_capacity(self.steps.len());
        for (idx, (raw, processor)) in self.steps.into_iter().enumerate() {
            let id = StepId::parse(raw)?;
            if !seen.insert(id.clone()) {
                return Err(DomainError::validation(format!(
                    "duplicate step id {id} in job definition {}",
                    self.key
                )));
            }
            let ordinal = u32::try_from(idx)
                .map_err(|_| DomainError::validation("too many steps in job definition"))?;
            by_id.insert(id.clone(), idx);
            steps.push(StepDescriptor {
                id,
                ordinal,
                processor,
            });
        }

        Ok(JobDefinition {
            key: self.key,
            gated: self.gated,
            steps,
            by_id,
        })
    }
}

/// Registry of job definitions by name and version.
#[derive(Debug, Default)]
pub struct JobDefinitionRegistry {
    definitions: RwLock<HashMap<JobDefinitionKey, Arc<JobDefinition>>>,
}

impl JobDefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. Re-registering the same key is rejected.
    pub fn register(&self, definition: JobDefinition) -> EngineResult<Arc<JobDefinition>> {
        let mut definitions = self
            .definitions
            .write()
            .map_err(|_| EngineError::LockPoisoned("job definition registry"))?;
        if definitions.contains_key(definition.key()) {
            return Err(EngineError::DuplicateDefinition(definition.key().clone()));
        }
        let definition = Arc::new(definition);
        definitions.insert(definition.key().clone(), definition.clone());
        Ok(definition)
    }

    pub fn get(&self, key: &JobDefinitionKey) -> EngineResult<Option<Arc<JobDefinition>>> {
        let definitions = self
            .definitions
            .read()
            .map_err(|_| EngineError::LockPoisoned("job definition registry"))?;
        Ok(definitions.get(key).cloned())
    }

    pub fn require(&self, key: &JobDefinitionKey) -> EngineResult<Arc<JobDefinition>> {
        self.get(key)?
            .ok_or_else(|| EngineError::UnknownJobDefinition(key.clone()))
    }

    /// Highest registered version of `name`.
    pub fn latest(&self, name: &str) -> EngineResult<Option<Arc<JobDefinition>>> {
        let definitions = self
            .definitions
            .read()
            .map_err(|_| EngineError::LockPoisoned("job definition registry"))?;
        Ok(definitions
            .values()
            .filter(|d| d.key().name == name)
            .max_by_key(|d| d.key().version)
            .cloned())
    }
}
