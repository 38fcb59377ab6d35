//! Hierarchical chunk batches emitted by producers.
//!
//! A producer that expands one piece of work into a tree of chunks (a parent
//! and the children derived from it) describes the tree as a [`ChunkBatch`]:
//! nodes keyed by a producer-chosen string, each optionally naming its parent
//! node. The batch is validated as a whole before anything is written; a
//! parent chain that loops back on itself is a structural error.

use std::collections::{HashMap, HashSet};

use serde_json::Value as JsonValue;

use batchgate_core::{ChunkId, DomainError, DomainResult, StepId};

/// One chunk of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNode {
    pub key: String,
    pub step: StepId,
    /// Key of the parent node within the same batch.
    pub parent: Option<String>,
    pub data: JsonValue,
}

/// A set of chunks written together, with parent references.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkBatch {
    /// Chunk whose processing produced the batch. Root nodes get it as their
    /// parent chunk.
    pub origin: Option<ChunkId>,
    nodes: Vec<BatchNode>,
}

impl ChunkBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_origin(origin: ChunkId) -> Self {
        Self {
            origin: Some(origin),
            nodes: Vec::new(),
        }
    }

    /// Add a root node.
    pub fn root(self, key: impl Into<String>, step: StepId, data: JsonValue) -> Self {
        self.node(key, step, None, data)
    }

    /// Add a node under `parent`.
    pub fn child(
        self,
        key: impl Into<String>,
        parent: impl Into<String>,
        step: StepId,
        data: JsonValue,
    ) -> Self {
        self.node(key, step, Some(parent.into()), data)
    }

    pub fn node(
        mut self,
        key: impl Into<String>,
        step: StepId,
        parent: Option<String>,
        data: JsonValue,
    ) -> Self {
        self.push(BatchNode {
            key: key.into(),
            step,
            parent,
            data,
        });
        self
    }

    pub fn push(&mut self, node: BatchNode) {
        self.nodes.push(node);
    }

    pub fn nodes(&self) -> &[BatchNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check keys and parent references and return node indices with every
    /// parent ahead of its children. Declaration order is kept otherwise.
    pub fn plan(&self) -> DomainResult<Vec<usize>> {
        let mut index = HashMap::with_capacity(self.nodes.len());
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.key.trim().is_empty() {
                return Err(DomainError::validation("batch node key must not be empty"));
            }
            if index.insert(node.key.as_str(), idx).is_some() {
                return Err(DomainError::validation(format!(
                    "duplicate batch node key: {}",
                    node.key
                )));
            }
        }

        let mut depths = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut visited = HashSet::new();
            visited.insert(node.key.as_str());
            let mut depth = 0usize;
            let mut parent = node.parent.as_deref();
            while let Some(key) = parent {
                let Some(&idx) = index.get(key) else {
                    return Err(DomainError::validation(format!(
                        "batch node {} references unknown parent {key}",
                        node.key
                    )));
                };
                if !visited.insert(key) {
                    return Err(DomainError::cyclic(format!(
                        "batch node {} is its own ancestor via {key}",
                        node.key
                    )));
                }
                depth += 1;
                parent = self.nodes[idx].parent.as_deref();
            }
            depths.push(depth);
        }

        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by_key(|&idx| depths[idx]);
        Ok(order)
    }
}
