//! Pass interface, registry, and pipeline.

pub mod fuse_accumulate;
pub mod pipeline;
pub mod prune_sbp_cast;

pub use fuse_accumulate::AccumulateFusionPass;
pub use pipeline::{standard_pipeline, PipelineBuilder, RewritePipeline, Step};
pub use prune_sbp_cast::PruneSbpCastPass;

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::builder::{CommitSummary, JobBuilder};
use crate::config::JobConfig;
use crate::graph::OpGraph;

/// One rewrite over a job.
///
/// `apply` reads a frozen snapshot and stages edits; it must not assume its
/// edits are visible before the pipeline commits them. Non-matching graphs are
/// not errors: stage nothing and return `Ok`.
pub trait JobPass: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_enabled(&self, _config: &JobConfig) -> bool {
        true
    }

    fn apply(&self, graph: &OpGraph<'_>, builder: &mut JobBuilder) -> anyhow::Result<()>;
}

/// Accumulated outcome of a pipeline run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RewriteStats {
    pub changed: bool,
    pub passes_applied: usize,
    pub ops_added: usize,
    pub ops_replaced: usize,
    pub ops_deleted: usize,
    pub signatures_overridden: usize,
}

impl RewriteStats {
    pub fn merge(self, other: Self) -> Self {
        Self {
            changed: self.changed || other.changed,
            passes_applied: self.passes_applied + other.passes_applied,
            ops_added: self.ops_added + other.ops_added,
            ops_replaced: self.ops_replaced + other.ops_replaced,
            ops_deleted: self.ops_deleted + other.ops_deleted,
            signatures_overridden: self.signatures_overridden + other.signatures_overridden,
        }
    }

    pub(crate) fn from_commit(summary: &CommitSummary) -> Self {
        Self {
            changed: summary.changed(),
            passes_applied: 1,
            ops_added: summary.ops_added,
            ops_replaced: summary.ops_replaced,
            ops_deleted: summary.ops_deleted,
            signatures_overridden: summary.signatures_overridden,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("pass `{name}` is already registered")]
    DuplicatePass { name: String },
}

/// Named, ordered pass collection. Registration is explicit and a duplicate
/// name fails at setup.
#[derive(Default)]
pub struct PassRegistry {
    passes: Vec<Arc<dyn JobPass>>,
    names: HashSet<&'static str>,
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pass: Arc<dyn JobPass>) -> Result<(), RegistryError> {
        if !self.names.insert(pass.name()) {
            return Err(RegistryError::DuplicatePass {
                name: pass.name().to_string(),
            });
        }
        self.passes.push(pass);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobPass>> {
        self.passes.iter().find(|pass| pass.name() == name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Registered passes in registration order.
    pub fn passes(&self) -> &[Arc<dyn JobPass>] {
        &self.passes
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.passes.iter().map(|pass| pass.name())
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

/// The two shipped passes in their standard order.
pub fn standard_registry() -> Result<PassRegistry, RegistryError> {
    let mut registry = PassRegistry::new();
    registry.register(Arc::new(AccumulateFusionPass::default()))?;
    registry.register(Arc::new(PruneSbpCastPass::default()))?;
    Ok(registry)
}
