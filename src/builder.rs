//! Two-phase job editing.
//!
//! Passes never touch a [`Job`] directly: they stage insertions, whole-record
//! replacements, deletions, and signature overrides into a [`JobBuilder`] and
//! the pipeline commits the batch after the pass returns. Structural edits are
//! one-shot per operator name per builder; the second staging attempt for a
//! name is an [`EditError::EditConflict`]. Signature overrides are last-write
//! idempotent. `commit` applies everything to a scratch copy, re-validates,
//! and swaps the result in, so a failed commit leaves the job untouched.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use thiserror::Error;

use crate::job::{Job, OperatorConf};
use crate::sbp::{ParallelDesc, SbpSignature};
use crate::topology::JobTopologyError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    #[error("operator `{op_name}` already has a staged structural edit")]
    EditConflict { op_name: String },
    #[error("staged edit targets unknown operator `{op_name}`")]
    UnknownOp { op_name: String },
    #[error("staged insertion collides with existing operator `{op_name}`")]
    NameCollision { op_name: String },
    #[error("committed job failed integrity check: {0}")]
    Inconsistent(#[from] JobTopologyError),
}

/// What a commit changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub ops_added: usize,
    pub ops_replaced: usize,
    pub ops_deleted: usize,
    pub signatures_overridden: usize,
}

impl CommitSummary {
    pub fn changed(&self) -> bool {
        self.ops_added > 0
            || self.ops_replaced > 0
            || self.ops_deleted > 0
            || self.signatures_overridden > 0
    }
}

struct StagedOp {
    conf: OperatorConf,
    parallel: ParallelDesc,
    signature: SbpSignature,
}

#[derive(Default)]
pub struct JobBuilder {
    additions: Vec<StagedOp>,
    replacements: BTreeMap<String, OperatorConf>,
    deletions: BTreeSet<String>,
    overrides: BTreeMap<String, SbpSignature>,
    /// Names with a staged structural edit; enforces the one-shot rule.
    touched: HashSet<String>,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self, op_name: &str) -> Result<(), EditError> {
        if !self.touched.insert(op_name.to_string()) {
            return Err(EditError::EditConflict {
                op_name: op_name.to_string(),
            });
        }
        Ok(())
    }

    /// Stages insertion of a new operator with its placement and signature.
    pub fn add_op(
        &mut self,
        conf: OperatorConf,
        parallel: ParallelDesc,
        signature: SbpSignature,
    ) -> Result<(), EditError> {
        self.touch(&conf.name)?;
        self.additions.push(StagedOp {
            conf,
            parallel,
            signature,
        });
        Ok(())
    }

    /// Stages a whole-record replacement keyed by `conf.name`.
    pub fn replace_op_once(&mut self, conf: OperatorConf) -> Result<(), EditError> {
        self.touch(&conf.name)?;
        self.replacements.insert(conf.name.clone(), conf);
        Ok(())
    }

    /// Stages deletion of the named operators.
    pub fn delete_ops<I, S>(&mut self, names: I) -> Result<(), EditError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            self.touch(&name)?;
            self.deletions.insert(name);
        }
        Ok(())
    }

    /// Stages a layout-signature override; staging again for the same
    /// operator just keeps the newer signature.
    pub fn override_signature(&mut self, op_name: impl Into<String>, signature: SbpSignature) {
        self.overrides.insert(op_name.into(), signature);
    }

    pub fn has_edits(&self) -> bool {
        !self.additions.is_empty()
            || !self.replacements.is_empty()
            || !self.deletions.is_empty()
            || !self.overrides.is_empty()
    }

    /// Validates the edit set, applies it to a scratch copy, re-validates the
    /// result, and swaps it into `job`.
    pub fn commit(self, job: &mut Job) -> Result<CommitSummary, EditError> {
        for name in self.replacements.keys() {
            if !job.has_op(name) {
                return Err(EditError::UnknownOp {
                    op_name: name.clone(),
                });
            }
        }
        for name in &self.deletions {
            if !job.has_op(name) {
                return Err(EditError::UnknownOp {
                    op_name: name.clone(),
                });
            }
        }
        for staged in &self.additions {
            if job.has_op(&staged.conf.name) {
                return Err(EditError::NameCollision {
                    op_name: staged.conf.name.clone(),
                });
            }
        }
        for name in self.overrides.keys() {
            let survives = (job.has_op(name) && !self.deletions.contains(name))
                || self
                    .additions
                    .iter()
                    .any(|staged| &staged.conf.name == name);
            if !survives {
                return Err(EditError::UnknownOp {
                    op_name: name.clone(),
                });
            }
        }

        let mut next = job.clone();
        let summary = CommitSummary {
            ops_deleted: next.remove_op_records(&self.deletions),
            ops_replaced: self.replacements.len(),
            ops_added: self.additions.len(),
            signatures_overridden: self.overrides.len(),
        };
        for (_, conf) in self.replacements {
            // presence was checked above; deletions are disjoint by the one-shot rule
            let _ = next.replace_op_record(conf);
        }
        for staged in self.additions {
            next.insert_op_record(staged.conf, staged.parallel, staged.signature);
        }
        for (name, signature) in self.overrides {
            next.set_signature_record(name, signature);
        }
        next.validate()?;
        *job = next;
        Ok(summary)
    }
}
