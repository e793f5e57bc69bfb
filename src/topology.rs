//! Job integrity checking.
//!
//! Shared by snapshot construction and commit: a job must pass
//! [`validate_job`] before a pass may read it and after every edit set is
//! applied.

use std::collections::HashMap;
use std::fmt;

use crate::job::{Job, Lbi, OperatorConf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTopologyError {
    DuplicateOpName {
        op_name: String,
    },
    /// `arg` is declared as both an input and an output of the operator.
    ArgNamespaceClash {
        op_name: String,
        arg: String,
    },
    /// An input references a value whose producer is not in the job.
    DanglingInput {
        op_name: String,
        lbi: Lbi,
    },
    /// The producer exists but does not declare the referenced output slot.
    MissingOutputSlot {
        op_name: String,
        lbi: Lbi,
    },
    DanglingCtrl {
        op_name: String,
        ctrl: String,
    },
    SelfCtrl {
        op_name: String,
    },
    MissingPlacement {
        op_name: String,
    },
    MissingSignature {
        op_name: String,
    },
    /// Signature entry missing, of the wrong slot count, or naming an
    /// undeclared argument.
    SignatureMismatch {
        op_name: String,
        arg: String,
    },
    /// A data-flow cycle passes through the operator.
    Cycle {
        op_name: String,
    },
}

impl fmt::Display for JobTopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobTopologyError::DuplicateOpName { op_name } => {
                write!(f, "operator name `{op_name}` appears more than once")
            }
            JobTopologyError::ArgNamespaceClash { op_name, arg } => write!(
                f,
                "operator `{op_name}` declares `{arg}` as both input and output"
            ),
            JobTopologyError::DanglingInput { op_name, lbi } => {
                write!(f, "operator `{op_name}` consumes `{lbi}` from a missing operator")
            }
            JobTopologyError::MissingOutputSlot { op_name, lbi } => write!(
                f,
                "operator `{op_name}` consumes `{lbi}` but the producer declares no such slot"
            ),
            JobTopologyError::DanglingCtrl { op_name, ctrl } => write!(
                f,
                "operator `{op_name}` lists missing operator `{ctrl}` as a control predecessor"
            ),
            JobTopologyError::SelfCtrl { op_name } => {
                write!(f, "operator `{op_name}` lists itself as a control predecessor")
            }
            JobTopologyError::MissingPlacement { op_name } => {
                write!(f, "operator `{op_name}` has no placement")
            }
            JobTopologyError::MissingSignature { op_name } => {
                write!(f, "operator `{op_name}` has no layout signature")
            }
            JobTopologyError::SignatureMismatch { op_name, arg } => write!(
                f,
                "layout signature of operator `{op_name}` does not match its `{arg}` argument"
            ),
            JobTopologyError::Cycle { op_name } => {
                write!(f, "data-flow cycle through operator `{op_name}`")
            }
        }
    }
}

impl std::error::Error for JobTopologyError {}

pub fn validate_job(job: &Job) -> Result<(), JobTopologyError> {
    let mut by_name: HashMap<&str, &OperatorConf> = HashMap::with_capacity(job.op_count());
    for op in job.ops() {
        if by_name.insert(op.name.as_str(), op).is_some() {
            return Err(JobTopologyError::DuplicateOpName {
                op_name: op.name.clone(),
            });
        }
    }

    for op in job.ops() {
        for arg in op.inputs.keys() {
            if op.outputs.contains_key(arg) {
                return Err(JobTopologyError::ArgNamespaceClash {
                    op_name: op.name.clone(),
                    arg: arg.clone(),
                });
            }
        }

        if job.parallel_desc(&op.name).is_none() {
            return Err(JobTopologyError::MissingPlacement {
                op_name: op.name.clone(),
            });
        }
        let signature = job.sbp_signature(&op.name).ok_or_else(|| {
            JobTopologyError::MissingSignature {
                op_name: op.name.clone(),
            }
        })?;

        for (arg, lbis) in &op.inputs {
            if signature.slot_count(arg) != lbis.len() {
                return Err(JobTopologyError::SignatureMismatch {
                    op_name: op.name.clone(),
                    arg: arg.clone(),
                });
            }
        }
        for (arg, slot_count) in &op.outputs {
            if signature.slot_count(arg) != *slot_count as usize {
                return Err(JobTopologyError::SignatureMismatch {
                    op_name: op.name.clone(),
                    arg: arg.clone(),
                });
            }
        }
        for (arg, _) in signature.args() {
            if !op.inputs.contains_key(arg) && !op.outputs.contains_key(arg) {
                return Err(JobTopologyError::SignatureMismatch {
                    op_name: op.name.clone(),
                    arg: arg.to_string(),
                });
            }
        }

        for (_, _, lbi) in op.input_slots() {
            let producer = by_name.get(lbi.op_name.as_str()).ok_or_else(|| {
                JobTopologyError::DanglingInput {
                    op_name: op.name.clone(),
                    lbi: lbi.clone(),
                }
            })?;
            let declared = producer
                .outputs
                .get(&lbi.arg)
                .is_some_and(|slot_count| lbi.index < *slot_count);
            if !declared {
                return Err(JobTopologyError::MissingOutputSlot {
                    op_name: op.name.clone(),
                    lbi: lbi.clone(),
                });
            }
        }

        for ctrl in &op.ctrl_in_op_names {
            if ctrl == &op.name {
                return Err(JobTopologyError::SelfCtrl {
                    op_name: op.name.clone(),
                });
            }
            if !by_name.contains_key(ctrl.as_str()) {
                return Err(JobTopologyError::DanglingCtrl {
                    op_name: op.name.clone(),
                    ctrl: ctrl.clone(),
                });
            }
        }
    }

    check_acyclic(job, &by_name)
}

/// Depth-first walk over data edges with an explicit stack; a back edge to an
/// in-progress operator is a cycle.
fn check_acyclic(
    job: &Job,
    by_name: &HashMap<&str, &OperatorConf>,
) -> Result<(), JobTopologyError> {
    let index_of: HashMap<&str, usize> = job
        .ops()
        .iter()
        .enumerate()
        .map(|(index, op)| (op.name.as_str(), index))
        .collect();
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); job.op_count()];
    for (consumer_index, op) in job.ops().iter().enumerate() {
        for (_, _, lbi) in op.input_slots() {
            // resolution was checked above
            if by_name.contains_key(lbi.op_name.as_str()) {
                let producer_index = index_of[lbi.op_name.as_str()];
                if !consumers[producer_index].contains(&consumer_index) {
                    consumers[producer_index].push(consumer_index);
                }
            }
        }
    }

    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;
    let mut mark = vec![WHITE; job.op_count()];
    for root in 0..job.op_count() {
        if mark[root] != WHITE {
            continue;
        }
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        mark[root] = GRAY;
        while let Some((node, cursor)) = stack.last_mut() {
            if let Some(&next) = consumers[*node].get(*cursor) {
                *cursor += 1;
                match mark[next] {
                    WHITE => {
                        mark[next] = GRAY;
                        stack.push((next, 0));
                    }
                    GRAY => {
                        return Err(JobTopologyError::Cycle {
                            op_name: job.ops()[next].name.clone(),
                        });
                    }
                    _ => {}
                }
            } else {
                mark[*node] = BLACK;
                stack.pop();
            }
        }
    }
    Ok(())
}
