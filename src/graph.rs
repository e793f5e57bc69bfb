//! Immutable operator-graph snapshot.
//!
//! An [`OpGraph`] borrows a [`Job`] and derives everything passes query:
//! dense node ids in operator insertion order, a name index, data edges
//! grouped per (producer, consumer) pair, and the control-dependency closure.
//! The borrow keeps the job frozen for the snapshot's lifetime; committing
//! edits requires dropping the snapshot first.

use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;
use thiserror::Error;

use crate::job::{Job, Lbi, OperatorConf};
use crate::sbp::{ParallelDesc, SbpParallel, SbpSignature};
use crate::topology::{self, JobTopologyError};

/// Dense node handle, valid only for the snapshot that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// All dataflow between one producer and one consumer.
#[derive(Debug, Clone)]
pub struct OpEdge {
    pub src: NodeId,
    pub dst: NodeId,
    /// Distinct values flowing along this edge, in first-reference order.
    pub lbis: SmallVec<[Lbi; 2]>,
}

impl OpEdge {
    pub fn carries(&self, lbi: &Lbi) -> bool {
        self.lbis.iter().any(|carried| carried == lbi)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutQueryError {
    #[error("operator `{op_name}` does not reference value `{lbi}`")]
    UnreferencedValue { op_name: String, lbi: Lbi },
    #[error("operator `{op_name}` has no layout for slot {index} of `{arg}`")]
    MissingLayout {
        op_name: String,
        arg: String,
        index: u32,
    },
    #[error("operator `{op_name}` observes value `{lbi}` under conflicting layouts")]
    AmbiguousLayout { op_name: String, lbi: Lbi },
}

/// One operator as seen by a snapshot: its record, placement, and signature.
#[derive(Debug)]
pub struct OpNode<'j> {
    conf: &'j OperatorConf,
    parallel: &'j ParallelDesc,
    signature: &'j SbpSignature,
}

impl<'j> OpNode<'j> {
    pub fn name(&self) -> &'j str {
        self.conf.name.as_str()
    }

    pub fn type_name(&self) -> &'j str {
        self.conf.type_name.as_str()
    }

    pub fn conf(&self) -> &'j OperatorConf {
        self.conf
    }

    pub fn parallel_desc(&self) -> &'j ParallelDesc {
        self.parallel
    }

    pub fn sbp_signature(&self) -> &'j SbpSignature {
        self.signature
    }

    /// Layout this operator declares for a value it produces.
    pub fn produced_sbp(&self, lbi: &Lbi) -> Result<SbpParallel, LayoutQueryError> {
        let declared = lbi.op_name == self.conf.name
            && self
                .conf
                .outputs
                .get(&lbi.arg)
                .is_some_and(|slot_count| lbi.index < *slot_count);
        if !declared {
            return Err(LayoutQueryError::UnreferencedValue {
                op_name: self.conf.name.clone(),
                lbi: lbi.clone(),
            });
        }
        self.signature
            .sbp(&lbi.arg, lbi.index)
            .copied()
            .ok_or_else(|| LayoutQueryError::MissingLayout {
                op_name: self.conf.name.clone(),
                arg: lbi.arg.clone(),
                index: lbi.index,
            })
    }

    /// Layout this operator observes for a value it consumes. When several
    /// input slots consume the same value they must agree, otherwise the
    /// answer is [`LayoutQueryError::AmbiguousLayout`].
    pub fn observed_sbp(&self, lbi: &Lbi) -> Result<SbpParallel, LayoutQueryError> {
        let mut found: Option<SbpParallel> = None;
        for (arg, index, slot) in self.conf.input_slots() {
            if slot != lbi {
                continue;
            }
            let sbp = self.signature.sbp(arg, index).copied().ok_or_else(|| {
                LayoutQueryError::MissingLayout {
                    op_name: self.conf.name.clone(),
                    arg: arg.to_string(),
                    index,
                }
            })?;
            match found {
                None => found = Some(sbp),
                Some(prev) if prev == sbp => {}
                Some(_) => {
                    return Err(LayoutQueryError::AmbiguousLayout {
                        op_name: self.conf.name.clone(),
                        lbi: lbi.clone(),
                    });
                }
            }
        }
        found.ok_or_else(|| LayoutQueryError::UnreferencedValue {
            op_name: self.conf.name.clone(),
            lbi: lbi.clone(),
        })
    }
}

#[derive(Debug)]
pub struct OpGraph<'j> {
    job: &'j Job,
    nodes: Vec<OpNode<'j>>,
    by_name: HashMap<&'j str, NodeId>,
    edges: Vec<OpEdge>,
    in_of: Vec<SmallVec<[u32; 4]>>,
    out_of: Vec<SmallVec<[u32; 4]>>,
    ctrl_targets: HashSet<&'j str>,
}

impl<'j> OpGraph<'j> {
    /// Validates the job and derives the snapshot.
    pub fn new(job: &'j Job) -> Result<Self, JobTopologyError> {
        topology::validate_job(job)?;

        let mut nodes = Vec::with_capacity(job.op_count());
        let mut by_name = HashMap::with_capacity(job.op_count());
        for (index, conf) in job.ops().iter().enumerate() {
            let parallel = job.parallel_desc(&conf.name).ok_or_else(|| {
                JobTopologyError::MissingPlacement {
                    op_name: conf.name.clone(),
                }
            })?;
            let signature = job.sbp_signature(&conf.name).ok_or_else(|| {
                JobTopologyError::MissingSignature {
                    op_name: conf.name.clone(),
                }
            })?;
            by_name.insert(conf.name.as_str(), NodeId(index as u32));
            nodes.push(OpNode {
                conf,
                parallel,
                signature,
            });
        }

        let mut edges: Vec<OpEdge> = Vec::new();
        let mut in_of: Vec<SmallVec<[u32; 4]>> = vec![SmallVec::new(); nodes.len()];
        let mut out_of: Vec<SmallVec<[u32; 4]>> = vec![SmallVec::new(); nodes.len()];
        let mut edge_ids: HashMap<(u32, u32), u32> = HashMap::new();
        for (index, conf) in job.ops().iter().enumerate() {
            let dst = NodeId(index as u32);
            for (_, _, lbi) in conf.input_slots() {
                let src = by_name.get(lbi.op_name.as_str()).copied().ok_or_else(|| {
                    JobTopologyError::DanglingInput {
                        op_name: conf.name.clone(),
                        lbi: lbi.clone(),
                    }
                })?;
                let edge_id = *edge_ids.entry((src.0, dst.0)).or_insert_with(|| {
                    let id = edges.len() as u32;
                    edges.push(OpEdge {
                        src,
                        dst,
                        lbis: SmallVec::new(),
                    });
                    out_of[src.index()].push(id);
                    in_of[dst.index()].push(id);
                    id
                });
                let edge = &mut edges[edge_id as usize];
                if !edge.carries(lbi) {
                    edge.lbis.push(lbi.clone());
                }
            }
        }

        let mut ctrl_targets = HashSet::new();
        for conf in job.ops() {
            for ctrl in &conf.ctrl_in_op_names {
                ctrl_targets.insert(ctrl.as_str());
            }
        }

        Ok(Self {
            job,
            nodes,
            by_name,
            edges,
            in_of,
            out_of,
            ctrl_targets,
        })
    }

    pub fn job(&self) -> &'j Job {
        self.job
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes in operator insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &OpNode<'j>)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (NodeId(index as u32), node))
    }

    pub fn node(&self, id: NodeId) -> &OpNode<'j> {
        &self.nodes[id.index()]
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn in_edges(&self, id: NodeId) -> impl Iterator<Item = &OpEdge> + '_ {
        self.in_of[id.index()]
            .iter()
            .map(move |&edge_id| &self.edges[edge_id as usize])
    }

    pub fn out_edges(&self, id: NodeId) -> impl Iterator<Item = &OpEdge> + '_ {
        self.out_of[id.index()]
            .iter()
            .map(move |&edge_id| &self.edges[edge_id as usize])
    }

    pub fn in_degree(&self, id: NodeId) -> usize {
        self.in_of[id.index()].len()
    }

    pub fn out_degree(&self, id: NodeId) -> usize {
        self.out_of[id.index()].len()
    }

    /// The single incoming edge, or `None` when in-degree differs from one.
    pub fn sole_in_edge(&self, id: NodeId) -> Option<&OpEdge> {
        match self.in_of[id.index()].as_slice() {
            [edge_id] => Some(&self.edges[*edge_id as usize]),
            _ => None,
        }
    }

    /// Producer node of a value, when the value exists in this snapshot.
    pub fn producer_of(&self, lbi: &Lbi) -> Option<NodeId> {
        let id = self.node_by_name(&lbi.op_name)?;
        let declared = self.nodes[id.index()]
            .conf
            .outputs
            .get(&lbi.arg)
            .is_some_and(|slot_count| lbi.index < *slot_count);
        declared.then_some(id)
    }

    /// Whether the operator declares control predecessors or is one.
    pub fn has_ctrl_links(&self, id: NodeId) -> bool {
        let node = &self.nodes[id.index()];
        !node.conf.ctrl_in_op_names.is_empty() || self.ctrl_targets.contains(node.name())
    }
}
