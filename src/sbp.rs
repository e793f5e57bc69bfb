//! Layout and placement value types.
//!
//! An [`SbpParallel`] describes how one logical value is distributed over the
//! devices of a [`ParallelDesc`] grid: split along a tensor axis, broadcast
//! whole, or held as partial sums that add up to the logical value. An
//! [`SbpSignature`] collects one layout per argument slot of an operator.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Distribution layout of a single value over a device grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SbpParallel {
    /// Sharded along `axis`; each rank holds one contiguous slice.
    Split { axis: u32 },
    /// Every rank holds the full value.
    Broadcast,
    /// Every rank holds a partial term; the logical value is their sum.
    PartialSum,
}

impl SbpParallel {
    pub fn split(axis: u32) -> Self {
        SbpParallel::Split { axis }
    }

    pub fn is_split(&self) -> bool {
        matches!(self, SbpParallel::Split { .. })
    }
}

impl fmt::Display for SbpParallel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SbpParallel::Split { axis } => write!(f, "S({axis})"),
            SbpParallel::Broadcast => write!(f, "B"),
            SbpParallel::PartialSum => write!(f, "P"),
        }
    }
}

/// Per-operator layout table: argument name to one layout per slot.
///
/// Input and output arguments share one namespace, so a well-formed operator
/// never declares the same name on both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbpSignature {
    args: BTreeMap<String, Vec<SbpParallel>>,
}

impl SbpSignature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion of all slots of one argument.
    pub fn with_arg(mut self, arg: impl Into<String>, sbps: Vec<SbpParallel>) -> Self {
        self.args.insert(arg.into(), sbps);
        self
    }

    /// Inserts or replaces all slots of one argument.
    pub fn set_arg(&mut self, arg: impl Into<String>, sbps: Vec<SbpParallel>) {
        self.args.insert(arg.into(), sbps);
    }

    /// Layout of slot `index` of argument `arg`, if declared.
    pub fn sbp(&self, arg: &str, index: u32) -> Option<&SbpParallel> {
        self.args.get(arg)?.get(index as usize)
    }

    /// Number of slots declared for `arg`, zero if absent.
    pub fn slot_count(&self, arg: &str) -> usize {
        self.args.get(arg).map(Vec::len).unwrap_or(0)
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.contains_key(arg)
    }

    /// Declared arguments with their per-slot layouts, in name order.
    pub fn args(&self) -> impl Iterator<Item = (&str, &[SbpParallel])> {
        self.args.iter().map(|(name, sbps)| (name.as_str(), sbps.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

impl fmt::Display for SbpSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (arg, sbps) in &self.args {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{arg}=[")?;
            for (i, sbp) in sbps.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{sbp}")?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// Kind of device a placement runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceTag {
    Cpu,
    Cuda,
}

impl fmt::Display for DeviceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceTag::Cpu => write!(f, "cpu"),
            DeviceTag::Cuda => write!(f, "cuda"),
        }
    }
}

/// One participating device, addressed by machine and local device ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RankId {
    pub machine: u32,
    pub device: u32,
}

impl RankId {
    pub fn new(machine: u32, device: u32) -> Self {
        Self { machine, device }
    }
}

impl fmt::Display for RankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.machine, self.device)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParallelDescError {
    #[error("parallel desc has no ranks")]
    EmptyRankSet,
    #[error("hierarchy {hierarchy:?} covers {expected} ranks but {found} were given")]
    HierarchyMismatch {
        hierarchy: Vec<u32>,
        expected: usize,
        found: usize,
    },
    #[error("rank {rank} listed more than once")]
    DuplicateRank { rank: RankId },
}

/// Placement of one operator: which devices run it and how they form a grid.
///
/// Layout comparisons between operators are only meaningful when their
/// placements are equal, and equality is structural: same device tag, same
/// ranks in the same order, same hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParallelDesc {
    device_tag: DeviceTag,
    ranks: Vec<RankId>,
    hierarchy: Vec<u32>,
}

impl ParallelDesc {
    /// Builds a placement, checking that the grid shape covers the rank list
    /// exactly and that no rank repeats.
    pub fn new(
        device_tag: DeviceTag,
        ranks: Vec<RankId>,
        hierarchy: Vec<u32>,
    ) -> Result<Self, ParallelDescError> {
        if ranks.is_empty() {
            return Err(ParallelDescError::EmptyRankSet);
        }
        let expected: usize = hierarchy.iter().map(|d| *d as usize).product();
        if expected != ranks.len() {
            return Err(ParallelDescError::HierarchyMismatch {
                hierarchy,
                expected,
                found: ranks.len(),
            });
        }
        let mut seen = ranks.clone();
        seen.sort_unstable();
        for pair in seen.windows(2) {
            if pair[0] == pair[1] {
                return Err(ParallelDescError::DuplicateRank { rank: pair[0] });
            }
        }
        Ok(Self {
            device_tag,
            ranks,
            hierarchy,
        })
    }

    /// Single-device placement.
    pub fn single(device_tag: DeviceTag, machine: u32, device: u32) -> Self {
        Self {
            device_tag,
            ranks: vec![RankId::new(machine, device)],
            hierarchy: vec![1],
        }
    }

    /// One machine, devices `0..device_count`, flat hierarchy.
    pub fn linear(device_tag: DeviceTag, machine: u32, device_count: u32) -> Self {
        let ranks = (0..device_count.max(1))
            .map(|device| RankId::new(machine, device))
            .collect::<Vec<_>>();
        let hierarchy = vec![ranks.len() as u32];
        Self {
            device_tag,
            ranks,
            hierarchy,
        }
    }

    pub fn device_tag(&self) -> DeviceTag {
        self.device_tag
    }

    pub fn ranks(&self) -> &[RankId] {
        &self.ranks
    }

    pub fn hierarchy(&self) -> &[u32] {
        &self.hierarchy
    }

    pub fn rank_count(&self) -> usize {
        self.ranks.len()
    }
}

impl fmt::Display for ParallelDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.device_tag)?;
        for (i, rank) in self.ranks.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{rank}")?;
        }
        write!(f, "] grid ")?;
        for (i, dim) in self.hierarchy.iter().enumerate() {
            if i > 0 {
                write!(f, "x")?;
            }
            write!(f, "{dim}")?;
        }
        Ok(())
    }
}
