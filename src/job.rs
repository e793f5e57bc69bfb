//! Serialized job model.
//!
//! A [`Job`] is the unit every rewrite pass operates on: a list of operator
//! records in insertion order, plus per-operator placement and layout
//! signatures keyed by operator name. Jobs round-trip through JSON and bincode
//! and render as an indented text dump for logs and tests.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::JobConfig;
use crate::sbp::{ParallelDesc, SbpSignature};
use crate::topology::{self, JobTopologyError};

pub const JOB_SPEC_VERSION: &str = "shardflow.job.v1";

fn default_spec_version() -> String {
    JOB_SPEC_VERSION.to_string()
}

/// Logical blob identifier: output slot `index` of output argument `arg` on
/// operator `op_name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lbi {
    pub op_name: String,
    pub arg: String,
    pub index: u32,
}

impl Lbi {
    pub fn new(op_name: impl Into<String>, arg: impl Into<String>, index: u32) -> Self {
        Self {
            op_name: op_name.into(),
            arg: arg.into(),
            index,
        }
    }
}

impl fmt::Display for Lbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}_{}", self.op_name, self.arg, self.index)
    }
}

/// Operator attribute payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    Sbp(crate::sbp::SbpParallel),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Str(v) => write!(f, "{v:?}"),
            AttrValue::IntList(v) => write!(f, "{v:?}"),
            AttrValue::Sbp(v) => write!(f, "{v}"),
        }
    }
}

/// One operator record.
///
/// `inputs` maps each input argument to the values it consumes, in slot order;
/// `outputs` maps each output argument to its slot count. `ctrl_in_op_names`
/// lists operators that must run first regardless of dataflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorConf {
    pub name: String,
    pub type_name: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Vec<Lbi>>,
    #[serde(default)]
    pub outputs: BTreeMap<String, u32>,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub ctrl_in_op_names: Vec<String>,
}

impl OperatorConf {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            attrs: BTreeMap::new(),
            ctrl_in_op_names: Vec::new(),
        }
    }

    pub fn with_input(mut self, arg: impl Into<String>, lbis: Vec<Lbi>) -> Self {
        self.inputs.insert(arg.into(), lbis);
        self
    }

    pub fn with_output(mut self, arg: impl Into<String>, slot_count: u32) -> Self {
        self.outputs.insert(arg.into(), slot_count);
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    pub fn with_ctrl_in(mut self, op_name: impl Into<String>) -> Self {
        self.ctrl_in_op_names.push(op_name.into());
        self
    }

    /// Value consumed at slot `index` of input argument `arg`.
    pub fn input(&self, arg: &str, index: u32) -> Option<&Lbi> {
        self.inputs.get(arg)?.get(index as usize)
    }

    /// Number of slots of input argument `arg`, zero if absent.
    pub fn input_len(&self, arg: &str) -> usize {
        self.inputs.get(arg).map(Vec::len).unwrap_or(0)
    }

    pub fn has_input_arg(&self, arg: &str) -> bool {
        self.inputs.contains_key(arg)
    }

    /// All input slots as `(arg, index, value)`, argument-name order.
    pub fn input_slots(&self) -> impl Iterator<Item = (&str, u32, &Lbi)> {
        self.inputs.iter().flat_map(|(arg, lbis)| {
            lbis.iter()
                .enumerate()
                .map(move |(index, lbi)| (arg.as_str(), index as u32, lbi))
        })
    }

    /// The value this operator produces at slot `index` of output `arg`, if
    /// that slot is declared.
    pub fn output_lbi(&self, arg: &str, index: u32) -> Option<Lbi> {
        let slot_count = *self.outputs.get(arg)?;
        if index < slot_count {
            Some(Lbi::new(self.name.clone(), arg, index))
        } else {
            None
        }
    }

    /// Every value this operator produces.
    pub fn produced_lbis(&self) -> impl Iterator<Item = Lbi> + '_ {
        self.outputs.iter().flat_map(move |(arg, slot_count)| {
            (0..*slot_count).map(move |index| Lbi::new(self.name.clone(), arg.clone(), index))
        })
    }

    /// Appends one slot to input argument `arg`, creating the argument if new.
    pub fn push_input(&mut self, arg: impl Into<String>, lbi: Lbi) {
        self.inputs.entry(arg.into()).or_default().push(lbi);
    }

    /// Replaces every input slot equal to `from` with `to`, returning how many
    /// slots changed.
    pub fn rewire_input(&mut self, from: &Lbi, to: &Lbi) -> usize {
        let mut replaced = 0;
        for lbis in self.inputs.values_mut() {
            for slot in lbis.iter_mut() {
                if slot == from {
                    *slot = to.clone();
                    replaced += 1;
                }
            }
        }
        replaced
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job already contains an operator named `{op_name}`")]
    DuplicateOp { op_name: String },
}

#[derive(Debug, Error)]
pub enum JobSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("job spec version '{found}' does not match expected '{expected}'")]
    SpecVersionMismatch {
        found: String,
        expected: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum JobIoError {
    #[error(transparent)]
    Serialization(#[from] JobSerdeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// A complete distributed-computation job.
///
/// Operator order is insertion order and is preserved by every rewrite;
/// placement and signature maps cover exactly the operator list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default = "default_spec_version")]
    pub spec_version: String,
    pub name: String,
    #[serde(default)]
    pub config: JobConfig,
    ops: Vec<OperatorConf>,
    placement: BTreeMap<String, ParallelDesc>,
    sbp_signatures: BTreeMap<String, SbpSignature>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            spec_version: JOB_SPEC_VERSION.to_string(),
            name: name.into(),
            config: JobConfig::default(),
            ops: Vec::new(),
            placement: BTreeMap::new(),
            sbp_signatures: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }

    /// Appends an operator with its placement and layout signature. Fails on a
    /// duplicate name.
    pub fn add_op(
        &mut self,
        conf: OperatorConf,
        parallel: ParallelDesc,
        signature: SbpSignature,
    ) -> Result<(), JobError> {
        if self.has_op(&conf.name) {
            return Err(JobError::DuplicateOp {
                op_name: conf.name.clone(),
            });
        }
        self.placement.insert(conf.name.clone(), parallel);
        self.sbp_signatures.insert(conf.name.clone(), signature);
        self.ops.push(conf);
        Ok(())
    }

    pub fn op(&self, name: &str) -> Option<&OperatorConf> {
        self.ops.iter().find(|op| op.name == name)
    }

    pub fn has_op(&self, name: &str) -> bool {
        self.op(name).is_some()
    }

    pub fn ops(&self) -> &[OperatorConf] {
        &self.ops
    }

    pub fn op_names(&self) -> impl Iterator<Item = &str> {
        self.ops.iter().map(|op| op.name.as_str())
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn parallel_desc(&self, name: &str) -> Option<&ParallelDesc> {
        self.placement.get(name)
    }

    pub fn sbp_signature(&self, name: &str) -> Option<&SbpSignature> {
        self.sbp_signatures.get(name)
    }

    /// Runs the job integrity check.
    pub fn validate(&self) -> Result<(), JobTopologyError> {
        topology::validate_job(self)
    }

    pub(crate) fn remove_op_records(&mut self, names: &BTreeSet<String>) -> usize {
        let before = self.ops.len();
        self.ops.retain(|op| !names.contains(&op.name));
        for name in names {
            self.placement.remove(name);
            self.sbp_signatures.remove(name);
        }
        before - self.ops.len()
    }

    pub(crate) fn replace_op_record(&mut self, conf: OperatorConf) -> bool {
        match self.ops.iter_mut().find(|op| op.name == conf.name) {
            Some(slot) => {
                *slot = conf;
                true
            }
            None => false,
        }
    }

    pub(crate) fn insert_op_record(
        &mut self,
        conf: OperatorConf,
        parallel: ParallelDesc,
        signature: SbpSignature,
    ) {
        self.placement.insert(conf.name.clone(), parallel);
        self.sbp_signatures.insert(conf.name.clone(), signature);
        self.ops.push(conf);
    }

    pub(crate) fn set_signature_record(&mut self, name: String, signature: SbpSignature) {
        self.sbp_signatures.insert(name, signature);
    }

    pub fn to_json_string(&self) -> Result<String, JobSerdeError> {
        serde_json::to_string_pretty(self).map_err(JobSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, JobSerdeError> {
        let mut job: Job = serde_json::from_str(src).map_err(JobSerdeError::from)?;
        job.spec_version = normalize_spec_version(job.spec_version)?;
        Ok(job)
    }

    pub fn to_bincode_bytes(&self) -> Result<Vec<u8>, JobSerdeError> {
        bincode::serialize(self).map_err(JobSerdeError::from)
    }

    pub fn from_bincode_slice(bytes: &[u8]) -> Result<Self, JobSerdeError> {
        let mut job: Job = bincode::deserialize(bytes).map_err(JobSerdeError::from)?;
        job.spec_version = normalize_spec_version(job.spec_version)?;
        Ok(job)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), JobIoError> {
        let contents = self.to_json_string()?;
        fs::write(path, contents).map_err(JobIoError::from)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, JobIoError> {
        let contents = fs::read_to_string(path).map_err(JobIoError::from)?;
        Job::from_json_str(&contents).map_err(JobIoError::from)
    }

    pub fn save_bincode<P: AsRef<Path>>(&self, path: P) -> Result<(), JobIoError> {
        let bytes = self.to_bincode_bytes()?;
        fs::write(path, bytes).map_err(JobIoError::from)
    }

    pub fn load_bincode<P: AsRef<Path>>(path: P) -> Result<Self, JobIoError> {
        let bytes = fs::read(path).map_err(JobIoError::from)?;
        Job::from_bincode_slice(&bytes).map_err(JobIoError::from)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

fn normalize_spec_version(version: String) -> Result<String, JobSerdeError> {
    if version.is_empty() {
        return Ok(JOB_SPEC_VERSION.to_string());
    }
    if version == JOB_SPEC_VERSION {
        Ok(version)
    } else {
        Err(JobSerdeError::SpecVersionMismatch {
            found: version,
            expected: JOB_SPEC_VERSION,
        })
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(
            f,
            0,
            &format!("job @{} (spec_version = {}) {{", self.name, self.spec_version),
        )?;
        write_line(
            f,
            1,
            &format!(
                "config: fuse_accumulate = {}, prune_sbp_casts = {}",
                self.config.fuse_accumulate, self.config.prune_sbp_casts
            ),
        )?;
        for op in &self.ops {
            fmt_op(self, op, 1, f)?;
        }
        write_line(f, 0, "}")
    }
}

fn fmt_op(job: &Job, op: &OperatorConf, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let placement = job
        .parallel_desc(&op.name)
        .map(|desc| desc.to_string())
        .unwrap_or_else(|| "<unplaced>".to_string());
    write_line(
        f,
        indent,
        &format!("op %{} : {} @ {} {{", op.name, op.type_name, placement),
    )?;
    for (arg, lbis) in &op.inputs {
        let rendered = lbis
            .iter()
            .map(Lbi::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        write_line(f, indent + 1, &format!("{arg} = [{rendered}]"))?;
    }
    for (arg, slot_count) in &op.outputs {
        write_line(f, indent + 1, &format!("{arg} -> {slot_count} slot(s)"))?;
    }
    if let Some(signature) = job.sbp_signature(&op.name) {
        if !signature.is_empty() {
            write_line(f, indent + 1, &format!("sbp: {signature}"))?;
        }
    }
    if !op.attrs.is_empty() {
        let rendered = op
            .attrs
            .iter()
            .map(|(key, value)| format!("{key} = {value}"))
            .collect::<Vec<_>>()
            .join(", ");
        write_line(f, indent + 1, &format!("attrs: {rendered}"))?;
    }
    if !op.ctrl_in_op_names.is_empty() {
        write_line(
            f,
            indent + 1,
            &format!("ctrl: [{}]", op.ctrl_in_op_names.join(", ")),
        )?;
    }
    write_line(f, indent, "}")
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, text: &str) -> fmt::Result {
    for _ in 0..indent {
        write!(f, "  ")?;
    }
    writeln!(f, "{text}")
}
