//! Output-accumulation fusion.
//!
//! Folds a two-input `add_n` into a preceding accumulate-capable producer:
//! the other addend becomes the producer's hidden `_accumulate` input, the
//! sum's consumers read the producer's output directly, and the `add_n` is
//! deleted. The producer's signature gains an `_accumulate` entry at the
//! output's layout, so the accumulated value arrives distributed exactly like
//! the buffer it folds into.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{ensure, Result};

use crate::builder::JobBuilder;
use crate::config::JobConfig;
use crate::graph::{NodeId, OpGraph};
use crate::job::{Lbi, OperatorConf};
use crate::sbp::SbpSignature;

use super::JobPass;

/// Two-input elementwise sum kind this pass folds away.
const SUM_OP: &str = "add_n";

/// Hidden input argument added to fused producers.
pub const ACCUMULATE_ARG: &str = "_accumulate";

/// Producer kinds that can fold an addend into an output buffer, with the
/// output slot the fold targets.
fn accumulate_output(type_name: &str) -> Option<(&'static str, u32)> {
    match type_name {
        "matmul" => Some(("out", 0)),
        "conv2d_data_grad" => Some(("dx", 0)),
        "batch_norm" => Some(("y", 0)),
        _ => None,
    }
}

/// Exactly the binary sum shape: one `in` argument with two slots, one
/// single-slot `out` argument, nothing else.
fn is_binary_sum(conf: &OperatorConf) -> bool {
    conf.inputs.len() == 1
        && conf.input_len("in") == 2
        && conf.outputs.len() == 1
        && conf.outputs.get("out") == Some(&1)
}

#[derive(Debug, Default)]
pub struct AccumulateFusionPass;

impl AccumulateFusionPass {
    pub const NAME: &'static str = "accumulate-fusion";
}

struct Candidate {
    producer: NodeId,
    /// The producer's output the sum collapses onto.
    sum_lbi: Lbi,
    /// The addend that becomes the hidden input.
    other_lbi: Lbi,
}

fn qualify_producer(
    graph: &OpGraph<'_>,
    staged: &BTreeMap<String, OperatorConf>,
    sum_lbi: &Lbi,
    other_lbi: &Lbi,
) -> Option<Candidate> {
    let producer_id = graph.producer_of(sum_lbi)?;
    let producer = graph.node(producer_id);
    if staged.contains_key(producer.name()) {
        return None;
    }
    let (arg, index) = accumulate_output(producer.type_name())?;
    if sum_lbi.arg != arg || sum_lbi.index != index {
        return None;
    }
    let consumer_edges = graph
        .out_edges(producer_id)
        .filter(|edge| edge.carries(sum_lbi))
        .count();
    if consumer_edges != 1 {
        return None;
    }
    if producer.conf().has_input_arg(ACCUMULATE_ARG) {
        return None;
    }
    Some(Candidate {
        producer: producer_id,
        sum_lbi: sum_lbi.clone(),
        other_lbi: other_lbi.clone(),
    })
}

impl JobPass for AccumulateFusionPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn is_enabled(&self, config: &JobConfig) -> bool {
        config.fuse_accumulate
    }

    fn apply(&self, graph: &OpGraph<'_>, builder: &mut JobBuilder) -> Result<()> {
        // producer edits and consumer rewires share one staged map so each
        // operator is replaced at most once per pass
        let mut staged: BTreeMap<String, OperatorConf> = BTreeMap::new();
        let mut overrides: Vec<(String, SbpSignature)> = Vec::new();
        let mut deleted: BTreeSet<String> = BTreeSet::new();

        for (id, node) in graph.nodes() {
            if node.type_name() != SUM_OP {
                continue;
            }
            if graph.has_ctrl_links(id) {
                continue;
            }
            if staged.contains_key(node.name()) {
                continue;
            }
            if !is_binary_sum(node.conf()) {
                continue;
            }
            let (Some(in_0), Some(in_1)) = (node.conf().input("in", 0), node.conf().input("in", 1))
            else {
                continue;
            };
            let Some(out_lbi) = node.conf().output_lbi("out", 0) else {
                continue;
            };

            // control participants are never replaced or re-fed; a control
            // edge on either addend's producer blocks the whole site
            if [in_0, in_1]
                .into_iter()
                .filter_map(|lbi| graph.producer_of(lbi))
                .any(|producer| graph.has_ctrl_links(producer))
            {
                continue;
            }

            // a consumer deleted earlier this run now reads this sum from a
            // staged `_accumulate` slot the frozen graph cannot see; defer
            // this sum to a later run
            if graph
                .out_edges(id)
                .any(|edge| deleted.contains(graph.node(edge.dst).name()))
            {
                continue;
            }

            // the first addend wins when both producers qualify
            let candidate = qualify_producer(graph, &staged, in_0, in_1)
                .or_else(|| qualify_producer(graph, &staged, in_1, in_0));
            let Some(candidate) = candidate else {
                continue;
            };

            let producer = graph.node(candidate.producer);
            let mut fused = producer.conf().clone();
            fused.push_input(ACCUMULATE_ARG, candidate.other_lbi.clone());
            let out_sbp = producer.produced_sbp(&candidate.sum_lbi)?;
            let mut signature = producer.sbp_signature().clone();
            signature.set_arg(ACCUMULATE_ARG, vec![out_sbp]);
            staged.insert(producer.name().to_string(), fused);
            overrides.push((producer.name().to_string(), signature));

            for edge in graph.out_edges(id) {
                if !edge.carries(&out_lbi) {
                    continue;
                }
                let consumer = graph.node(edge.dst);
                let entry = staged
                    .entry(consumer.name().to_string())
                    .or_insert_with(|| consumer.conf().clone());
                let rewired = entry.rewire_input(&out_lbi, &candidate.sum_lbi);
                ensure!(
                    rewired > 0,
                    "consumer `{}` carries `{}` on an edge but references no such input",
                    consumer.name(),
                    out_lbi
                );
            }
            deleted.insert(node.name().to_string());
        }

        for (_, conf) in staged {
            builder.replace_op_once(conf)?;
        }
        builder.delete_ops(deleted)?;
        for (op_name, signature) in overrides {
            builder.override_signature(op_name, signature);
        }
        Ok(())
    }
}
