//! Redundant-layout-conversion pruning.
//!
//! Deletes `sbp_cast` operators whose conversion the surrounding graph does
//! not need: consumers are rewired to the cast's input value and producer and
//! consumer signatures are pinned so later stages keep the layouts the cast
//! had fixed. When the cast converts for real (producer layout differs from
//! the target) it is only bypassed for a single consumer edge, where the
//! conversion can happen in place. Chains of casts collapse across fixed-point
//! rounds: a cast feeding another cast is skipped until the downstream cast is
//! gone.

use std::collections::BTreeMap;

use anyhow::{ensure, Result};

use crate::builder::JobBuilder;
use crate::config::JobConfig;
use crate::graph::{LayoutQueryError, OpGraph};
use crate::job::OperatorConf;
use crate::sbp::SbpSignature;

use super::JobPass;

/// Layout-conversion operator kind this pass deletes.
pub const SBP_CAST_OP: &str = "sbp_cast";

/// Exactly the conversion shape: one single-slot `in` argument and one
/// single-slot `out` argument, nothing else.
fn is_unary_cast(conf: &OperatorConf) -> bool {
    conf.inputs.len() == 1
        && conf.input_len("in") == 1
        && conf.outputs.len() == 1
        && conf.outputs.get("out") == Some(&1)
}

#[derive(Debug, Default)]
pub struct PruneSbpCastPass;

impl PruneSbpCastPass {
    pub const NAME: &'static str = "prune-sbp-cast";
}

impl JobPass for PruneSbpCastPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn is_enabled(&self, config: &JobConfig) -> bool {
        config.prune_sbp_casts
    }

    fn apply(&self, graph: &OpGraph<'_>, builder: &mut JobBuilder) -> Result<()> {
        let mut staged: BTreeMap<String, OperatorConf> = BTreeMap::new();
        let mut overrides: BTreeMap<String, SbpSignature> = BTreeMap::new();
        let mut deleted: Vec<String> = Vec::new();

        'casts: for (id, node) in graph.nodes() {
            if node.type_name() != SBP_CAST_OP {
                continue;
            }
            if graph.has_ctrl_links(id) {
                continue;
            }
            if !is_unary_cast(node.conf()) {
                continue;
            }
            let Some(in_edge) = graph.sole_in_edge(id) else {
                continue;
            };
            let producer = graph.node(in_edge.src);
            let Some(cast_in) = node.conf().input("in", 0) else {
                continue;
            };
            let Some(cast_out) = node.conf().output_lbi("out", 0) else {
                continue;
            };
            // the cast observes its input at the layout it materializes
            let cast_sbp = node.observed_sbp(cast_in)?;
            let producer_sbp = producer.produced_sbp(cast_in)?;
            if node.parallel_desc() != producer.parallel_desc() {
                continue;
            }
            // a real conversion moves onto the consumer edge when bypassed,
            // which only stays equivalent for a single consumer
            if cast_sbp != producer_sbp && graph.out_degree(id) > 1 {
                continue;
            }

            for edge in graph.out_edges(id) {
                let consumer = graph.node(edge.dst);
                if consumer.type_name() == SBP_CAST_OP {
                    continue 'casts;
                }
                if consumer.parallel_desc() != node.parallel_desc() {
                    continue 'casts;
                }
                match consumer.observed_sbp(&cast_out) {
                    Ok(sbp) if sbp == cast_sbp => {}
                    Ok(_) | Err(LayoutQueryError::AmbiguousLayout { .. }) => continue 'casts,
                    Err(err) => return Err(err.into()),
                }
            }

            overrides.insert(
                producer.name().to_string(),
                producer.sbp_signature().clone(),
            );
            for edge in graph.out_edges(id) {
                let consumer = graph.node(edge.dst);
                let entry = staged
                    .entry(consumer.name().to_string())
                    .or_insert_with(|| consumer.conf().clone());
                let rewired = entry.rewire_input(&cast_out, cast_in);
                ensure!(
                    rewired > 0,
                    "consumer `{}` carries `{}` on an edge but references no such input",
                    consumer.name(),
                    cast_out
                );
                overrides.insert(
                    consumer.name().to_string(),
                    consumer.sbp_signature().clone(),
                );
            }
            deleted.push(node.name().to_string());
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
