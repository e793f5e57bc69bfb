//! Pass scheduling and the snapshot/apply/commit driver loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context;

use crate::builder::JobBuilder;
use crate::graph::OpGraph;
use crate::job::Job;
use crate::trace::{emit_pass_event, PassEvent, PassEventKind, RewritePassStats};

use super::{
    standard_registry, AccumulateFusionPass, JobPass, PruneSbpCastPass, RewriteStats,
};

pub enum Step {
    Pass(Arc<dyn JobPass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn pass(&mut self, pass: Arc<dyn JobPass>) {
        self.steps.push(Step::Pass(pass));
    }

    /// Nested steps repeated until a full round commits no change, at most
    /// `max_iters` rounds.
    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> Vec<Step> {
        self.steps
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RewritePipeline {
    steps: Vec<Step>,
    log_stats: bool,
    run_counter: AtomicUsize,
}

impl RewritePipeline {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            log_stats: crate::env::pass_stats_enabled(),
            run_counter: AtomicUsize::new(0),
        }
    }

    /// Runs every enabled pass over `job`: fresh snapshot, apply, atomic
    /// commit, strictly in step order. Any failure aborts the run; the job
    /// keeps its last committed state.
    pub fn run(&self, job: &mut Job) -> anyhow::Result<RewriteStats> {
        let track_run_id = self.log_stats || crate::trace::current_sink().is_some();
        let run_id = if track_run_id {
            Some(self.run_counter.fetch_add(1, Ordering::Relaxed))
        } else {
            None
        };

        let mut totals = RewriteStats::default();
        run_steps(&self.steps, job, run_id, &mut totals, self.log_stats)?;
        Ok(totals)
    }
}

/// Fusion once, then cast pruning to a fixed point.
pub fn standard_pipeline() -> anyhow::Result<RewritePipeline> {
    let registry = standard_registry()?;
    let mut builder = PipelineBuilder::new();
    let fuse = registry
        .get(AccumulateFusionPass::NAME)
        .context("accumulate-fusion pass is not registered")?;
    builder.pass(fuse);
    let prune = registry
        .get(PruneSbpCastPass::NAME)
        .context("prune-sbp-cast pass is not registered")?;
    builder.fixed_point(crate::env::prune_fixed_point_iters(), |p| {
        p.pass(prune);
    });
    Ok(RewritePipeline::new(builder.finish()))
}

fn run_steps(
    steps: &[Step],
    job: &mut Job,
    run_id: Option<usize>,
    totals: &mut RewriteStats,
    log_stats: bool,
) -> anyhow::Result<bool> {
    let mut changed_any = false;
    for step in steps {
        match step {
            Step::Pass(pass) => {
                if !pass.is_enabled(&job.config) {
                    continue;
                }
                let started = Instant::now();
                let mut builder = JobBuilder::new();
                {
                    let graph = OpGraph::new(job).with_context(|| {
                        format!(
                            "building snapshot for pass `{}` on job `{}`",
                            pass.name(),
                            job.name
                        )
                    })?;
                    pass.apply(&graph, &mut builder).with_context(|| {
                        format!("pass `{}` failed on job `{}`", pass.name(), job.name)
                    })?;
                }
                let summary = builder.commit(job).with_context(|| {
                    format!(
                        "committing edits of pass `{}` on job `{}`",
                        pass.name(),
                        job.name
                    )
                })?;
                let stats = RewriteStats::from_commit(&summary);
                changed_any |= stats.changed;
                *totals = totals.merge(stats);
                let emit_text = crate::trace::current_sink().is_some();
                if log_stats || emit_text {
                    emit_rewrite_pass_stats(
                        pass.name(),
                        job,
                        run_id,
                        stats,
                        started.elapsed(),
                        emit_text,
                    );
                }
            }
            Step::FixedPoint { max_iters, steps } => {
                let mut iter = 0usize;
                loop {
                    if iter >= *max_iters {
                        break;
                    }
                    iter += 1;
                    let mut local = RewriteStats::default();
                    let changed = run_steps(steps, job, run_id, &mut local, log_stats)?;
                    *totals = totals.merge(local);
                    changed_any |= changed;
                    if !changed {
                        break;
                    }
                }
            }
        }
    }
    Ok(changed_any)
}

fn emit_rewrite_pass_stats(
    name: &str,
    job: &Job,
    run_id: Option<usize>,
    stats: RewriteStats,
    elapsed: Duration,
    emit_text: bool,
) {
    emit_pass_event(PassEvent {
        timestamp: SystemTime::now(),
        run_id,
        kind: PassEventKind::PassApplied {
            job: job.name.clone(),
            pass: name.to_string(),
            stats: RewritePassStats {
                changed: stats.changed,
                ops_added: stats.ops_added,
                ops_replaced: stats.ops_replaced,
                ops_deleted: stats.ops_deleted,
                signatures_overridden: stats.signatures_overridden,
                op_count: job.op_count(),
            },
            elapsed,
        },
    });
    if emit_text {
        emit_pass_event(PassEvent {
            timestamp: SystemTime::now(),
            run_id,
            kind: PassEventKind::JobText {
                job: job.name.clone(),
                pass: name.to_string(),
                text: job.to_text(),
            },
        });
    }
}
