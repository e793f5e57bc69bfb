//! Pass-event observability.
//!
//! A process-wide [`TraceSink`] receives one event per committed pass plus a
//! full job text dump. With no sink installed, events are dropped unless
//! `SHARDFLOW_PASS_STATS` is set, in which case stats fall back to a one-line
//! stderr print.

use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use once_cell::sync::Lazy;

pub trait TraceSink: Send + Sync {
    fn pass_event(&self, event: &PassEvent);
}

#[derive(Debug, Clone)]
pub struct PassEvent {
    pub timestamp: SystemTime,
    /// Pipeline-run ordinal, present when anyone is listening.
    pub run_id: Option<usize>,
    pub kind: PassEventKind,
}

#[derive(Debug, Clone)]
pub enum PassEventKind {
    PassApplied {
        job: String,
        pass: String,
        stats: RewritePassStats,
        elapsed: Duration,
    },
    /// Post-commit job dump; emitted only when a sink is installed.
    JobText {
        job: String,
        pass: String,
        text: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewritePassStats {
    pub changed: bool,
    pub ops_added: usize,
    pub ops_replaced: usize,
    pub ops_deleted: usize,
    pub signatures_overridden: usize,
    /// Operator count after the commit.
    pub op_count: usize,
}

static SINK: Lazy<RwLock<Option<Arc<dyn TraceSink>>>> = Lazy::new(|| RwLock::new(None));

pub fn install_sink(sink: Arc<dyn TraceSink>) {
    *SINK.write().expect("trace sink lock poisoned") = Some(sink);
}

pub fn clear_sink() {
    *SINK.write().expect("trace sink lock poisoned") = None;
}

pub fn current_sink() -> Option<Arc<dyn TraceSink>> {
    SINK.read().expect("trace sink lock poisoned").clone()
}

pub fn emit_pass_event(event: PassEvent) {
    if let Some(sink) = current_sink() {
        sink.pass_event(&event);
        return;
    }
    if !crate::env::pass_stats_enabled() {
        return;
    }
    if let PassEventKind::PassApplied {
        job,
        pass,
        stats,
        elapsed,
    } = &event.kind
    {
        eprintln!(
            "[shardflow] job `{job}` pass `{pass}`: changed={} added={} replaced={} deleted={} sig_overrides={} ops={} in {elapsed:?}",
            stats.changed,
            stats.ops_added,
            stats.ops_replaced,
            stats.ops_deleted,
            stats.signatures_overridden,
            stats.op_count,
        );
    }
}
