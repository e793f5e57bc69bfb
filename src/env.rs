use std::env;
use std::sync::OnceLock;

static SHARDFLOW_PASS_STATS: OnceLock<bool> = OnceLock::new();
static SHARDFLOW_PRUNE_ITERS: OnceLock<usize> = OnceLock::new();

const DEFAULT_PRUNE_ITERS: usize = 4;

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn pass_stats_enabled() -> bool {
    *SHARDFLOW_PASS_STATS.get_or_init(|| match env::var("SHARDFLOW_PASS_STATS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// Fixed-point bound for the cast-pruning step of the standard pipeline.
pub(crate) fn prune_fixed_point_iters() -> usize {
    *SHARDFLOW_PRUNE_ITERS.get_or_init(|| match env::var("SHARDFLOW_PRUNE_ITERS") {
        Ok(value) => value
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|iters| *iters > 0)
            .unwrap_or(DEFAULT_PRUNE_ITERS),
        _ => DEFAULT_PRUNE_ITERS,
    })
}
