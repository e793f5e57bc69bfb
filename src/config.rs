//! Job-level rewrite configuration.

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Feature toggles carried inside a job and consulted by pass enablement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Fold two-input sums into accumulate-capable producers.
    #[serde(default = "default_true")]
    pub fuse_accumulate: bool,
    /// Delete layout-conversion operators whose conversion is redundant.
    #[serde(default = "default_true")]
    pub prune_sbp_casts: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            fuse_accumulate: true,
            prune_sbp_casts: true,
        }
    }
}
