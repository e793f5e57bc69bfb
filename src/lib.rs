pub mod builder;
pub mod config;
mod env;
pub mod graph;
pub mod job;
pub mod pass;
pub mod sbp;
pub mod topology;
pub mod trace;

pub use builder::{CommitSummary, JobBuilder};
pub use config::JobConfig;
pub use graph::OpGraph;
pub use job::{Job, Lbi, OperatorConf};
pub use pass::{standard_pipeline, JobPass, PassRegistry, RewritePipeline, RewriteStats};
pub use sbp::{DeviceTag, ParallelDesc, SbpParallel, SbpSignature};
