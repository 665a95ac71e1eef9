//! Batch processing of registry feeds and the reports it produces.

mod orchestrator;
mod report;

pub use orchestrator::{
    Orchestrator, OrchestratorConfig, PipelineError, RunOneError, DEFAULT_CONCURRENCY,
};
pub use report::{FeedStage, ParseReport, ReportError, ReportWarning};
