//! QC Pipeline - media quality control via external analysis tools
//!
//! Provides a pipeline orchestrator that:
//! - Runs independent analysis tools (visual, audio, OCR) against one input
//! - Drains every tool's output concurrently so large output never stalls
//! - Feeds all stage reports to an aggregator and summarises its master report

pub mod command;
pub mod config;
pub mod error;
pub mod fakes;
pub mod gate;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod stage;
pub mod telemetry;

// Re-export key types
pub use command::{CommandLine, CommandLineError};
pub use config::{ConfigError, ExecutionMode, FailurePolicy, PipelineConfig};
pub use error::{FailureKind, PipelineError};
pub use gate::{AggregationGate, GateVerdict};
pub use pipeline::{PipelineResult, PipelineState, PipelineStatus, QcPipeline, StageOutcome};
pub use report::{MasterReport, ReportError, ReportSummary};
pub use runner::{
    CommandRunner, ExecutionResult, ProcessRunner, RunControls, Termination, CANCELLED,
    LAUNCH_FAILURE, SIGNALLED, TIMED_OUT,
};
pub use stage::{BuiltinStage, StageConfig, StageRole, TemplateBindings};
pub use telemetry::init_tracing;
