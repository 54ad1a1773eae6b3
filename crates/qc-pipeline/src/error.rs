//! Error taxonomy for pipeline runs.

use crate::report::ReportError;
use std::path::PathBuf;

/// Broad class of a pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Input path or output directory could not be prepared.
    Setup,
    /// A stage process could not be started.
    LaunchFailure,
    /// A stage process ran and exited non-zero.
    StageFailure,
    /// A stage exceeded its timeout.
    Timeout,
    /// The run was cancelled.
    Cancelled,
    /// The aggregator succeeded but its report could not be read.
    ReportParseFailure,
}

/// Why a pipeline run ended in the aborted state.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("cannot resolve input path {path}: {source}")]
    InputPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stage '{stage}' exited with code {exit_code}: {stderr}")]
    StageFailed {
        stage: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("stage '{stage}' could not be launched: {reason}")]
    LaunchFailed { stage: String, reason: String },

    #[error("aggregation stage '{stage}' exited with code {exit_code}: {stderr}")]
    AggregationFailed {
        stage: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("stage '{stage}' timed out after {timeout_secs} seconds")]
    StageTimedOut { stage: String, timeout_secs: u64 },

    #[error("stage '{stage}' was cancelled")]
    Cancelled { stage: String },

    #[error(transparent)]
    ReportParse(#[from] ReportError),
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::InputPath { .. } | PipelineError::OutputDir { .. } => FailureKind::Setup,
            PipelineError::LaunchFailed { .. } => FailureKind::LaunchFailure,
            PipelineError::StageFailed { .. } | PipelineError::AggregationFailed { .. } => {
                FailureKind::StageFailure
            }
            PipelineError::StageTimedOut { .. } => FailureKind::Timeout,
            PipelineError::Cancelled { .. } => FailureKind::Cancelled,
            PipelineError::ReportParse(_) => FailureKind::ReportParseFailure,
        }
    }

    /// Stage the failure is attributed to, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            PipelineError::StageFailed { stage, .. }
            | PipelineError::LaunchFailed { stage, .. }
            | PipelineError::AggregationFailed { stage, .. }
            | PipelineError::StageTimedOut { stage, .. }
            | PipelineError::Cancelled { stage } => Some(stage),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregation_failure_message_carries_stderr() {
        let err = PipelineError::AggregationFailed {
            stage: "Aggregator".to_string(),
            exit_code: 1,
            stderr: "disk full".to_string(),
        };
        assert_eq!(err.kind(), FailureKind::StageFailure);
        assert_eq!(err.stage(), Some("Aggregator"));
        let message = err.to_string();
        assert!(message.contains("Aggregator"));
        assert!(message.contains("disk full"));
    }

    #[test]
    fn test_report_parse_is_distinct_kind() {
        let err = PipelineError::from(ReportError::Read {
            path: PathBuf::from("outputs/Master_Report.json"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        });
        assert_eq!(err.kind(), FailureKind::ReportParseFailure);
        assert_eq!(err.stage(), None);
    }
}
