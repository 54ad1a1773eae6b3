//! QC pipeline orchestration.

use crate::command::CommandLine;
use crate::config::{ConfigError, ExecutionMode, PipelineConfig};
use crate::error::PipelineError;
use crate::gate::AggregationGate;
use crate::report::{MasterReport, ReportSummary};
use crate::runner::{
    CommandRunner, ExecutionResult, ProcessRunner, RunControls, Termination, CANCELLED,
};
use crate::stage::{StageConfig, StageRole, TemplateBindings};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of one stage invocation.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    /// Stage name.
    pub stage_name: String,

    pub role: StageRole,

    /// Command that was run.
    pub command: CommandLine,

    /// Report the stage was asked to write.
    pub report_path: PathBuf,

    /// Timeout applied to the stage.
    pub timeout_secs: Option<u64>,

    /// Process result.
    pub result: ExecutionResult,
}

impl StageOutcome {
    /// Whether this stage passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.result.succeeded()
    }

    pub fn status(&self) -> Termination {
        self.result.termination()
    }

    /// The error this outcome represents, or `None` if it passed.
    pub fn to_error(&self) -> Option<PipelineError> {
        let stage = self.stage_name.clone();
        let stderr = self.result.stderr.trim_end().to_string();
        let error = match self.status() {
            Termination::Exited(0) => return None,
            Termination::LaunchFailed => PipelineError::LaunchFailed {
                stage,
                reason: stderr,
            },
            Termination::TimedOut => PipelineError::StageTimedOut {
                stage,
                timeout_secs: self.timeout_secs.unwrap_or_default(),
            },
            Termination::Cancelled => PipelineError::Cancelled { stage },
            _ => match self.role {
                StageRole::Analysis => PipelineError::StageFailed {
                    stage,
                    exit_code: self.result.exit_code,
                    stderr,
                },
                StageRole::Aggregation => PipelineError::AggregationFailed {
                    stage,
                    exit_code: self.result.exit_code,
                    stderr,
                },
            },
        };
        Some(error)
    }
}

/// Pipeline state machine positions, recorded in order for every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    NotStarted,
    AnalysisRunning { stage: String },
    AnalysisDone { stage: String },
    AggregationRunning,
    AggregationDone,
    ReportParsed,
    Aborted,
}

/// Terminal status of a run.
#[derive(Debug)]
pub enum PipelineStatus {
    /// The master report was produced and parsed.
    Completed(ReportSummary),

    /// The run stopped early.
    Aborted(PipelineError),
}

/// Result of a complete QC pipeline execution.
#[derive(Debug)]
pub struct PipelineResult {
    /// Unique run ID.
    pub run_id: String,

    /// Input artifact as given by the caller.
    pub input: PathBuf,

    pub started_at: DateTime<Utc>,

    /// Digest of the pipeline configuration.
    pub config_digest: String,

    /// Results of the analysis stages that ran, in configuration order.
    pub analysis: Vec<StageOutcome>,

    /// Result of the aggregation stage, if it ran.
    pub aggregation: Option<StageOutcome>,

    /// State machine history, first to last.
    pub transitions: Vec<PipelineState>,

    pub status: PipelineStatus,

    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl PipelineResult {
    /// Number of analysis stages that passed.
    pub fn passed_count(&self) -> usize {
        self.analysis.iter().filter(|s| s.passed()).count()
    }

    /// Number of analysis stages that failed.
    pub fn failed_count(&self) -> usize {
        self.analysis.iter().filter(|s| !s.passed()).count()
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, PipelineStatus::Completed(_))
    }

    /// The report summary, present only for completed runs.
    pub fn summary(&self) -> Option<&ReportSummary> {
        match &self.status {
            PipelineStatus::Completed(summary) => Some(summary),
            PipelineStatus::Aborted(_) => None,
        }
    }

    /// The abort reason, present only for aborted runs.
    pub fn error(&self) -> Option<&PipelineError> {
        match &self.status {
            PipelineStatus::Completed(_) => None,
            PipelineStatus::Aborted(err) => Some(err),
        }
    }

    /// Final state machine position.
    pub fn final_state(&self) -> Option<&PipelineState> {
        self.transitions.last()
    }
}

#[derive(Default)]
struct Progress {
    transitions: Vec<PipelineState>,
    analysis: Vec<StageOutcome>,
    aggregation: Option<StageOutcome>,
}

impl Progress {
    fn enter(&mut self, state: PipelineState) {
        debug!(state = ?state, "Pipeline transition");
        self.transitions.push(state);
    }
}

/// QC pipeline orchestrator.
///
/// Runs the analysis stages, then the aggregation stage, then reads the
/// master report. Analysis failures are soft under the default policy;
/// aggregation failure and report parse failure always abort the run.
pub struct QcPipeline {
    config: PipelineConfig,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
}

impl QcPipeline {
    /// Build a pipeline that launches real processes.
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        Self::with_runner(config, Arc::new(ProcessRunner::new()))
    }

    /// Build a pipeline around a custom runner.
    pub fn with_runner(
        config: PipelineConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            runner,
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Token that kills in-flight stages and aborts the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the pipeline against one input artifact.
    ///
    /// Never fails: every problem ends the run in [`PipelineStatus::Aborted`]
    /// after being logged where it was detected.
    pub async fn run(&self, input: impl AsRef<Path>) -> PipelineResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let config_digest = self.config.config_digest();
        let input = input.as_ref().to_path_buf();

        info!(
            run_id = %run_id,
            input = %input.display(),
            config = %&config_digest[..12],
            "--- STARTING QC PIPELINE ---"
        );

        let mut progress = Progress::default();
        progress.enter(PipelineState::NotStarted);

        let status = match self.drive(&input, &mut progress).await {
            Ok(summary) => PipelineStatus::Completed(summary),
            Err(err) => {
                progress.enter(PipelineState::Aborted);
                PipelineStatus::Aborted(err)
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match &status {
            PipelineStatus::Completed(_) => {
                info!(run_id = %run_id, duration_ms, "QC pipeline completed");
            }
            PipelineStatus::Aborted(err) => {
                error!(run_id = %run_id, duration_ms, kind = ?err.kind(), error = %err, "QC pipeline aborted");
            }
        }

        PipelineResult {
            run_id,
            input,
            started_at,
            config_digest,
            analysis: progress.analysis,
            aggregation: progress.aggregation,
            transitions: progress.transitions,
            status,
            duration_ms,
        }
    }

    async fn drive(
        &self,
        input: &Path,
        progress: &mut Progress,
    ) -> Result<ReportSummary, PipelineError> {
        let input = std::path::absolute(input).map_err(|source| {
            error!(input = %input.display(), error = %source, "Cannot resolve input path");
            PipelineError::InputPath {
                path: input.to_path_buf(),
                source,
            }
        })?;

        let output_dir = &self.config.output_dir;
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| {
                error!(output_dir = %output_dir.display(), error = %source, "Cannot create output directory");
                PipelineError::OutputDir {
                    path: output_dir.clone(),
                    source,
                }
            })?;

        for skipped in self.config.analysis.iter().filter(|s| !s.enabled) {
            info!(stage = %skipped.name, "Skipping disabled stage");
        }
        let stages: Vec<&StageConfig> = self.config.enabled_analysis().collect();

        match self.config.mode {
            ExecutionMode::Sequential => self.run_sequential(&input, &stages, progress).await,
            ExecutionMode::Concurrent => self.run_concurrent(&input, &stages, progress).await,
        }

        let verdict = AggregationGate::evaluate(&progress.analysis, self.config.failure_policy);
        if let Some(blocking) = &verdict.blocking {
            error!(stage = %blocking.stage_name, "{}", verdict.message);
            if let Some(err) = blocking.to_error() {
                return Err(err);
            }
        }
        if !verdict.violations.is_empty() {
            warn!(failed = verdict.violations.len(), "{}", verdict.message);
        }

        info!("--- AGGREGATING RESULTS ---");
        let master_report = self.config.master_report_path();
        let bindings = TemplateBindings {
            input: Some(input.clone()),
            output: master_report.clone(),
            inputs: stages.iter().map(|s| s.report_path(output_dir)).collect(),
        };

        progress.enter(PipelineState::AggregationRunning);
        let outcome = self
            .execute_stage(&self.config.aggregation, StageRole::Aggregation, bindings)
            .await;
        let failure = outcome.to_error();
        progress.aggregation = Some(outcome);

        if let Some(err) = failure {
            error!(
                stage = %self.config.aggregation.name,
                error = %err,
                "Pipeline failed at aggregation stage '{}'",
                self.config.aggregation.name
            );
            return Err(err);
        }
        progress.enter(PipelineState::AggregationDone);

        let report = MasterReport::load(&master_report).await.map_err(|err| {
            error!(error = %err, "Failed to parse master report");
            PipelineError::from(err)
        })?;
        let summary = report.summarize(&master_report);
        progress.enter(PipelineState::ReportParsed);

        for line in summary.to_string().lines() {
            info!("{}", line);
        }
        Ok(summary)
    }

    /// One stage at a time; stops launching once a stage would block the gate.
    async fn run_sequential(&self, input: &Path, stages: &[&StageConfig], progress: &mut Progress) {
        for stage in stages {
            progress.enter(PipelineState::AnalysisRunning {
                stage: stage.name.clone(),
            });

            let outcome = if self.cancel.is_cancelled() {
                self.cancelled_before_launch(stage, input)
            } else {
                self.execute_stage(stage, StageRole::Analysis, self.analysis_bindings(stage, input))
                    .await
            };

            progress.enter(PipelineState::AnalysisDone {
                stage: stage.name.clone(),
            });
            let halt = AggregationGate::blocks(&outcome, self.config.failure_policy);
            progress.analysis.push(outcome);

            if halt {
                warn!(stage = %stage.name, "Halting analysis stages");
                break;
            }
        }
    }

    /// All stages at once, joined before the gate is evaluated.
    async fn run_concurrent(&self, input: &Path, stages: &[&StageConfig], progress: &mut Progress) {
        for stage in stages {
            progress.enter(PipelineState::AnalysisRunning {
                stage: stage.name.clone(),
            });
        }

        let outcomes = futures::future::join_all(stages.iter().map(|stage| {
            self.execute_stage(stage, StageRole::Analysis, self.analysis_bindings(stage, input))
        }))
        .await;

        for outcome in outcomes {
            progress.enter(PipelineState::AnalysisDone {
                stage: outcome.stage_name.clone(),
            });
            progress.analysis.push(outcome);
        }
    }

    fn analysis_bindings(&self, stage: &StageConfig, input: &Path) -> TemplateBindings {
        TemplateBindings {
            input: Some(input.to_path_buf()),
            output: stage.report_path(&self.config.output_dir),
            inputs: Vec::new(),
        }
    }

    fn cancelled_before_launch(&self, stage: &StageConfig, input: &Path) -> StageOutcome {
        let bindings = self.analysis_bindings(stage, input);
        StageOutcome {
            stage_name: stage.name.clone(),
            role: StageRole::Analysis,
            command: stage.render(&bindings),
            report_path: bindings.output,
            timeout_secs: self.config.timeout_for(stage).map(|t| t.as_secs()),
            result: ExecutionResult {
                exit_code: CANCELLED,
                stdout: String::new(),
                stderr: "cancelled before launch".to_string(),
                duration_ms: 0,
            },
        }
    }

    async fn execute_stage(
        &self,
        stage: &StageConfig,
        role: StageRole,
        bindings: TemplateBindings,
    ) -> StageOutcome {
        let command = stage.render(&bindings);
        let timeout = self.config.timeout_for(stage);
        let controls = RunControls::new(self.cancel.clone()).with_timeout(timeout);

        info!(stage = %stage.name, "Executing stage");
        let result = self.runner.execute(&command, &controls).await;

        let outcome = StageOutcome {
            stage_name: stage.name.clone(),
            role,
            command,
            report_path: bindings.output,
            timeout_secs: timeout.map(|t| t.as_secs()),
            result,
        };
        log_outcome(&outcome);
        outcome
    }
}

/// Operator-facing status line for a finished stage.
fn outcome_line(outcome: &StageOutcome) -> String {
    if outcome.passed() {
        format!("[SUCCESS] {}", outcome.stage_name)
    } else {
        format!(
            "[FAILED] {} (exit code: {})",
            outcome.stage_name, outcome.result.exit_code
        )
    }
}

fn log_outcome(outcome: &StageOutcome) {
    let line = outcome_line(outcome);
    if outcome.passed() {
        info!(
            stage = %outcome.stage_name,
            duration_ms = outcome.result.duration_ms,
            "{}",
            line
        );
        return;
    }

    error!(
        stage = %outcome.stage_name,
        exit_code = outcome.result.exit_code,
        status = %outcome.status(),
        "{}",
        line
    );
    let stderr = outcome.result.stderr.trim_end();
    if !stderr.is_empty() {
        error!(stage = %outcome.stage_name, "Stderr: {}", stderr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::TIMED_OUT;

    fn outcome(name: &str, role: StageRole, exit_code: i32) -> StageOutcome {
        StageOutcome {
            stage_name: name.to_string(),
            role,
            command: CommandLine::new("tool", Vec::<String>::new()),
            report_path: PathBuf::from("out.json"),
            timeout_secs: Some(30),
            result: ExecutionResult {
                exit_code,
                stdout: "".to_string(),
                stderr: "disk full\n".to_string(),
                duration_ms: 100,
            },
        }
    }

    fn result_with(analysis: Vec<StageOutcome>, status: PipelineStatus) -> PipelineResult {
        PipelineResult {
            run_id: "run123".to_string(),
            input: PathBuf::from("clip.mp4"),
            started_at: Utc::now(),
            config_digest: "abc123".to_string(),
            analysis,
            aggregation: None,
            transitions: vec![PipelineState::NotStarted],
            status,
            duration_ms: 300,
        }
    }

    #[test]
    fn test_pipeline_result_counts() {
        let result = result_with(
            vec![
                outcome("Visual QC", StageRole::Analysis, 0),
                outcome("Audio QC", StageRole::Analysis, 1),
                outcome("OCR Extraction", StageRole::Analysis, 0),
            ],
            PipelineStatus::Aborted(PipelineError::Cancelled {
                stage: "x".to_string(),
            }),
        );

        assert_eq!(result.passed_count(), 2);
        assert_eq!(result.failed_count(), 1);
        assert!(!result.is_completed());
        assert!(result.summary().is_none());
        assert!(result.error().is_some());
    }

    #[test]
    fn test_passed_outcome_has_no_error() {
        assert!(outcome("Visual QC", StageRole::Analysis, 0).to_error().is_none());
    }

    #[test]
    fn test_analysis_and_aggregation_errors_differ() {
        let analysis = outcome("Audio QC", StageRole::Analysis, 1).to_error().unwrap();
        assert!(matches!(analysis, PipelineError::StageFailed { exit_code: 1, .. }));

        let aggregation = outcome("Aggregator", StageRole::Aggregation, 1)
            .to_error()
            .unwrap();
        match aggregation {
            PipelineError::AggregationFailed { stage, stderr, .. } => {
                assert_eq!(stage, "Aggregator");
                assert_eq!(stderr, "disk full");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_timeout_outcome_maps_to_timeout_error() {
        let err = outcome("OCR Extraction", StageRole::Analysis, TIMED_OUT)
            .to_error()
            .unwrap();
        assert!(matches!(
            err,
            PipelineError::StageTimedOut { timeout_secs: 30, .. }
        ));
    }

    #[test]
    fn test_outcome_line_formats() {
        assert_eq!(
            outcome_line(&outcome("Visual QC", StageRole::Analysis, 0)),
            "[SUCCESS] Visual QC"
        );
        assert_eq!(
            outcome_line(&outcome("Audio QC", StageRole::Analysis, 1)),
            "[FAILED] Audio QC (exit code: 1)"
        );
        assert_eq!(
            outcome_line(&outcome("OCR Extraction", StageRole::Analysis, TIMED_OUT)),
            "[FAILED] OCR Extraction (exit code: -2)"
        );
    }

    #[test]
    fn test_pipeline_rejects_invalid_config() {
        let mut config = PipelineConfig::default();
        config.analysis.clear();
        assert!(QcPipeline::new(config).is_err());
    }
}
