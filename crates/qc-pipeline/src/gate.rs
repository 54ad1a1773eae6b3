//! Gate deciding whether the aggregation stage may run.

use crate::config::FailurePolicy;
use crate::pipeline::StageOutcome;
use crate::runner::Termination;
use serde::Serialize;

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize)]
pub struct GateVerdict {
    /// Whether aggregation may run.
    pub proceed: bool,

    /// Every failed analysis stage, blocking or not.
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,

    /// First outcome that stopped the pipeline, when `proceed` is false.
    #[serde(skip)]
    pub blocking: Option<StageOutcome>,
}

/// Aggregation gate rules.
pub struct AggregationGate;

impl AggregationGate {
    /// Whether `outcome` alone stops the pipeline under `policy`.
    ///
    /// Timeouts and cancellation always stop it. Other failures only stop it
    /// under [`FailurePolicy::AbortOnStageFailure`]; under
    /// [`FailurePolicy::Continue`] the aggregator is left to cope with the
    /// missing or partial report.
    pub fn blocks(outcome: &StageOutcome, policy: FailurePolicy) -> bool {
        match outcome.status() {
            Termination::Exited(0) => false,
            Termination::TimedOut | Termination::Cancelled => true,
            _ => policy == FailurePolicy::AbortOnStageFailure,
        }
    }

    /// Evaluate the analysis outcomes of one run.
    pub fn evaluate(outcomes: &[StageOutcome], policy: FailurePolicy) -> GateVerdict {
        let mut violations = Vec::new();
        let mut blocking: Option<&StageOutcome> = None;

        for outcome in outcomes {
            if outcome.passed() {
                continue;
            }

            let violation = match outcome.status() {
                Termination::LaunchFailed => format!(
                    "Stage '{}' failed to launch: {}",
                    outcome.stage_name,
                    outcome.result.stderr.trim()
                ),
                status => format!("Stage '{}' {}", outcome.stage_name, status),
            };
            violations.push(violation);

            if blocking.is_none() && Self::blocks(outcome, policy) {
                blocking = Some(outcome);
            }
        }

        let message = match (blocking, violations.len()) {
            (Some(outcome), _) => format!("Aggregation blocked by stage '{}'", outcome.stage_name),
            (None, 0) => "All analysis stages passed".to_string(),
            (None, n) => format!("Proceeding to aggregation with {} failed stage(s)", n),
        };

        GateVerdict {
            proceed: blocking.is_none(),
            violations,
            message,
            blocking: blocking.cloned(),
        }
    }
}
