//! In-memory fakes for the runner trait (testing only)
//!
//! `ScriptedRunner` records every command and answers from a script keyed
//! by program name, so pipeline sequencing can be tested without spawning
//! processes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::command::CommandLine;
use crate::runner::{CommandRunner, ExecutionResult, RunControls, CANCELLED};

/// Scripted command runner.
///
/// Programs without a scripted response succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    responses: Mutex<HashMap<String, ExecutionResult>>,
    artifacts: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<CommandLine>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every invocation of `program` with `result`.
    pub fn respond(self, program: &str, result: ExecutionResult) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(program.to_string(), result);
        self
    }

    /// Make `program` exit with `exit_code` and `stderr`.
    pub fn fail(self, program: &str, exit_code: i32, stderr: &str) -> Self {
        self.respond(
            program,
            ExecutionResult {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
                duration_ms: 0,
            },
        )
    }

    /// Write `contents` to the path following `--output` whenever `program` runs.
    pub fn write_output(self, program: &str, contents: &str) -> Self {
        self.artifacts
            .lock()
            .unwrap()
            .insert(program.to_string(), contents.to_string());
        self
    }

    /// Every command received, in call order.
    pub fn calls(&self) -> Vec<CommandLine> {
        self.calls.lock().unwrap().clone()
    }

    /// Commands received for `program`.
    pub fn calls_to(&self, program: &str) -> Vec<CommandLine> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }
}

fn output_path(command: &CommandLine) -> Option<PathBuf> {
    let pos = command.args.iter().position(|a| a == "--output")?;
    command.args.get(pos + 1).map(PathBuf::from)
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn execute(&self, command: &CommandLine, controls: &RunControls) -> ExecutionResult {
        self.calls.lock().unwrap().push(command.clone());

        if controls.cancel.is_cancelled() {
            return ExecutionResult {
                exit_code: CANCELLED,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 0,
            };
        }

        let artifact = self.artifacts.lock().unwrap().get(&command.program).cloned();
        if let (Some(contents), Some(path)) = (artifact, output_path(command)) {
            tokio::fs::write(&path, contents).await.unwrap();
        }

        self.responses
            .lock()
            .unwrap()
            .get(&command.program)
            .cloned()
            .unwrap_or(ExecutionResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 0,
            })
    }
}
