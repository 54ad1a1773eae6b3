//! QC stage definitions and command templates.

use crate::command::CommandLine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Placeholder for the absolute input artifact path.
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// Placeholder for the stage's own report path.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Placeholder expanded to one argument per upstream report path.
pub const INPUTS_PLACEHOLDER: &str = "{inputs}";

/// Position of a stage in the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    /// Independent analysis of the input artifact.
    Analysis,

    /// Merges all analysis reports into the master report.
    Aggregation,
}

/// Builtin QC stages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinStage {
    /// Black-screen glitch detection.
    VisualQc,

    /// EBU R.128 loudness compliance.
    AudioQc,

    /// On-screen text extraction.
    OcrExtraction,

    /// Master report aggregation.
    MasterReport,
}

impl BuiltinStage {
    /// The analysis stages in pipeline order.
    pub const ANALYSIS: [BuiltinStage; 3] = [
        BuiltinStage::VisualQc,
        BuiltinStage::AudioQc,
        BuiltinStage::OcrExtraction,
    ];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinStage::VisualQc => "Visual QC",
            BuiltinStage::AudioQc => "Audio QC",
            BuiltinStage::OcrExtraction => "OCR Extraction",
            BuiltinStage::MasterReport => "Aggregator",
        }
    }

    /// Script run by the interpreter, relative to the modules directory.
    pub fn script(&self) -> &'static str {
        match self {
            BuiltinStage::VisualQc => "detect_black.py",
            BuiltinStage::AudioQc => "validate_loudness.py",
            BuiltinStage::OcrExtraction => "video_ocr.py",
            BuiltinStage::MasterReport => "generate_master_report.py",
        }
    }

    /// Report file name written into the output directory.
    pub fn report_file(&self) -> &'static str {
        match self {
            BuiltinStage::VisualQc => "report_visual.json",
            BuiltinStage::AudioQc => "report_audio.json",
            BuiltinStage::OcrExtraction => "report_ocr.json",
            BuiltinStage::MasterReport => "Master_Report.json",
        }
    }

    pub fn role(&self) -> StageRole {
        match self {
            BuiltinStage::MasterReport => StageRole::Aggregation,
            _ => StageRole::Analysis,
        }
    }
}

/// Values substituted into a stage's argument template.
#[derive(Debug, Clone, Default)]
pub struct TemplateBindings {
    /// Absolute input artifact path.
    pub input: Option<PathBuf>,

    /// This stage's report path.
    pub output: PathBuf,

    /// Upstream report paths (aggregation only).
    pub inputs: Vec<PathBuf>,
}

/// Configuration for a QC stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageConfig {
    /// Human-readable stage name.
    pub name: String,

    /// Executable to launch.
    pub program: String,

    /// Argument template (`{input}`, `{output}`, `{inputs}` are substituted).
    #[serde(default)]
    pub args: Vec<String>,

    /// Report file name, relative to the pipeline output directory.
    pub report_file: String,

    /// Timeout in seconds, overriding the pipeline default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Whether this stage is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl StageConfig {
    /// Create a stage configuration from a builtin stage.
    ///
    /// The command is `interpreter modules_dir/script` followed by
    /// `--input {input} --output {output}`, or `--inputs {inputs} --output
    /// {output}` for the aggregator.
    pub fn from_builtin(stage: BuiltinStage, interpreter: &str, modules_dir: &Path) -> Self {
        let script = modules_dir.join(stage.script()).to_string_lossy().into_owned();
        let input_flag = match stage.role() {
            StageRole::Analysis => ["--input", INPUT_PLACEHOLDER],
            StageRole::Aggregation => ["--inputs", INPUTS_PLACEHOLDER],
        };

        let mut args = vec![script];
        args.extend(input_flag.iter().map(|s| s.to_string()));
        args.push("--output".to_string());
        args.push(OUTPUT_PLACEHOLDER.to_string());

        Self {
            name: stage.name().to_string(),
            program: interpreter.to_string(),
            args,
            report_file: stage.report_file().to_string(),
            timeout_secs: None,
            enabled: true,
        }
    }

    /// Create a custom stage configuration.
    pub fn custom(
        name: impl Into<String>,
        program: impl Into<String>,
        args: Vec<String>,
        report_file: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            report_file: report_file.into(),
            timeout_secs: None,
            enabled: true,
        }
    }

    /// Disable this stage.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Set a per-stage timeout.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Report path inside `output_dir`.
    pub fn report_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(&self.report_file)
    }

    /// Substitute the bindings into the argument template.
    ///
    /// An argument that is exactly `{inputs}` expands to one argument per
    /// upstream report; `{input}` and `{output}` may appear inside a larger
    /// argument such as `--output={output}`.
    pub fn render(&self, bindings: &TemplateBindings) -> CommandLine {
        let input = bindings
            .input
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        let output = bindings.output.to_string_lossy();

        let mut args = Vec::with_capacity(self.args.len() + bindings.inputs.len());
        for arg in &self.args {
            if arg == INPUTS_PLACEHOLDER {
                args.extend(
                    bindings
                        .inputs
                        .iter()
                        .map(|p| p.to_string_lossy().into_owned()),
                );
                continue;
            }

            let mut rendered = arg.replace(OUTPUT_PLACEHOLDER, &output);
            if let Some(input) = &input {
                rendered = rendered.replace(INPUT_PLACEHOLDER, input);
            }
            args.push(rendered);
        }

        CommandLine {
            program: self.program.clone(),
            args,
        }
    }
}
