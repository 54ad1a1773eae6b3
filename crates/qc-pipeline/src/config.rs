//! Pipeline configuration and identity.

use crate::stage::{BuiltinStage, StageConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors raised while loading or validating a pipeline configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid pipeline config: {0}")]
    Invalid(String),
}

/// How analysis stages are scheduled.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One stage at a time, in configuration order.
    #[default]
    Sequential,

    /// All analysis stages at once, joined before aggregation.
    Concurrent,
}

/// What an analysis-stage failure does to the pipeline.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the failure and still run the aggregator.
    #[default]
    Continue,

    /// Skip aggregation if any analysis stage failed.
    AbortOnStageFailure,
}

/// QC pipeline configuration.
///
/// Replaces hardcoded tool paths: every stage is an explicit descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Directory receiving every stage report.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default)]
    pub mode: ExecutionMode,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Default stage timeout in seconds (0 = no timeout).
    #[serde(default)]
    pub stage_timeout_secs: u64,

    /// Independent analysis stages.
    pub analysis: Vec<StageConfig>,

    /// Stage producing the master report.
    pub aggregation: StageConfig,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::builtin("python3", Path::new("python_modules"))
    }
}

impl PipelineConfig {
    /// The stock visual/audio/OCR pipeline run through a Python interpreter.
    pub fn builtin(interpreter: &str, modules_dir: &Path) -> Self {
        Self {
            output_dir: default_output_dir(),
            mode: ExecutionMode::default(),
            failure_policy: FailurePolicy::default(),
            stage_timeout_secs: 0,
            analysis: BuiltinStage::ANALYSIS
                .iter()
                .map(|stage| StageConfig::from_builtin(*stage, interpreter, modules_dir))
                .collect(),
            aggregation: StageConfig::from_builtin(
                BuiltinStage::MasterReport,
                interpreter,
                modules_dir,
            ),
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Enabled analysis stages, in order.
    pub fn enabled_analysis(&self) -> impl Iterator<Item = &StageConfig> {
        self.analysis.iter().filter(|s| s.enabled)
    }

    /// Path of the master report.
    pub fn master_report_path(&self) -> PathBuf {
        self.aggregation.report_path(&self.output_dir)
    }

    /// Effective timeout for `stage`.
    pub fn timeout_for(&self, stage: &StageConfig) -> Option<Duration> {
        match stage.timeout_secs.unwrap_or(self.stage_timeout_secs) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Check the stage list for mistakes that would corrupt a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled_analysis().next().is_none() {
            return Err(ConfigError::Invalid(
                "at least one analysis stage must be enabled".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut reports = HashSet::new();
        for stage in self.analysis.iter().chain(std::iter::once(&self.aggregation)) {
            if stage.name.trim().is_empty() {
                return Err(ConfigError::Invalid("stage name must not be empty".to_string()));
            }
            if stage.program.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stage '{}' has empty program",
                    stage.name
                )));
            }
            if stage.report_file.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stage '{}' has empty report file",
                    stage.name
                )));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if !reports.insert(stage.report_file.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "report file '{}' is written by more than one stage",
                    stage.report_file
                )));
            }
        }

        Ok(())
    }

    /// Deterministic digest of the ordered stage descriptors.
    pub fn config_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for stage in self.enabled_analysis().chain(std::iter::once(&self.aggregation)) {
            hasher.update(stage.name.as_bytes());
            hasher.update(b"\0");
            hasher.update(stage.program.as_bytes());
            hasher.update(b"\0");
            for arg in &stage.args {
                hasher.update(arg.as_bytes());
                hasher.update(b"\0");
            }
            hasher.update(stage.report_file.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}
