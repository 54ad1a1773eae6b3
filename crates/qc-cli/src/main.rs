//! QC Pipeline CLI
//!
//! The `qc` command runs the media quality-control pipeline against one
//! input artifact.
//!
//! ## Commands
//!
//! - `run`: Run every analysis stage, then aggregate the reports
//! - `stages`: Show the configured stages and the command each would run
//! - `check-config`: Validate a pipeline config file

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use qc_pipeline::{
    ExecutionMode, FailurePolicy, PipelineConfig, PipelineResult, PipelineStatus, QcPipeline,
    TemplateBindings,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{warn, Level};

#[derive(Parser)]
#[command(name = "qc")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Media quality-control pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and results
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the QC pipeline against an input artifact
    Run {
        /// Media file to check
        input: PathBuf,

        #[command(flatten)]
        source: ConfigSource,

        #[command(flatten)]
        overrides: RunOverrides,
    },

    /// List the configured stages and their commands
    Stages {
        #[command(flatten)]
        source: ConfigSource,
    },

    /// Parse and validate a pipeline config file
    CheckConfig {
        /// TOML config file
        file: PathBuf,
    },
}

/// Where the stage list comes from.
#[derive(Args, Debug)]
struct ConfigSource {
    /// Pipeline config file (TOML); the builtin stages are used when omitted
    #[arg(short, long, env = "QC_CONFIG")]
    config: Option<PathBuf>,

    /// Interpreter for the builtin stages
    #[arg(long, env = "QC_PYTHON", default_value = "python3")]
    python: String,

    /// Directory holding the builtin stage scripts
    #[arg(long, env = "QC_MODULES_DIR", default_value = "python_modules")]
    modules_dir: PathBuf,
}

impl ConfigSource {
    fn load(&self) -> Result<PipelineConfig> {
        match &self.config {
            Some(path) => PipelineConfig::from_toml_file(path)
                .with_context(|| format!("Failed to load config {}", path.display())),
            None => Ok(PipelineConfig::builtin(&self.python, &self.modules_dir)),
        }
    }
}

/// Command-line settings that take precedence over the config file.
#[derive(Args, Debug, Default)]
struct RunOverrides {
    /// Directory receiving the stage reports
    #[arg(short, long, env = "QC_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Run the analysis stages at the same time
    #[arg(long)]
    concurrent: bool,

    /// Skip aggregation when any analysis stage fails
    #[arg(long)]
    abort_on_stage_failure: bool,

    /// Default per-stage timeout in seconds (0 disables)
    #[arg(long, env = "QC_STAGE_TIMEOUT")]
    timeout: Option<u64>,
}

impl RunOverrides {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if self.concurrent {
            config.mode = ExecutionMode::Concurrent;
        }
        if self.abort_on_stage_failure {
            config.failure_policy = FailurePolicy::AbortOnStageFailure;
        }
        if let Some(secs) = self.timeout {
            config.stage_timeout_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    qc_pipeline::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            input,
            source,
            overrides,
        } => {
            let mut config = source.load()?;
            overrides.apply(&mut config);
            cmd_run(config, &input, cli.json).await
        }
        Commands::Stages { source } => cmd_stages(&source.load()?),
        Commands::CheckConfig { file } => cmd_check_config(&file),
    }
}

/// Run the pipeline, cancelling in-flight stages on Ctrl-C.
async fn cmd_run(config: PipelineConfig, input: &Path, json: bool) -> Result<()> {
    let pipeline = QcPipeline::new(config).context("Invalid pipeline configuration")?;

    let cancel = pipeline.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running stages");
            cancel.cancel();
        }
    });

    let result = pipeline.run(input).await;
    interrupt.abort();

    if json {
        println!("{}", serde_json::to_string_pretty(&result_json(&result))?);
    } else {
        print_result(&result);
    }

    match result.status {
        PipelineStatus::Completed(_) => Ok(()),
        PipelineStatus::Aborted(err) => {
            Err(anyhow::Error::new(err).context(format!("QC run {} aborted", result.run_id)))
        }
    }
}

fn print_result(result: &PipelineResult) {
    println!("Run ID: {}", result.run_id);
    println!("Config: {}", &result.config_digest[..12]);
    println!("Duration: {}ms", result.duration_ms);
    println!();

    for stage in result.analysis.iter().chain(result.aggregation.iter()) {
        let status = if stage.passed() { "✓" } else { "✗" };
        println!(
            "  {} {} ({}ms, {})",
            status,
            stage.stage_name,
            stage.result.duration_ms,
            stage.status()
        );
    }
    println!();
    println!(
        "Analysis: {}/{} stages passed",
        result.passed_count(),
        result.analysis.len()
    );

    if let Some(summary) = result.summary() {
        println!("{summary}");
    }
}

fn result_json(result: &PipelineResult) -> serde_json::Value {
    let stages: Vec<serde_json::Value> = result
        .analysis
        .iter()
        .chain(result.aggregation.iter())
        .map(|stage| {
            json!({
                "stage": stage.stage_name,
                "role": stage.role,
                "command": stage.command.to_string(),
                "exit_code": stage.result.exit_code,
                "status": stage.status().to_string(),
                "duration_ms": stage.result.duration_ms,
            })
        })
        .collect();

    json!({
        "run_id": result.run_id,
        "input": result.input,
        "started_at": result.started_at,
        "config_digest": result.config_digest,
        "duration_ms": result.duration_ms,
        "stages": stages,
        "transitions": result.transitions,
        "summary": result.summary(),
        "error": result.error().map(|e| e.to_string()),
    })
}

/// One line per stage, showing the command it would run.
fn describe_stages(config: &PipelineConfig) -> Vec<String> {
    let input = PathBuf::from(qc_pipeline::stage::INPUT_PLACEHOLDER);
    let mut lines = Vec::new();

    for stage in &config.analysis {
        let bindings = TemplateBindings {
            input: Some(input.clone()),
            output: stage.report_path(&config.output_dir),
            inputs: Vec::new(),
        };
        let state = if stage.enabled { "" } else { " (disabled)" };
        lines.push(format!(
            "[analysis] {}{}: {}",
            stage.name,
            state,
            stage.render(&bindings)
        ));
    }

    let bindings = TemplateBindings {
        input: Some(input),
        output: config.master_report_path(),
        inputs: config
            .enabled_analysis()
            .map(|s| s.report_path(&config.output_dir))
            .collect(),
    };
    lines.push(format!(
        "[aggregation] {}: {}",
        config.aggregation.name,
        config.aggregation.render(&bindings)
    ));
    lines
}

fn cmd_stages(config: &PipelineConfig) -> Result<()> {
    println!("Output directory: {}", config.output_dir.display());
    println!("Mode: {:?}, failure policy: {:?}", config.mode, config.failure_policy);
    println!();
    for line in describe_stages(config) {
        println!("  {line}");
    }
    Ok(())
}

fn cmd_check_config(file: &Path) -> Result<()> {
    let config = PipelineConfig::from_toml_file(file)
        .with_context(|| format!("Invalid config {}", file.display()))?;

    let enabled = config.enabled_analysis().count();
    println!("✓ {} is valid", file.display());
    println!(
        "Stages: {} analysis ({} enabled) + aggregation '{}'",
        config.analysis.len(),
        enabled,
        config.aggregation.name
    );
    println!("Digest: {}", config.config_digest());
    Ok(())
}
