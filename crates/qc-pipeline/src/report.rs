//! Master report decoding and the operator summary.

use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Errors raised while reading the master report.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to read master report {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed master report {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// The fields of the aggregated report the pipeline relies on.
///
/// Unknown fields are ignored; `overall_status` and `timeline` must be
/// present with the right types.
#[derive(Debug, Deserialize)]
pub struct MasterReport {
    /// Verdict for the whole asset, surfaced verbatim.
    pub overall_status: String,

    /// Merged event timeline; only its length is used.
    pub timeline: Vec<IgnoredAny>,

    /// Number of analysis reports the aggregator merged, when reported.
    #[serde(default)]
    pub modules_run: Option<u64>,
}

impl MasterReport {
    /// Decode a report from raw JSON bytes.
    pub fn from_slice(path: &Path, bytes: &[u8]) -> Result<Self, ReportError> {
        serde_json::from_slice(bytes).map_err(|source| ReportError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read and decode the report at `path`.
    pub async fn load(path: &Path) -> Result<Self, ReportError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ReportError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_slice(path, &bytes)
    }

    pub fn event_count(&self) -> usize {
        self.timeline.len()
    }

    /// Summarise the report stored at `location`.
    pub fn summarize(&self, location: &Path) -> ReportSummary {
        ReportSummary {
            overall_status: self.overall_status.clone(),
            event_count: self.event_count(),
            location: location.to_path_buf(),
            modules_run: self.modules_run,
        }
    }
}

/// Final result shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub overall_status: String,
    pub event_count: usize,
    pub location: PathBuf,
    pub modules_run: Option<u64>,
}

const RULE: &str = "==========================================";

impl fmt::Display for ReportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{RULE}")?;
        writeln!(f, " QC COMPLETED")?;
        writeln!(f, " Overall Status: {}", self.overall_status)?;
        writeln!(f, " Events Found: {}", self.event_count)?;
        if let Some(modules) = self.modules_run {
            writeln!(f, " Modules Merged: {modules}")?;
        }
        writeln!(f, " Report Location: {}", self.location.display())?;
        write!(f, "{RULE}")
    }
}
