//! Per-entry execution results.

use crate::manifest::ManifestEntry;
use crate::workflow::OperationKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of executing one manifest entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed(String),
    Skipped(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Failed(detail) => write!(f, "failed: {}", detail),
            Outcome::Skipped(reason) => write!(f, "skipped: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub bytes: u64,
    pub files: usize,
    pub duration_ms: u64,
}

/// Immutable record of one executed manifest entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub target_id: String,
    pub operation: OperationKind,
    pub outcome: Outcome,
    pub metrics: Metrics,
    /// Raw gateway output
    #[serde(default)]
    pub output: String,
}

impl ExecutionResult {
    pub fn new(entry: &ManifestEntry, outcome: Outcome, metrics: Metrics, output: String) -> Self {
        Self {
            timestamp: Utc::now(),
            source_id: entry.source_id.clone(),
            target_id: entry.target_id.clone(),
            operation: entry.operation,
            outcome,
            metrics,
            output,
        }
    }

    /// Result for a gateway call that died without reporting (panic, crash)
    pub fn crashed(entry: &ManifestEntry, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::new(
            entry,
            Outcome::Failed(format!("gateway call crashed: {}", detail)),
            Metrics::default(),
            detail,
        )
    }
}
