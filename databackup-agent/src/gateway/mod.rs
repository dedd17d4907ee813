//! Privileged executor gateway.
//!
//! The gateway performs the actual backup or restore of a manifest entry
//! with elevated privileges. Expected failures (permission denied, missing
//! files, a crashing helper) are reported as data in [`GatewayReport`];
//! only a dead privileged channel is an error.

pub mod local;

use crate::manifest::ManifestEntry;
use crate::outcome::{ExecutionResult, Metrics, Outcome};
use std::time::Instant;
use thiserror::Error;

pub use local::LocalGateway;

/// Fatal gateway failure: the privileged channel cannot be used anymore
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// What the gateway reports for one executed entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayReport {
    pub outcome: Outcome,
    pub bytes: u64,
    pub files: usize,
    pub output: String,
}

impl GatewayReport {
    pub fn success(bytes: u64, files: usize, output: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Success,
            bytes,
            files,
            output: output.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            outcome: Outcome::Failed(detail.clone()),
            bytes: 0,
            files: 0,
            output: detail,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            outcome: Outcome::Skipped(reason.clone()),
            bytes: 0,
            files: 0,
            output: reason,
        }
    }
}

/// Root-capable execution channel consumed by the workflow controller.
///
/// Calls are blocking; the controller runs them on the blocking thread pool.
/// Each call must be independent of the previous one.
pub trait PrivilegedGateway: Send + Sync + 'static {
    /// Initialization handshake
    fn connect(&self) -> Result<(), GatewayError>;

    fn execute(&self, entry: &ManifestEntry) -> Result<GatewayReport, GatewayError>;
}

/// Execute one entry and turn the report into a timestamped result
pub fn run_entry(
    gateway: &dyn PrivilegedGateway,
    entry: &ManifestEntry,
) -> Result<ExecutionResult, GatewayError> {
    let started = Instant::now();
    let report = gateway.execute(entry)?;
    let metrics = Metrics {
        bytes: report.bytes,
        files: report.files,
        duration_ms: started.elapsed().as_millis() as u64,
    };
    Ok(ExecutionResult::new(entry, report.outcome, metrics, report.output))
}
