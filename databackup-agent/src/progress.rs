//! Session progress tracking.
//!
//! [`SessionProgress`] is an immutable value derived entirely from the
//! execution results seen so far; the controller publishes a fresh one
//! after every state change.

use crate::controller::ControllerState;
use crate::outcome::{ExecutionResult, Outcome};
use serde::{Deserialize, Serialize};

/// Aggregate progress of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionProgress {
    pub state: ControllerState,

    /// Catalog enumerated and gateway connected
    pub ready: bool,

    /// Entries processed so far
    pub completed: usize,

    /// Entries in the current manifest
    pub total: usize,

    /// Entries whose outcome was not a success (skipped entries included)
    pub failed_count: usize,

    /// Entries skipped by the gateway
    pub skipped: usize,

    /// Bytes moved by successful entries
    pub bytes: u64,

    /// Identifier of the most recently processed entry
    pub current: Option<String>,

    /// Non-fatal problems, e.g. log writes that did not reach disk
    pub warnings: Vec<String>,
}

impl SessionProgress {
    /// Percentage complete (0-100)
    pub fn percent(&self) -> f64 {
        if self.total > 0 {
            ((self.completed as f64 / self.total as f64) * 100.0).min(100.0)
        } else if self.state == ControllerState::Completed {
            100.0
        } else {
            0.0
        }
    }

    pub fn succeeded(&self) -> usize {
        self.completed - self.failed_count
    }
}

/// Accumulates results into [`SessionProgress`] snapshots
#[derive(Debug, Default)]
pub struct ProgressTracker {
    catalog_ready: bool,
    gateway_ready: bool,
    completed: usize,
    total: usize,
    failed_count: usize,
    skipped: usize,
    bytes: u64,
    current: Option<String>,
    warnings: Vec<String>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_catalog_ready(&mut self) {
        self.catalog_ready = true;
    }

    pub fn mark_gateway_ready(&mut self) {
        self.gateway_ready = true;
    }

    /// True only after both initialization prerequisites completed
    pub fn is_ready(&self) -> bool {
        self.catalog_ready && self.gateway_ready
    }

    pub fn set_total(&mut self, total: usize) {
        self.total = total;
    }

    pub fn on_result(&mut self, result: &ExecutionResult) {
        self.completed += 1;
        match &result.outcome {
            Outcome::Success => self.bytes += result.metrics.bytes,
            Outcome::Skipped(_) => {
                self.skipped += 1;
                self.failed_count += 1;
            }
            Outcome::Failed(_) => self.failed_count += 1,
        }
        self.current = Some(result.source_id.clone());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn snapshot(&self, state: ControllerState) -> SessionProgress {
        SessionProgress {
            state,
            ready: self.is_ready(),
            completed: self.completed,
            total: self.total,
            failed_count: self.failed_count,
            skipped: self.skipped,
            bytes: self.bytes,
            current: self.current.clone(),
            warnings: self.warnings.clone(),
        }
    }
}
