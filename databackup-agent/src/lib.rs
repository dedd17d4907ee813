//! Backup/restore session engine
//!
//! Drives one backup or restore session for applications or media
//! directories: enumerate candidates, select, validate into a manifest,
//! execute through a privileged gateway and persist every result.

pub mod catalog;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod fs;
pub mod gateway;
pub mod manifest;
pub mod outcome;
pub mod progress;
pub mod selection;
pub mod session_log;
pub mod utils;
pub mod workflow;

// Re-export commonly used types
pub use catalog::{Catalog, CatalogEntry, CatalogSource, FsCatalogSource};
pub use config::Config;
pub use controller::{ControllerState, SessionOptions, SessionSummary, WorkflowController};
pub use gateway::{GatewayError, LocalGateway, PrivilegedGateway};
pub use manifest::{ConflictPolicy, Manifest, ManifestEntry};
pub use outcome::{ExecutionResult, Outcome};
pub use progress::SessionProgress;
pub use session_log::SessionLog;
pub use utils::errors::{Result, SessionError};
pub use workflow::WorkflowType;
