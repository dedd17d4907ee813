//! Workflow types and the per-type strategy table.
//!
//! Each of the four workflows differs only in where its catalog comes from,
//! which operation its manifest entries perform and where its log lives.
//! Those differences are captured once here instead of being branched on
//! throughout the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The four symmetric workflow types a session can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    AppBackup,
    MediaBackup,
    AppRestore,
    MediaRestore,
}

/// Kind of item a workflow operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    App,
    Media,
}

impl ItemKind {
    /// Directory name used for this kind under the backup root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ItemKind::App => "app",
            ItemKind::Media => "media",
        }
    }
}

/// Operation performed by a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Backup,
    Restore,
}

/// Where a workflow's catalog is sourced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogOrigin {
    /// Live discovery of installed applications / media directories
    Live,
    /// Previously stored snapshot metadata
    Snapshots,
}

/// Static description of one workflow type.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowStrategy {
    pub workflow: WorkflowType,
    pub item_kind: ItemKind,
    pub operation: OperationKind,
    pub origin: CatalogOrigin,
    /// File stem of the session log for this workflow
    pub log_namespace: &'static str,
}

const STRATEGIES: [WorkflowStrategy; 4] = [
    WorkflowStrategy {
        workflow: WorkflowType::AppBackup,
        item_kind: ItemKind::App,
        operation: OperationKind::Backup,
        origin: CatalogOrigin::Live,
        log_namespace: "backup_app",
    },
    WorkflowStrategy {
        workflow: WorkflowType::MediaBackup,
        item_kind: ItemKind::Media,
        operation: OperationKind::Backup,
        origin: CatalogOrigin::Live,
        log_namespace: "backup_media",
    },
    WorkflowStrategy {
        workflow: WorkflowType::AppRestore,
        item_kind: ItemKind::App,
        operation: OperationKind::Restore,
        origin: CatalogOrigin::Snapshots,
        log_namespace: "restore_app",
    },
    WorkflowStrategy {
        workflow: WorkflowType::MediaRestore,
        item_kind: ItemKind::Media,
        operation: OperationKind::Restore,
        origin: CatalogOrigin::Snapshots,
        log_namespace: "restore_media",
    },
];

impl WorkflowType {
    pub const ALL: [WorkflowType; 4] = [
        WorkflowType::AppBackup,
        WorkflowType::MediaBackup,
        WorkflowType::AppRestore,
        WorkflowType::MediaRestore,
    ];

    /// Look up the strategy for this workflow type
    pub fn strategy(&self) -> &'static WorkflowStrategy {
        let index = match self {
            WorkflowType::AppBackup => 0,
            WorkflowType::MediaBackup => 1,
            WorkflowType::AppRestore => 2,
            WorkflowType::MediaRestore => 3,
        };
        &STRATEGIES[index]
    }

    pub fn item_kind(&self) -> ItemKind {
        self.strategy().item_kind
    }

    pub fn operation(&self) -> OperationKind {
        self.strategy().operation
    }

    pub fn is_restore(&self) -> bool {
        self.operation() == OperationKind::Restore
    }

    pub fn log_namespace(&self) -> &'static str {
        self.strategy().log_namespace
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowType::AppBackup => "app-backup",
            WorkflowType::MediaBackup => "media-backup",
            WorkflowType::AppRestore => "app-restore",
            WorkflowType::MediaRestore => "media-restore",
        };
        f.write_str(name)
    }
}

impl FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "app-backup" | "backup-app" => Ok(WorkflowType::AppBackup),
            "media-backup" | "backup-media" => Ok(WorkflowType::MediaBackup),
            "app-restore" | "restore-app" => Ok(WorkflowType::AppRestore),
            "media-restore" | "restore-media" => Ok(WorkflowType::MediaRestore),
            other => Err(format!("unknown workflow type: {}", other)),
        }
    }
}
