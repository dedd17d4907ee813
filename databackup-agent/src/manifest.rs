//! Manifest building: turns a selection into the ordered list of operations
//! a session will execute.
//!
//! Each selected entry is validated against the catalog. `Missing` entries
//! are never executable; `Conflict` entries are handled according to the
//! session's [`ConflictPolicy`]. Building is pure: the same selection and
//! catalog always produce the same manifest.

use crate::catalog::{Catalog, CatalogEntry};
use crate::selection::SelectionSet;
use crate::utils::errors::{Result, SessionError};
use crate::workflow::{ItemKind, OperationKind, WorkflowType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info};

/// How restore destinations that already exist are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Abort the manifest build
    Fail,
    /// Exclude the entry from the manifest
    Skip,
    /// Keep the entry and let the gateway overwrite the destination
    Overwrite,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(ConflictPolicy::Fail),
            "skip" => Ok(ConflictPolicy::Skip),
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            other => Err(format!("unknown conflict policy: {}", other)),
        }
    }
}

/// Validation outcome of one manifest entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ValidationStatus {
    Ok,
    Conflict(String),
    Missing(String),
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStatus::Ok => f.write_str("ok"),
            ValidationStatus::Conflict(reason) => write!(f, "conflict: {}", reason),
            ValidationStatus::Missing(reason) => write!(f, "missing: {}", reason),
        }
    }
}

/// One planned operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub source_id: String,
    /// Snapshot version written (backup) or read (restore)
    pub target_id: String,
    pub kind: ItemKind,
    pub operation: OperationKind,
    pub status: ValidationStatus,
    /// Gateway may replace an existing destination
    pub overwrite: bool,
    /// Source directory (backup) or destination directory (restore)
    pub location: Option<PathBuf>,
    pub size_bytes: u64,
}

/// A validated manifest: the executable entries plus the rejected ones
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    workflow: WorkflowType,
    entries: Vec<ManifestEntry>,
    rejected: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn workflow(&self) -> WorkflowType {
        self.workflow
    }

    /// Executable entries in execution order
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Entries excluded by validation or conflict policy
    pub fn rejected(&self) -> &[ManifestEntry] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }
}

#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    pub policy: ConflictPolicy,
    pub require_non_empty: bool,
    /// Version label given to snapshots created by backup entries
    pub backup_version: String,
}

impl ManifestBuilder {
    pub fn new(
        policy: ConflictPolicy,
        require_non_empty: bool,
        backup_version: impl Into<String>,
    ) -> Self {
        Self {
            policy,
            require_non_empty,
            backup_version: backup_version.into(),
        }
    }

    /// Build the manifest for the current selection.
    ///
    /// Entries keep the selection's order. Every workflow touches a single
    /// item kind, so no cross-kind reordering is needed.
    pub fn build(&self, selection: &SelectionSet, catalog: &Catalog) -> Result<Manifest> {
        let workflow = catalog.workflow();
        let mut entries = Vec::new();
        let mut rejected = Vec::new();

        for id in selection.iter() {
            let catalog_entry = catalog
                .get(id)
                .ok_or_else(|| SessionError::UnknownEntry(id.to_string()))?;

            let mut entry = self.plan(workflow, catalog_entry, catalog);
            match &entry.status {
                ValidationStatus::Ok => entries.push(entry),
                ValidationStatus::Missing(reason) => {
                    debug!("Excluding {}: {}", entry.source_id, reason);
                    rejected.push(entry);
                }
                ValidationStatus::Conflict(reason) => match self.policy {
                    ConflictPolicy::Fail => {
                        return Err(SessionError::ManifestConflict {
                            id: entry.source_id.clone(),
                            reason: reason.clone(),
                        });
                    }
                    ConflictPolicy::Skip => {
                        debug!("Skipping conflicting {}: {}", entry.source_id, reason);
                        rejected.push(entry);
                    }
                    ConflictPolicy::Overwrite => {
                        entry.overwrite = true;
                        entries.push(entry);
                    }
                },
            }
        }

        if entries.is_empty() && self.require_non_empty {
            return Err(SessionError::EmptyManifest);
        }

        info!(
            "Manifest for {}: {} entries, {} rejected",
            workflow,
            entries.len(),
            rejected.len()
        );

        Ok(Manifest {
            workflow,
            entries,
            rejected,
        })
    }

    fn plan(
        &self,
        workflow: WorkflowType,
        catalog_entry: &CatalogEntry,
        catalog: &Catalog,
    ) -> ManifestEntry {
        let operation = workflow.operation();
        let (target_id, status) = match operation {
            OperationKind::Backup => {
                let status = if catalog_entry.available {
                    ValidationStatus::Ok
                } else {
                    ValidationStatus::Missing("source is no longer available".to_string())
                };
                (self.backup_version.clone(), status)
            }
            OperationKind::Restore => match catalog.snapshot_for(&catalog_entry.id) {
                None => (
                    String::new(),
                    ValidationStatus::Missing("no backup snapshot found".to_string()),
                ),
                Some(snapshot) if !snapshot.payload_present => (
                    snapshot.version.clone(),
                    ValidationStatus::Missing(format!(
                        "payload of snapshot {} is gone",
                        snapshot.version
                    )),
                ),
                Some(snapshot) if snapshot.destination_occupied => (
                    snapshot.version.clone(),
                    ValidationStatus::Conflict("restore destination already exists".to_string()),
                ),
                Some(snapshot) => (snapshot.version.clone(), ValidationStatus::Ok),
            },
        };

        ManifestEntry {
            source_id: catalog_entry.id.clone(),
            target_id,
            kind: catalog_entry.kind,
            operation,
            status,
            overwrite: false,
            location: catalog_entry.location.clone(),
            size_bytes: catalog_entry.size_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{entry, snapshot};

    fn builder(policy: ConflictPolicy) -> ManifestBuilder {
        ManifestBuilder::new(policy, true, "v-test")
    }

    fn select(catalog: &Catalog, ids: &[&str]) -> SelectionSet {
        let mut selection = SelectionSet::new();
        for id in ids {
            selection.select(catalog, id).unwrap();
        }
        selection
    }

    #[test]
    fn test_missing_backup_source_is_excluded() {
        let catalog = Catalog::new(
            WorkflowType::AppBackup,
            vec![entry("a", true), entry("b", true), entry("c", false)],
            vec![],
        );
        let selection = select(&catalog, &["a", "c"]);

        let manifest = builder(ConflictPolicy::Skip).build(&selection, &catalog).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.entries()[0].source_id, "a");
        assert_eq!(manifest.entries()[0].target_id, "v-test");
        assert_eq!(manifest.entries()[0].operation, OperationKind::Backup);
        assert_eq!(manifest.rejected().len(), 1);
        assert!(matches!(manifest.rejected()[0].status, ValidationStatus::Missing(_)));
    }

    #[test]
    fn test_restore_without_snapshot_yields_empty_manifest() {
        let catalog = Catalog::new(
            WorkflowType::AppRestore,
            vec![entry("x", true)],
            vec![snapshot("y", ItemKind::App, "v1", 1)],
        );
        let selection = select(&catalog, &["x"]);

        let err = builder(ConflictPolicy::Skip).build(&selection, &catalog).unwrap_err();
        assert!(matches!(err, SessionError::EmptyManifest));

        let lenient = ManifestBuilder::new(ConflictPolicy::Skip, false, "v-test");
        let manifest = lenient.build(&selection, &catalog).unwrap();
        assert!(manifest.is_empty());
        assert_eq!(
            manifest.rejected()[0].status,
            ValidationStatus::Missing("no backup snapshot found".to_string())
        );
    }

    #[test]
    fn test_empty_selection() {
        let catalog = Catalog::new(WorkflowType::AppBackup, vec![entry("a", true)], vec![]);
        let selection = SelectionSet::new();

        assert!(matches!(
            builder(ConflictPolicy::Skip).build(&selection, &catalog),
            Err(SessionError::EmptyManifest)
        ));
    }

    fn conflicting_restore() -> (Catalog, SelectionSet) {
        let mut occupied = snapshot("a", ItemKind::App, "v7", 2);
        occupied.destination_occupied = true;
        let catalog = Catalog::new(
            WorkflowType::AppRestore,
            vec![entry("a", true), entry("b", true)],
            vec![occupied, snapshot("b", ItemKind::App, "v3", 1)],
        );
        let selection = select(&catalog, &["a", "b"]);
        (catalog, selection)
    }

    #[test]
    fn test_conflict_policy_fail() {
        let (catalog, selection) = conflicting_restore();
        let err = builder(ConflictPolicy::Fail).build(&selection, &catalog).unwrap_err();
        assert!(matches!(err, SessionError::ManifestConflict { id, .. } if id == "a"));
    }

    #[test]
    fn test_conflict_policy_skip() {
        let (catalog, selection) = conflicting_restore();
        let manifest = builder(ConflictPolicy::Skip).build(&selection, &catalog).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.entries()[0].source_id, "b");
        assert_eq!(manifest.entries()[0].target_id, "v3");
    }

    #[test]
    fn test_conflict_policy_overwrite() {
        let (catalog, selection) = conflicting_restore();
        let manifest = builder(ConflictPolicy::Overwrite).build(&selection, &catalog).unwrap();
        assert_eq!(manifest.len(), 2);
        let first = &manifest.entries()[0];
        assert_eq!(first.source_id, "a");
        assert!(first.overwrite);
        assert!(matches!(first.status, ValidationStatus::Conflict(_)));
        assert!(!manifest.entries()[1].overwrite);
    }

    #[test]
    fn test_gone_payload_is_missing() {
        let mut gone = snapshot("a", ItemKind::App, "v1", 1);
        gone.payload_present = false;
        let catalog = Catalog::new(WorkflowType::AppRestore, vec![entry("a", true)], vec![gone]);
        let selection = select(&catalog, &["a"]);

        let manifest = ManifestBuilder::new(ConflictPolicy::Overwrite, false, "v")
            .build(&selection, &catalog)
            .unwrap();
        assert!(manifest.is_empty());
        assert!(matches!(manifest.rejected()[0].status, ValidationStatus::Missing(_)));
    }

    #[test]
    fn test_restore_falls_back_to_older_intact_snapshot() {
        let mut gone = snapshot("a", ItemKind::App, "v2", 2);
        gone.payload_present = false;
        let catalog = Catalog::new(
            WorkflowType::AppRestore,
            vec![entry("a", true)],
            vec![snapshot("a", ItemKind::App, "v1", 1), gone],
        );
        let selection = select(&catalog, &["a"]);

        let manifest = builder(ConflictPolicy::Skip).build(&selection, &catalog).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.entries()[0].status, ValidationStatus::Ok);
        assert_eq!(manifest.entries()[0].target_id, "v1");
    }

    #[test]
    fn test_build_is_idempotent_and_ordered() {
        let catalog = Catalog::new(
            WorkflowType::AppBackup,
            vec![entry("a", true), entry("b", true), entry("c", true)],
            vec![],
        );
        let selection = select(&catalog, &["c", "a", "b"]);
        let builder = builder(ConflictPolicy::Skip);

        let first = builder.build(&selection, &catalog).unwrap();
        let second = builder.build(&selection, &catalog).unwrap();
        assert_eq!(first, second);

        let order: Vec<_> = first.entries().iter().map(|e| e.source_id.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
        assert_eq!(first.total_bytes(), 30);
    }

    #[test]
    fn test_parse_conflict_policy() {
        assert_eq!("Skip".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Skip);
        assert_eq!("overwrite".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Overwrite);
        assert!("merge".parse::<ConflictPolicy>().is_err());
    }
}
