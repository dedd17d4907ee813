//! Item catalog: the set of backup/restore candidates for one session.
//!
//! Backup workflows enumerate live applications or media directories;
//! restore workflows enumerate previously stored snapshots. Either way the
//! result is an immutable [`Catalog`] owned by the workflow controller.

pub mod fs_source;
pub mod snapshot;

use crate::utils::errors::{Result, SessionError};
use crate::workflow::{CatalogOrigin, ItemKind, WorkflowType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snapshot::SnapshotRecord;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

pub use fs_source::FsCatalogSource;

/// An installed application as reported by a catalog source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRecord {
    /// Package identifier
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    pub installed_at: Option<DateTime<Utc>>,
    /// Data directory of the application
    pub location: PathBuf,
}

/// A media directory as reported by a catalog source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRecord {
    /// Unique media name
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub exists: bool,
}

/// Provider of catalog data (installed apps, media paths, stored snapshots).
pub trait CatalogSource: Send + Sync + 'static {
    fn list_apps(&self) -> Result<Vec<AppRecord>>;

    fn list_media(&self) -> Result<Vec<MediaRecord>>;

    /// Stored snapshots for the item kind of `workflow`
    fn list_snapshots(&self, workflow: WorkflowType) -> Result<Vec<SnapshotRecord>>;
}

/// One backup/restore candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub kind: ItemKind,
    pub display_name: String,
    pub size_bytes: u64,
    /// Time of the last backup (backup workflows) or of the snapshot (restore workflows)
    pub last_operation_at: Option<DateTime<Utc>>,
    /// App still installed / media path still exists / snapshot payload still present
    pub available: bool,
    pub location: Option<PathBuf>,
    /// Selected by default when a restore session starts
    #[serde(default)]
    pub preselected: bool,
}

/// Immutable snapshot of the candidates for a session.
#[derive(Debug, Clone)]
pub struct Catalog {
    workflow: WorkflowType,
    entries: Vec<CatalogEntry>,
    index: HashMap<String, usize>,
    snapshots: HashMap<String, SnapshotRecord>,
}

impl Catalog {
    /// Build a catalog, dropping duplicate identifiers (first occurrence wins).
    /// Only the newest snapshot per identifier is retained.
    pub fn new(
        workflow: WorkflowType,
        entries: Vec<CatalogEntry>,
        snapshots: Vec<SnapshotRecord>,
    ) -> Self {
        let mut unique = Vec::with_capacity(entries.len());
        let mut index = HashMap::with_capacity(entries.len());

        for entry in entries {
            if index.contains_key(&entry.id) {
                warn!("Duplicate catalog entry '{}' ignored", entry.id);
                continue;
            }
            index.insert(entry.id.clone(), unique.len());
            unique.push(entry);
        }

        Self {
            workflow,
            entries: unique,
            index,
            snapshots: snapshot::newest_per_id(snapshots),
        }
    }

    pub fn workflow(&self) -> WorkflowType {
        self.workflow
    }

    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Entries in enumeration order; restartable
    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest stored snapshot for an identifier
    pub fn snapshot_for(&self, id: &str) -> Option<&SnapshotRecord> {
        self.snapshots.get(id)
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }
}

/// Enumerate the catalog for a workflow.
///
/// Any failure of the source is reported as [`SessionError::Discovery`].
pub fn enumerate(source: &dyn CatalogSource, workflow: WorkflowType) -> Result<Catalog> {
    let strategy = workflow.strategy();
    let snapshots = source.list_snapshots(workflow).map_err(into_discovery)?;

    let entries: Vec<CatalogEntry> = match (strategy.origin, strategy.item_kind) {
        (CatalogOrigin::Live, ItemKind::App) => {
            let last = snapshot::newest_per_id(snapshots.clone());
            source
                .list_apps()
                .map_err(into_discovery)?
                .into_iter()
                .map(|app| CatalogEntry {
                    last_operation_at: last.get(&app.id).map(|s| s.created_at),
                    id: app.id,
                    kind: ItemKind::App,
                    display_name: app.name,
                    size_bytes: app.size_bytes,
                    available: true,
                    location: Some(app.location),
                    preselected: false,
                })
                .collect()
        }
        (CatalogOrigin::Live, ItemKind::Media) => {
            let last = snapshot::newest_per_id(snapshots.clone());
            source
                .list_media()
                .map_err(into_discovery)?
                .into_iter()
                .map(|media| CatalogEntry {
                    last_operation_at: last.get(&media.name).map(|s| s.created_at),
                    display_name: media.name.clone(),
                    id: media.name,
                    kind: ItemKind::Media,
                    size_bytes: media.size_bytes,
                    available: media.exists,
                    location: Some(media.path),
                    preselected: false,
                })
                .collect()
        }
        (CatalogOrigin::Snapshots, kind) => {
            let mut entries: Vec<CatalogEntry> = snapshot::newest_per_id(snapshots.clone())
                .into_values()
                .filter(|s| s.kind == kind)
                .map(|s| CatalogEntry {
                    id: s.id.clone(),
                    kind,
                    display_name: s.display_name.clone(),
                    size_bytes: s.size_bytes,
                    last_operation_at: Some(s.created_at),
                    available: s.payload_present,
                    location: Some(s.source_location.clone()),
                    preselected: s.preselected,
                })
                .collect();
            // HashMap iteration order is arbitrary
            entries.sort_by(|a, b| a.id.cmp(&b.id));
            entries
        }
    };

    debug!("Enumerated {} catalog entries for {}", entries.len(), workflow);
    Ok(Catalog::new(workflow, entries, snapshots))
}

fn into_discovery(err: SessionError) -> SessionError {
    match err {
        SessionError::Discovery(_) => err,
        other => SessionError::Discovery(other.to_string()),
    }
}
