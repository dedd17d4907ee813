//! Snapshot metadata stored alongside each backup version.
//!
//! Layout under the backup root:
//!
//! ```text
//! <backup_root>/<app|media>/<id>/<version>/.snapshot.json
//! <backup_root>/<app|media>/<id>/<version>/files/<relative path>.zst
//! ```

use crate::utils::errors::Result;
use crate::workflow::ItemKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Metadata file written into every snapshot version directory
pub const SNAPSHOT_META_FILE: &str = ".snapshot.json";

/// Directory holding the compressed payload of a snapshot
pub const PAYLOAD_DIR: &str = "files";

/// Extension of a snapshot directory that is still being written
pub const PARTIAL_EXT: &str = "partial";

/// Metadata of one stored backup version of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub kind: ItemKind,
    pub display_name: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub file_count: usize,
    /// Newest mtime of the source tree when the snapshot was taken
    pub source_mtime: i64,
    /// Where the item lived when it was backed up (restore destination)
    pub source_location: PathBuf,
    pub device: String,
    #[serde(default = "default_preselected")]
    pub preselected: bool,

    /// Payload directory still present on disk (derived when scanning)
    #[serde(skip)]
    pub payload_present: bool,

    /// Restore destination already occupied (derived by the catalog source)
    #[serde(skip)]
    pub destination_occupied: bool,
}

fn default_preselected() -> bool {
    true
}

/// Version label for a snapshot taken at `at`
pub fn version_label(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d_%H-%M-%S-%3f").to_string()
}

/// Directory of a specific snapshot version
pub fn snapshot_dir(backup_root: &Path, kind: ItemKind, id: &str, version: &str) -> PathBuf {
    backup_root.join(kind.dir_name()).join(id).join(version)
}

/// Write `.snapshot.json` into a snapshot directory
pub fn write_meta(dir: &Path, record: &SnapshotRecord) -> Result<()> {
    let json = serde_json::to_vec_pretty(record)?;
    let tmp = dir.join(format!("{}.tmp", SNAPSHOT_META_FILE));
    fs::write(&tmp, json)?;
    fs::rename(&tmp, dir.join(SNAPSHOT_META_FILE))?;
    Ok(())
}

/// Read `.snapshot.json` from a snapshot directory
pub fn read_meta(dir: &Path) -> Result<SnapshotRecord> {
    let content = fs::read(dir.join(SNAPSHOT_META_FILE))?;
    let mut record: SnapshotRecord = serde_json::from_slice(&content)?;
    record.payload_present = dir.join(PAYLOAD_DIR).is_dir();
    Ok(record)
}

/// Scan every stored snapshot of one item kind.
///
/// A missing backup root means no snapshots. Unreadable or corrupt metadata
/// files are skipped with a warning.
pub fn scan(backup_root: &Path, kind: ItemKind) -> Result<Vec<SnapshotRecord>> {
    let kind_dir = backup_root.join(kind.dir_name());
    if !kind_dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for item in fs::read_dir(&kind_dir)? {
        let item = item?;
        if !item.file_type()?.is_dir() {
            continue;
        }

        for version in fs::read_dir(item.path())? {
            let version = version?;
            let dir = version.path();
            // Interrupted backups are never valid snapshots
            let partial = dir.extension().is_some_and(|ext| ext == PARTIAL_EXT);
            if partial || !dir.join(SNAPSHOT_META_FILE).exists() {
                continue;
            }

            match read_meta(&dir) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable snapshot {}: {}", dir.display(), e),
            }
        }
    }

    records.sort_by(|a, b| a.id.cmp(&b.id).then(a.created_at.cmp(&b.created_at)));
    Ok(records)
}

/// Keep the newest restorable snapshot for each identifier.
///
/// A version whose payload is gone only wins when no version of that
/// identifier still has its payload.
pub fn newest_per_id(records: Vec<SnapshotRecord>) -> HashMap<String, SnapshotRecord> {
    let mut newest: HashMap<String, SnapshotRecord> = HashMap::new();
    for record in records {
        match newest.get(&record.id) {
            Some(existing) if rank(existing) >= rank(&record) => {}
            _ => {
                newest.insert(record.id.clone(), record);
            }
        }
    }
    newest
}

fn rank(record: &SnapshotRecord) -> (bool, DateTime<Utc>) {
    (record.payload_present, record.created_at)
}
