//! Catalog source backed by the local file system.
//!
//! Applications are the sub-directories of the configured apps directory
//! (directory name = package id, optional `app.toml` with a display name).
//! Media entries come from configuration. Snapshots are read from the
//! backup root; an app snapshot restores into the configured apps directory,
//! wherever the app lived when it was backed up.

use super::snapshot::{self, SnapshotRecord};
use super::{AppRecord, CatalogSource, MediaRecord};
use crate::config::{Config, MediaSource};
use crate::fs::walker::{tree_stats, WalkOptions};
use crate::utils::errors::{Result, SessionError};
use crate::workflow::{ItemKind, WorkflowType};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Optional per-application descriptor
const APP_DESCRIPTOR: &str = "app.toml";

#[derive(Debug, Deserialize)]
struct AppDescriptor {
    name: Option<String>,
}

pub struct FsCatalogSource {
    apps_dir: PathBuf,
    media: Vec<MediaSource>,
    backup_root: PathBuf,
    walk: WalkOptions,
}

impl FsCatalogSource {
    pub fn new(
        apps_dir: PathBuf,
        media: Vec<MediaSource>,
        backup_root: PathBuf,
        walk: WalkOptions,
    ) -> Self {
        Self {
            apps_dir,
            media,
            backup_root,
            walk,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.sources.apps_dir.clone(),
            config.sources.media.clone(),
            config.storage.backup_root.clone(),
            WalkOptions::with_excludes(config.sources.exclude_names.clone()),
        )
    }

    fn app_location(&self, id: &str) -> PathBuf {
        self.apps_dir.join(id)
    }

    fn measure(&self, path: &Path) -> u64 {
        match tree_stats(path, &self.walk) {
            Ok(stats) => stats.total_bytes,
            Err(e) => {
                warn!("Failed to measure {}: {}", path.display(), e);
                0
            }
        }
    }
}

impl CatalogSource for FsCatalogSource {
    fn list_apps(&self) -> Result<Vec<AppRecord>> {
        let dir = fs::read_dir(&self.apps_dir).map_err(|e| {
            SessionError::Discovery(format!(
                "cannot read apps directory {}: {}",
                self.apps_dir.display(),
                e
            ))
        })?;

        let mut apps = Vec::new();
        for entry in dir {
            let entry = entry.map_err(|e| SessionError::Discovery(e.to_string()))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let id = entry.file_name().to_string_lossy().to_string();
            let name = read_descriptor(&path).unwrap_or_else(|| id.clone());
            let installed_at = fs::metadata(&path)
                .ok()
                .and_then(|m| m.created().or_else(|_| m.modified()).ok())
                .map(DateTime::<Utc>::from);

            apps.push(AppRecord {
                size_bytes: self.measure(&path),
                id,
                name,
                installed_at,
                location: path,
            });
        }

        apps.sort_by(|a, b| a.id.cmp(&b.id));
        debug!("Discovered {} applications in {}", apps.len(), self.apps_dir.display());
        Ok(apps)
    }

    fn list_media(&self) -> Result<Vec<MediaRecord>> {
        Ok(self
            .media
            .iter()
            .map(|media| {
                let exists = media.path.exists();
                let modified_at = fs::metadata(&media.path)
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .map(DateTime::<Utc>::from);
                MediaRecord {
                    name: media.name.clone(),
                    path: media.path.clone(),
                    size_bytes: if exists { self.measure(&media.path) } else { 0 },
                    modified_at,
                    exists,
                }
            })
            .collect())
    }

    fn list_snapshots(&self, workflow: WorkflowType) -> Result<Vec<SnapshotRecord>> {
        let kind = workflow.item_kind();
        let mut records = snapshot::scan(&self.backup_root, kind).map_err(|e| {
            SessionError::Discovery(format!(
                "cannot scan backups in {}: {}",
                self.backup_root.display(),
                e
            ))
        })?;

        if workflow.is_restore() {
            for record in &mut records {
                // The restore writes to source_location, so it is also what gets checked
                if kind == ItemKind::App {
                    record.source_location = self.app_location(&record.id);
                }
                record.destination_occupied = record.source_location.exists();
            }
        }

        Ok(records)
    }
}

fn read_descriptor(app_dir: &Path) -> Option<String> {
    let content = fs::read_to_string(app_dir.join(APP_DESCRIPTOR)).ok()?;
    match toml::from_str::<AppDescriptor>(&content) {
        Ok(descriptor) => descriptor.name,
        Err(e) => {
            warn!("Invalid {} in {}: {}", APP_DESCRIPTOR, app_dir.display(), e);
            None
        }
    }
}
