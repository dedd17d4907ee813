//! Gateway that performs backups and restores on the local file system.
//!
//! Backups compress every file of the source tree with zstd into a new
//! snapshot directory; restores decompress a snapshot back into place.
//! A snapshot is written to a `.partial` directory first and renamed once
//! complete, so a failed entry never leaves a half-written snapshot behind.

use super::{GatewayError, GatewayReport, PrivilegedGateway};
use crate::catalog::snapshot::{self, SnapshotRecord, PAYLOAD_DIR};
use crate::config::Config;
use crate::fs::walker::{tree_stats, walk_files, WalkOptions};
use crate::manifest::ManifestEntry;
use crate::utils::errors::SessionError;
use crate::utils::format::format_bytes;
use crate::workflow::OperationKind;
use chrono::Utc;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Suffix of compressed payload files
const COMPRESSED_EXT: &str = "zst";

pub struct LocalGateway {
    backup_root: PathBuf,
    require_root: bool,
    compression_level: i32,
    skip_unchanged: bool,
    walk: WalkOptions,
    device: String,
}

impl LocalGateway {
    pub fn new(backup_root: PathBuf, require_root: bool, compression_level: i32) -> Self {
        Self {
            backup_root,
            require_root,
            compression_level,
            skip_unchanged: false,
            walk: WalkOptions::default(),
            device: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-device".to_string()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut gateway = Self::new(
            config.storage.backup_root.clone(),
            config.gateway.require_root,
            config.gateway.compression_level,
        );
        gateway.skip_unchanged = config.session.skip_unchanged;
        gateway.walk = WalkOptions::with_excludes(config.sources.exclude_names.clone());
        gateway
    }

    pub fn skip_unchanged(mut self, skip: bool) -> Self {
        self.skip_unchanged = skip;
        self
    }

    fn snapshot_dir(&self, entry: &ManifestEntry) -> PathBuf {
        snapshot::snapshot_dir(&self.backup_root, entry.kind, &entry.source_id, &entry.target_id)
    }

    fn ensure_alive(&self) -> Result<(), GatewayError> {
        if self.backup_root.is_dir() {
            Ok(())
        } else {
            Err(GatewayError::Unavailable(format!(
                "backup root {} is no longer accessible",
                self.backup_root.display()
            )))
        }
    }

    /// Map an I/O failure to a per-entry failure, unless the channel itself died
    fn report_failure(
        &self,
        context: &str,
        err: impl fmt::Display,
    ) -> Result<GatewayReport, GatewayError> {
        self.ensure_alive()?;
        warn!("{}: {}", context, err);
        Ok(GatewayReport::failed(format!("{}: {}", context, err)))
    }

    fn backup(&self, entry: &ManifestEntry) -> Result<GatewayReport, GatewayError> {
        let Some(source) = entry.location.as_deref() else {
            return Ok(GatewayReport::failed("no source location"));
        };
        if !source.is_dir() {
            return Ok(GatewayReport::failed(format!(
                "source {} is not a directory",
                source.display()
            )));
        }

        let stats = match tree_stats(source, &self.walk) {
            Ok(stats) => stats,
            Err(e) => return self.report_failure("failed to scan source", e),
        };

        if self.skip_unchanged {
            if let Some(previous) = self.latest_snapshot(entry) {
                if previous.payload_present
                    && previous.size_bytes == stats.total_bytes
                    && previous.source_mtime == stats.newest_mtime
                {
                    info!(
                        "{} unchanged since snapshot {}, skipping",
                        entry.source_id, previous.version
                    );
                    let reason = format!("unchanged since {}", previous.version);
                    return Ok(GatewayReport::skipped(reason));
                }
            }
        }

        let final_dir = self.snapshot_dir(entry);
        let staging = final_dir.with_extension(snapshot::PARTIAL_EXT);

        match self.write_snapshot(entry, source, &staging, &final_dir) {
            Ok((bytes, files)) => {
                info!(
                    "Backed up {}: {} files, {} -> {}",
                    entry.source_id,
                    files,
                    format_bytes(bytes),
                    final_dir.display()
                );
                Ok(GatewayReport::success(
                    bytes,
                    files,
                    format!(
                        "{} files ({}) written to {}",
                        files,
                        format_bytes(bytes),
                        final_dir.display()
                    ),
                ))
            }
            Err(e) => {
                if staging.exists() {
                    if let Err(cleanup) = fs::remove_dir_all(&staging) {
                        warn!("Failed to remove {}: {}", staging.display(), cleanup);
                    }
                }
                self.report_failure("backup failed", e)
            }
        }
    }

    fn write_snapshot(
        &self,
        entry: &ManifestEntry,
        source: &Path,
        staging: &Path,
        final_dir: &Path,
    ) -> Result<(u64, usize), SessionError> {
        if final_dir.exists() {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("snapshot {} already exists", final_dir.display()),
            )));
        }

        let payload = staging.join(PAYLOAD_DIR);
        fs::create_dir_all(&payload)?;

        let files = walk_files(source, &self.walk)?;
        let mut bytes = 0u64;
        let mut newest_mtime = 0i64;
        for file in &files {
            let mut target = payload.join(&file.relative_path).into_os_string();
            target.push(".");
            target.push(COMPRESSED_EXT);
            let target = PathBuf::from(target);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }

            let reader = BufReader::new(File::open(&file.path)?);
            let mut writer = BufWriter::new(File::create(&target)?);
            zstd::stream::copy_encode(reader, &mut writer, self.compression_level)?;
            writer.flush()?;

            debug!("Compressed {}", file.relative_path.display());
            bytes += file.size;
            newest_mtime = newest_mtime.max(file.mtime);
        }

        let record = SnapshotRecord {
            id: entry.source_id.clone(),
            kind: entry.kind,
            display_name: entry.source_id.clone(),
            version: entry.target_id.clone(),
            created_at: Utc::now(),
            size_bytes: bytes,
            file_count: files.len(),
            source_mtime: newest_mtime,
            source_location: source.to_path_buf(),
            device: self.device.clone(),
            preselected: true,
            payload_present: true,
            destination_occupied: false,
        };
        snapshot::write_meta(staging, &record)?;
        fs::rename(staging, final_dir)?;

        Ok((bytes, files.len()))
    }

    fn latest_snapshot(&self, entry: &ManifestEntry) -> Option<SnapshotRecord> {
        match snapshot::scan(&self.backup_root, entry.kind) {
            Ok(records) => snapshot::newest_per_id(records).remove(&entry.source_id),
            Err(e) => {
                warn!("Cannot read previous snapshots of {}: {}", entry.source_id, e);
                None
            }
        }
    }

    fn restore(&self, entry: &ManifestEntry) -> Result<GatewayReport, GatewayError> {
        let dir = self.snapshot_dir(entry);
        let record = match snapshot::read_meta(&dir) {
            Ok(record) => record,
            Err(e) => {
                let context = format!("snapshot {} unreadable", entry.target_id);
                return self.report_failure(&context, e);
            }
        };
        if !record.payload_present {
            return Ok(GatewayReport::failed(format!(
                "payload of snapshot {} is missing",
                record.version
            )));
        }

        let destination = entry
            .location
            .clone()
            .unwrap_or_else(|| record.source_location.clone());
        if destination.exists() && !entry.overwrite {
            return Ok(GatewayReport::failed(format!(
                "destination {} already exists",
                destination.display()
            )));
        }

        match self.extract_snapshot(&dir.join(PAYLOAD_DIR), &destination) {
            Ok((bytes, files)) => {
                info!(
                    "Restored {} from {}: {} files, {}",
                    entry.source_id,
                    record.version,
                    files,
                    format_bytes(bytes)
                );
                Ok(GatewayReport::success(
                    bytes,
                    files,
                    format!("{} files restored to {}", files, destination.display()),
                ))
            }
            Err(e) => self.report_failure("restore failed", e),
        }
    }

    fn extract_snapshot(
        &self,
        payload: &Path,
        destination: &Path,
    ) -> std::io::Result<(u64, usize)> {
        fs::create_dir_all(destination)?;

        // Everything under the payload belongs to the snapshot
        let files = walk_files(payload, &WalkOptions::with_excludes(Vec::new()))?;
        let mut bytes = 0u64;
        let mut restored = 0usize;
        for file in &files {
            let compressed = file
                .relative_path
                .extension()
                .is_some_and(|ext| ext == COMPRESSED_EXT);
            let relative = if compressed {
                file.relative_path.with_extension("")
            } else {
                warn!("Unexpected uncompressed file in snapshot: {}", file.relative_path.display());
                continue;
            };

            let target = destination.join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }

            let reader = BufReader::new(File::open(&file.path)?);
            let mut writer = BufWriter::new(File::create(&target)?);
            zstd::stream::copy_decode(reader, &mut writer)?;
            writer.flush()?;
            drop(writer);
            bytes += fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
            restored += 1;
        }

        Ok((bytes, restored))
    }
}

impl PrivilegedGateway for LocalGateway {
    fn connect(&self) -> Result<(), GatewayError> {
        if self.require_root && !nix::unistd::geteuid().is_root() {
            return Err(GatewayError::Unavailable(
                "root privileges are required (set gateway.require_root = false to bypass)"
                    .to_string(),
            ));
        }

        fs::create_dir_all(&self.backup_root).map_err(|e| {
            let root = self.backup_root.display();
            GatewayError::Unavailable(format!("cannot create {}: {}", root, e))
        })?;

        let probe = self.backup_root.join(".gateway-probe");
        fs::write(&probe, b"probe")
            .and_then(|_| fs::remove_file(&probe))
            .map_err(|e| {
                let root = self.backup_root.display();
                GatewayError::Unavailable(format!("{} is not writable: {}", root, e))
            })?;

        info!("Gateway connected (backup root: {})", self.backup_root.display());
        Ok(())
    }

    fn execute(&self, entry: &ManifestEntry) -> Result<GatewayReport, GatewayError> {
        self.ensure_alive()?;
        match entry.operation {
            OperationKind::Backup => self.backup(entry),
            OperationKind::Restore => self.restore(entry),
        }
    }
}
