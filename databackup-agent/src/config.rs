//! Configuration management for the session engine.
//!
//! Loads configuration from a TOML file; every field except the storage and
//! source locations has a default.

use crate::manifest::ConflictPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    pub storage: StorageConfig,
    pub sources: SourcesConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How restore name collisions are handled (fail, skip, overwrite)
    #[serde(default = "default_conflict_policy")]
    pub conflict_policy: ConflictPolicy,

    /// Reject manifests without a single executable entry
    #[serde(default = "default_require_non_empty")]
    pub require_non_empty: bool,

    /// Maximum number of entries executed at once (1 = sequential)
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Skip backups of items unchanged since their last snapshot
    #[serde(default)]
    pub skip_unchanged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for stored snapshots
    pub backup_root: PathBuf,

    /// Directory for per-workflow session logs
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Directory whose sub-directories are application data directories
    pub apps_dir: PathBuf,

    /// Media directories eligible for backup
    #[serde(default)]
    pub media: Vec<MediaSource>,

    /// File or directory names never included in a backup
    #[serde(default = "default_exclude_names")]
    pub exclude_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSource {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Refuse to connect unless running with effective uid 0
    #[serde(default = "default_require_root")]
    pub require_root: bool,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_conflict_policy() -> ConflictPolicy {
    ConflictPolicy::Skip
}

fn default_require_non_empty() -> bool {
    true
}

fn default_parallelism() -> usize {
    1
}

fn default_exclude_names() -> Vec<String> {
    vec!["cache".to_string(), "code_cache".to_string(), ".thumbnails".to_string()]
}

fn default_require_root() -> bool {
    true
}

fn default_compression_level() -> i32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            conflict_policy: default_conflict_policy(),
            require_non_empty: default_require_non_empty(),
            parallelism: default_parallelism(),
            skip_unchanged: false,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            require_root: default_require_root(),
            compression_level: default_compression_level(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default() -> Self {
        Config {
            session: SessionConfig::default(),
            storage: StorageConfig {
                backup_root: PathBuf::from("/data/backup"),
                log_dir: PathBuf::from("/data/backup/log"),
            },
            sources: SourcesConfig {
                apps_dir: PathBuf::from("/data/data"),
                media: vec![
                    MediaSource {
                        name: "pictures".to_string(),
                        path: PathBuf::from("/sdcard/Pictures"),
                    },
                    MediaSource {
                        name: "music".to_string(),
                        path: PathBuf::from("/sdcard/Music"),
                    },
                ],
                exclude_names: default_exclude_names(),
            },
            gateway: GatewayConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.session.parallelism == 0 {
            anyhow::bail!("session.parallelism must be at least 1");
        }

        if !(1..=22).contains(&self.gateway.compression_level) {
            anyhow::bail!(
                "gateway.compression_level must be between 1 and 22, got {}",
                self.gateway.compression_level
            );
        }

        let mut names = HashSet::new();
        for media in &self.sources.media {
            if media.name.trim().is_empty() || media.name.contains('/') {
                anyhow::bail!("invalid media name '{}'", media.name);
            }
            if !names.insert(media.name.as_str()) {
                anyhow::bail!("duplicate media name '{}'", media.name);
            }
        }

        Ok(())
    }
}
