//! Configuration loading and root folder resolution
//!
//! Root folder priority order:
//! 1. Command-line argument (highest priority, applied by the binary)
//! 2. Environment variable (`SPK_ROOT_FOLDER`, then `SPK_ROOT`)
//! 3. TOML config file (`~/.config/spk/<module>.toml`, then `/etc/spk/<module>.toml`)
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing or unreadable TOML file is never fatal: a warning is logged and
//! defaults apply.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the SQLite database file inside the root folder
pub const DATABASE_FILE_NAME: &str = "spk.db";

/// Name of the directory holding uploaded audio inside the root folder
pub const UPLOADS_DIR_NAME: &str = "uploads";

/// Compiled-in defaults for the current platform
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub root_folder: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl CompiledDefaults {
    pub fn for_current_platform() -> Self {
        Self {
            root_folder: default_root_folder(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

/// Logging section of the TOML config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_file: None,
        }
    }
}

/// Contents of `<module>.toml`
///
/// Every field is optional so that partial files (or none at all) are valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub root_folder: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub bind_address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Base URL of the external ML analysis service
    #[serde(default)]
    pub ml_service_url: Option<String>,
    /// Per-stage call timeouts in milliseconds, keyed by stage name
    #[serde(default)]
    pub stage_timeouts_ms: HashMap<String, u64>,
    #[serde(default)]
    pub keepalive_secs: Option<u64>,
    #[serde(default)]
    pub event_channel_capacity: Option<usize>,
    #[serde(default)]
    pub max_subscribers_per_session: Option<usize>,
    #[serde(default)]
    pub max_upload_bytes: Option<u64>,
    #[serde(default)]
    pub auto_start_on_upload: Option<bool>,
    #[serde(default)]
    pub resume_interrupted_on_startup: Option<bool>,
}

/// Load a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML {} failed: {}", path.display(), e)))
}

/// Write a TOML config file atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Resolves the root folder for one module
pub struct RootFolderResolver {
    module_name: String,
}

impl RootFolderResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
        }
    }

    /// Candidate config file locations, most specific first
    pub fn config_file_candidates(&self) -> Vec<PathBuf> {
        let file_name = format!("{}.toml", self.module_name);
        let mut candidates = Vec::new();
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("spk").join(&file_name));
        }
        if cfg!(target_os = "linux") {
            candidates.push(PathBuf::from("/etc/spk").join(&file_name));
        }
        candidates
    }

    /// First existing config file, if any
    pub fn config_file_path(&self) -> Option<PathBuf> {
        self.config_file_candidates().into_iter().find(|p| p.exists())
    }

    /// Load this module's TOML config, falling back to defaults
    pub fn load_config(&self) -> TomlConfig {
        match self.config_file_path() {
            Some(path) => match load_toml_config(&path) {
                Ok(config) => {
                    debug!("Loaded config file: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Ignoring unreadable config file {}: {}", path.display(), e);
                    TomlConfig::default()
                }
            },
            None => {
                debug!("No config file for {}, using defaults", self.module_name);
                TomlConfig::default()
            }
        }
    }

    /// Resolve root folder from ENV → TOML → compiled default
    pub fn resolve(&self) -> PathBuf {
        self.resolve_with(&self.load_config())
    }

    /// Same as [`resolve`](Self::resolve) with an already loaded TOML config
    pub fn resolve_with(&self, toml_config: &TomlConfig) -> PathBuf {
        if let Some(path) = env_root_folder() {
            return path;
        }

        if let Some(path) = &toml_config.root_folder {
            return path.clone();
        }

        CompiledDefaults::for_current_platform().root_folder
    }
}

fn env_root_folder() -> Option<PathBuf> {
    ["SPK_ROOT_FOLDER", "SPK_ROOT"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

/// Prepares the root folder layout
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    /// Create root folder (and parents) if missing; idempotent
    pub fn ensure_directory_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_folder)?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE_NAME)
    }

    pub fn database_exists(&self) -> bool {
        self.database_path().exists()
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root_folder.join(UPLOADS_DIR_NAME)
    }
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/spk (or /var/lib/spk for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("spk"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/spk"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("spk"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/spk"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("spk"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\spk"))
    } else {
        PathBuf::from("./spk_data")
    }
}
