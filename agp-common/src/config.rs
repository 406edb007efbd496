//! Configuration loading and root folder resolution
//!
//! Resolution order for the root folder:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`AGP_ROOT_FOLDER`)
//! 3. TOML config file (`root_folder`)
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable consulted for the root folder
pub const ROOT_FOLDER_ENV: &str = "AGP_ROOT_FOLDER";

/// Database file name inside the root folder
pub const DATABASE_FILE: &str = "agriprov.db";

/// Service configuration file (`agp-verify.toml`)
///
/// Every section is optional in the file; missing values fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder holding the database and locally stored images
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub triage: TriageConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub services: ServicesConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter directive (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

/// AI score thresholds applied by triage
///
/// `deepfake_score < low_threshold` with `visual_quality_score > min_quality` approves,
/// `deepfake_score > high_threshold` rejects, anything else goes to a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageConfig {
    #[serde(default = "default_low_threshold")]
    pub low_threshold: f64,

    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,

    #[serde(default = "default_min_quality")]
    pub min_quality: f64,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            low_threshold: default_low_threshold(),
            high_threshold: default_high_threshold(),
            min_quality: default_min_quality(),
        }
    }
}

/// Concurrency caps and external call timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Upper bound on in-flight uploads/scoring calls per stage submission
    #[serde(default = "default_max_concurrent_scoring")]
    pub max_concurrent_scoring: usize,

    #[serde(default = "default_ai_timeout_ms")]
    pub ai_timeout_ms: u64,

    #[serde(default = "default_upload_timeout_ms")]
    pub upload_timeout_ms: u64,

    /// Extra attempts after a failed or timed-out upload
    #[serde(default = "default_upload_retries")]
    pub upload_retries: u32,

    #[serde(default = "default_issuer_timeout_ms")]
    pub issuer_timeout_ms: u64,

    /// Largest accepted HTTP request body; stage images travel base64-encoded
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_scoring: default_max_concurrent_scoring(),
            ai_timeout_ms: default_ai_timeout_ms(),
            upload_timeout_ms: default_upload_timeout_ms(),
            upload_retries: default_upload_retries(),
            issuer_timeout_ms: default_issuer_timeout_ms(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

/// External collaborator endpoints
///
/// Unset endpoints select the local development adapters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub image_store_url: Option<String>,

    #[serde(default)]
    pub ai_validation_url: Option<String>,

    #[serde(default)]
    pub certificate_issuer_url: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5840
}

fn default_low_threshold() -> f64 {
    0.3
}

fn default_high_threshold() -> f64 {
    0.7
}

fn default_min_quality() -> f64 {
    0.4
}

fn default_max_concurrent_scoring() -> usize {
    4
}

fn default_ai_timeout_ms() -> u64 {
    10_000
}

fn default_upload_timeout_ms() -> u64 {
    15_000
}

fn default_upload_retries() -> u32 {
    1
}

fn default_issuer_timeout_ms() -> u64 {
    30_000
}

fn default_max_request_bytes() -> usize {
    64 * 1024 * 1024
}

/// Default location of the service config file (`~/.config/agriprov/agp-verify.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("agriprov").join("agp-verify.toml"))
}

/// Load TOML configuration
///
/// A missing file yields the defaults; a present but malformed file is an error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        info!("Config file not found at {}, using defaults", path.display());
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Write TOML configuration atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;

    Ok(())
}

/// Resolve the root folder following the priority order in the module docs
pub fn resolve_root_folder(cli_arg: Option<&Path>, toml_config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
        warn!("{} is set but empty, ignoring", ROOT_FOLDER_ENV);
    }

    if let Some(path) = &toml_config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// OS-dependent default root folder
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("agriprov"))
        .unwrap_or_else(|| PathBuf::from("./agriprov_data"))
}

/// Ensures the root folder exists and derives paths inside it
pub struct RootFolder {
    path: PathBuf,
}

impl RootFolder {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.path.exists() {
            std::fs::create_dir_all(&self.path)?;
            info!("Created root folder: {}", self.path.display());
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn database_path(&self) -> PathBuf {
        self.path.join(DATABASE_FILE)
    }

    /// Directory used by the local image store
    pub fn images_dir(&self) -> PathBuf {
        self.path.join("images")
    }
}
