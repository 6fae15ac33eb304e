//! Configuration loading and root folder resolution

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::dataset::DEFAULT_CACHE_TTL_SECS;
use crate::{Error, Result};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "MCN_ROOT_FOLDER";

/// Application directory name under the platform config/data dirs
const APP_DIR: &str = "mcn-sync";

/// Store file name inside the root folder
const DATABASE_FILE: &str = "mcn.db";

/// TOML configuration file contents
///
/// Every section is optional; missing values fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub root_folder: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub dataset: DatasetConfig,
    pub harvest: HarvestConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Remote dataset location and cache lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub path: String,
    /// Full URL override; takes precedence over the GitHub fields
    pub url: Option<String>,
    pub cache_ttl_secs: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            owner: "ByronLeeeee".to_string(),
            repo: "zhihu-mcn-data".to_string(),
            branch: "main".to_string(),
            path: "mcn-data.json".to_string(),
            url: None,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
        }
    }
}

impl DatasetConfig {
    /// Raw-content URL of the shared dataset
    pub fn resolved_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "https://raw.githubusercontent.com/{}/{}/{}/{}",
                self.owner, self.repo, self.branch, self.path
            ),
        }
    }

    pub fn cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Background harvest timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    /// Wait before and after expanding the profile details
    pub settle_delay_ms: u64,
    pub profile_base_url: String,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            timeout_ms: 10_000,
            settle_delay_ms: 1_000,
            profile_base_url: "https://www.zhihu.com/people".to_string(),
        }
    }
}

/// Default configuration file path (`~/.config/mcn-sync/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"))
}

/// Load TOML configuration
///
/// A missing file is not an error: defaults are returned with a warning.
/// A file that exists but cannot be parsed is a configuration error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!("Config file {} not found, using defaults", path.display());
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Write TOML configuration, creating parent directories
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize config failed: {}", e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&Path>, toml_config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml_config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("./mcn_data"))
}

/// Store file inside a root folder
pub fn database_path(root_folder: &Path) -> PathBuf {
    root_folder.join(DATABASE_FILE)
}

/// Default export directory inside a root folder
pub fn exports_dir(root_folder: &Path) -> PathBuf {
    root_folder.join("exports")
}
