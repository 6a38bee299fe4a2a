//! Tool settings: where the Zuul API lives and where logs are cached.

use std::fs;
use std::path::{Path, PathBuf};

use directories::{BaseDirs, ProjectDirs};
use serde::Deserialize;
use tracing::debug;

use super::ConfigError;
use crate::zuul::http::DEFAULT_ZUUL_API_URL;

/// Settings file name inside the config directory.
pub const SETTINGS_FILE: &str = "logsearch.toml";

/// Config directory picked up from the working directory when present.
pub const LOCAL_CONFIG_DIR: &str = ".logsearch.conf.d";

pub const DEFAULT_LOG_STORE_DIR: &str = ".logsearch/";

/// Contents of `logsearch.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub zuul_api_url: Option<String>,
    pub log_store_dir: Option<String>,
}

impl Settings {
    /// Load `logsearch.toml` from `config_dir`, or defaults if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(SETTINGS_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }

        debug!(file = %path.display(), "reading settings");
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Settings { path, source })
    }

    /// API URL from the command line or environment, else the settings file,
    /// else the OpenDev deployment.
    #[must_use]
    pub fn zuul_api_url(&self, explicit: Option<&str>) -> String {
        explicit
            .or(self.zuul_api_url.as_deref())
            .unwrap_or(DEFAULT_ZUUL_API_URL)
            .to_string()
    }

    /// Log cache directory from the command line or environment, else the
    /// settings file, else `.logsearch/` in the working directory.
    #[must_use]
    pub fn log_store_dir(&self, explicit: Option<&Path>) -> PathBuf {
        if let Some(dir) = explicit {
            return dir.to_path_buf();
        }
        self.log_store_dir
            .as_deref()
            .map_or_else(|| PathBuf::from(DEFAULT_LOG_STORE_DIR), expand_tilde)
    }
}

/// Pick the config directory: an explicit one, else `.logsearch.conf.d/` in
/// `cwd` if it exists, else the platform config directory.
#[must_use]
pub fn resolve_config_dir(explicit: Option<&Path>, cwd: &Path) -> Option<PathBuf> {
    if let Some(dir) = explicit {
        return Some(dir.to_path_buf());
    }

    let local = cwd.join(LOCAL_CONFIG_DIR);
    if local.is_dir() {
        return Some(local);
    }

    default_config_dir()
}

/// Platform config directory, e.g. `~/.config/logsearch` on Linux.
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "logsearch").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Expand a leading `~/` to the user's home directory.
#[must_use]
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(base_dirs) = BaseDirs::new()
    {
        return base_dirs.home_dir().join(rest);
    }
    PathBuf::from(path)
}
