//! Job groups and stored searches declared in a directory of YAML documents.
//!
//! Every file ending in `.conf` or `.yaml` below the config directory is a
//! document with two optional keys:
//!
//! ```yaml
//! job-groups:
//!   nova-devstack: [nova-next, nova-multi-cell]
//! searches:
//!   vif-timeout:
//!     job-groups: [nova-devstack]
//!     regex: "Timeout waiting for \\[.*network-vif-plugged"
//!     files: [controller/logs/screen-n-cpu.txt]
//! ```
//!
//! Documents are merged in sorted path order; on a name collision the document
//! read last wins.

pub mod settings;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::zuul::BuildResult;

/// File name suffixes of configuration documents.
pub const CONFIG_FILE_EXTENSIONS: [&str; 2] = [".conf", ".yaml"];

/// Errors in user-supplied configuration or parameters.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "The requested job group {group} is not defined in the config files. Requested groups: {}",
        requested.join(", ")
    )]
    UndefinedJobGroup {
        group: String,
        requested: Vec<String>,
    },

    #[error(
        "The stored search {name} not found in the configuration. Available searches: {}",
        available.join(", ")
    )]
    UndefinedSearch {
        name: String,
        available: Vec<String>,
    },

    #[error("The stored search {0} does not define a regex")]
    MissingRegex(String),

    #[error("Invalid regex: '{value}'; {reason}")]
    InvalidRegex { value: String, reason: String },

    #[error("Invalid purge selection: {0}")]
    InvalidRetention(String),

    #[error("The patchset parameter is only valid if the review parameter is also provided.")]
    PatchsetWithoutReview,

    #[error("Failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Invalid config document: {0}")]
    Document(#[source] serde_yaml::Error),

    #[error("Failed to parse settings file {}: {source}", path.display())]
    Settings {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to scan config directory: {0}")]
    Scan(#[from] walkdir::Error),
}

/// A named, partial query definition.
///
/// Every field is optional; a field that is present overrides the command
/// line, even when it holds `false`, `0`, or an empty list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoredSearch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_groups: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<BuildResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voting: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_context: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_context: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<BTreeSet<String>>,
}

impl StoredSearch {
    /// Whether the search selects its own jobs instead of the command line's.
    #[must_use]
    pub fn defines_jobs(&self) -> bool {
        self.jobs.is_some() || self.job_groups.is_some()
    }
}

/// One parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConfigDocument {
    #[serde(default, rename = "job-groups")]
    pub job_groups: Option<BTreeMap<String, BTreeSet<String>>>,
    #[serde(default)]
    pub searches: Option<BTreeMap<String, StoredSearch>>,
}

impl ConfigDocument {
    /// Parse one document. Empty documents yield `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Document`] if `contents` is not a valid document.
    pub fn parse(contents: &str) -> Result<Option<Self>, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(None);
        }
        serde_yaml::from_str(contents).map_err(ConfigError::Document)
    }
}

/// Merged view of all configuration documents. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigStore {
    job_groups: BTreeMap<String, BTreeSet<String>>,
    searches: BTreeMap<String, StoredSearch>,
}

impl ConfigStore {
    /// Merge documents in order; later documents win on name collisions.
    #[must_use]
    pub fn from_documents(documents: impl IntoIterator<Item = ConfigDocument>) -> Self {
        let mut store = Self::default();
        for document in documents {
            store.job_groups.extend(document.job_groups.unwrap_or_default());
            store.searches.extend(document.searches.unwrap_or_default());
        }
        store
    }

    /// Parse and merge document contents given in read order.
    ///
    /// # Errors
    ///
    /// Returns the first parse error.
    pub fn parse_documents<'a>(
        contents: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, ConfigError> {
        let mut documents = Vec::new();
        for content in contents {
            documents.extend(ConfigDocument::parse(content)?);
        }
        Ok(Self::from_documents(documents))
    }

    /// Load every configuration document below `dir`, recursively.
    ///
    /// A missing directory yields an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if a document cannot be read or parsed.
    pub fn load_dir(dir: &Path) -> Result<Self, ConfigError> {
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "config directory does not exist");
            return Ok(Self::default());
        }

        let mut documents = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() || !is_config_file(entry.path()) {
                continue;
            }

            let path = entry.path();
            debug!(file = %path.display(), "reading config file");
            let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let document = ConfigDocument::parse(&contents).map_err(|err| match err {
                ConfigError::Document(source) => ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                },
                other => other,
            })?;
            documents.extend(document);
        }

        Ok(Self::from_documents(documents))
    }

    #[must_use]
    pub fn job_groups(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.job_groups
    }

    #[must_use]
    pub fn searches(&self) -> &BTreeMap<String, StoredSearch> {
        &self.searches
    }

    /// Look up a stored search by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UndefinedSearch`] listing the defined searches.
    pub fn search(&self, name: &str) -> Result<&StoredSearch, ConfigError> {
        self.searches
            .get(name)
            .ok_or_else(|| ConfigError::UndefinedSearch {
                name: name.to_string(),
                available: self.searches.keys().cloned().collect(),
            })
    }

    /// Union of the jobs of every requested group.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UndefinedJobGroup`] naming the first group that
    /// is not defined.
    pub fn expand_job_groups(&self, groups: &[String]) -> Result<BTreeSet<String>, ConfigError> {
        let mut jobs = BTreeSet::new();
        for group in groups {
            let members = self
                .job_groups
                .get(group)
                .ok_or_else(|| ConfigError::UndefinedJobGroup {
                    group: group.clone(),
                    requested: groups.to_vec(),
                })?;
            jobs.extend(members.iter().cloned());
        }
        Ok(jobs)
    }
}

fn is_config_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| CONFIG_FILE_EXTENSIONS.iter().any(|ext| name.ends_with(ext)))
}
