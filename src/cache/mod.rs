//! Local cache of downloaded build logs.
//!
//! Layout: one directory per build uuid below the cache root. Each build
//! directory holds a `build.meta` sidecar with the JSON build record plus the
//! fetched log files at their relative paths:
//!
//! ```text
//! <root>/<uuid>/build.meta
//! <root>/<uuid>/job-output.txt
//! <root>/<uuid>/controller/logs/screen-n-cpu.txt
//! ```
//!
//! A cached file is never refreshed; only [`LogCache::purge`] removes it.

pub mod retention;

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::zuul::{Build, LogFetcher};

pub use retention::{CacheStats, PurgeReport, RetentionPolicy};

/// Name of the per-build metadata sidecar.
pub const METADATA_FILE: &str = "build.meta";

/// Suffix of a download in progress.
const PARTIAL_SUFFIX: &str = ".part";

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Build {0} is not cached")]
    NotFound(String),

    #[error("Invalid cache path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("Failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("Failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("Failed to delete {}: {source}", path.display())]
    Delete { path: PathBuf, source: io::Error },

    #[error("Failed to parse build metadata {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to serialize build metadata: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to scan cache: {0}")]
    Scan(#[from] walkdir::Error),
}

/// How [`LogCache::ensure`] obtained the local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Present from an earlier run; no network access happened.
    Cached,
    /// Downloaded now.
    Fetched { bytes: u64 },
    /// The download failed; an empty file stands in for it from now on.
    Placeholder { reason: String },
}

/// A log file available on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedLog {
    pub path: PathBuf,
    pub outcome: FetchOutcome,
}

/// Build log cache rooted at a local directory.
pub struct LogCache {
    root: PathBuf,
}

impl LogCache {
    /// Open the cache at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Write`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| CacheError::Write {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn build_dir(&self, uuid: &str) -> Result<PathBuf, CacheError> {
        let uuid_path = Path::new(uuid);
        let mut components = uuid_path.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(uuid_path)),
            _ => Err(CacheError::InvalidPath {
                path: uuid.to_string(),
                reason: "build uuid must be a single path component",
            }),
        }
    }

    fn metadata_path(&self, uuid: &str) -> Result<PathBuf, CacheError> {
        Ok(self.build_dir(uuid)?.join(METADATA_FILE))
    }

    /// Local path of a log file of a build, whether cached or not.
    ///
    /// `.` components are dropped before validation.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidPath`] if `relative_path` is empty,
    /// absolute, contains `..`, or names the metadata sidecar.
    pub fn local_path(&self, uuid: &str, relative_path: &str) -> Result<PathBuf, CacheError> {
        let invalid = |reason| CacheError::InvalidPath {
            path: relative_path.to_string(),
            reason,
        };

        let mut relative = PathBuf::new();
        for component in Path::new(relative_path).components() {
            match component {
                Component::ParentDir => return Err(invalid("contains '..' component")),
                Component::Prefix(_) | Component::RootDir => {
                    return Err(invalid("must be relative"));
                }
                Component::CurDir => {}
                Component::Normal(part) => relative.push(part),
            }
        }

        if relative.as_os_str().is_empty() {
            return Err(invalid("cannot be empty"));
        }
        if relative == Path::new(METADATA_FILE) {
            return Err(invalid("reserved for build metadata"));
        }

        Ok(self.build_dir(uuid)?.join(relative))
    }

    /// Write the metadata sidecar of `build`, replacing an existing one.
    ///
    /// # Errors
    ///
    /// Returns an error if the sidecar cannot be serialized or written.
    pub fn store_metadata(&self, build: &Build) -> Result<(), CacheError> {
        let path = self.metadata_path(&build.uuid)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| CacheError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let contents = serde_json::to_string(build).map_err(CacheError::Serialize)?;
        fs::write(&path, contents).map_err(|source| CacheError::Write { path, source })
    }

    /// Read the cached build record of `uuid`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotFound`] if the build has no sidecar, or a
    /// read/parse error if the sidecar is unreadable.
    pub fn get_metadata(&self, uuid: &str) -> Result<Build, CacheError> {
        let path = self.metadata_path(uuid)?;
        read_metadata(&path).map_err(|err| match err {
            CacheError::Read { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                CacheError::NotFound(uuid.to_string())
            }
            other => other,
        })
    }

    /// Make `relative_path` of `build` available locally and return its path.
    ///
    /// A file already on disk is returned without network access. Otherwise it
    /// is streamed from the build's log server into a `.part` file and renamed
    /// into place once complete. When the download fails an empty placeholder
    /// is written at the target path instead: later calls treat it as cached,
    /// so a broken download is attempted once and searching it yields no
    /// matches.
    ///
    /// # Errors
    ///
    /// Fetch failures are not errors. Errors are returned only for invalid
    /// paths and for local filesystem failures.
    pub fn ensure(
        &self,
        fetcher: &dyn LogFetcher,
        build: &Build,
        relative_path: &str,
        progress: &mut dyn FnMut(usize),
    ) -> Result<CachedLog, CacheError> {
        let target = self.local_path(&build.uuid, relative_path)?;

        if !self.metadata_path(&build.uuid)?.exists() {
            self.store_metadata(build)?;
        }

        if target.exists() {
            debug!(uuid = %build.uuid, file = relative_path, "log file already cached");
            return Ok(CachedLog {
                path: target,
                outcome: FetchOutcome::Cached,
            });
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| CacheError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let partial = partial_path(&target);
        let file = File::create(&partial).map_err(|source| CacheError::Write {
            path: partial.clone(),
            source,
        })?;
        let mut writer = BufWriter::new(file);

        let fetched = fetcher.fetch_log(build, relative_path, &mut writer, progress);
        let flushed = writer.flush();

        let outcome = match (fetched, flushed) {
            (Ok(bytes), Ok(())) => {
                drop(writer);
                fs::rename(&partial, &target).map_err(|source| CacheError::Write {
                    path: target.clone(),
                    source,
                })?;
                FetchOutcome::Fetched { bytes }
            }
            (Ok(_), Err(source)) => {
                return Err(CacheError::Write {
                    path: partial,
                    source,
                });
            }
            (Err(err), _) => {
                drop(writer);
                let _ = fs::remove_file(&partial);
                warn!(uuid = %build.uuid, file = relative_path, error = %err, "download failed, caching empty placeholder");
                File::create(&target).map_err(|source| CacheError::Write {
                    path: target.clone(),
                    source,
                })?;
                FetchOutcome::Placeholder {
                    reason: err.to_string(),
                }
            }
        };

        Ok(CachedLog {
            path: target,
            outcome,
        })
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

pub(crate) fn read_metadata(path: &Path) -> Result<Build, CacheError> {
    let contents = fs::read_to_string(path).map_err(|source| CacheError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| CacheError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
