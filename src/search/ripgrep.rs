//! Ripgrep as the grep engine.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use crate::search::{ContextOptions, LogMatcher, SearchError};

/// Searches log files by running `rg`.
pub struct RipgrepMatcher;

impl RipgrepMatcher {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Check if ripgrep is available in PATH.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::EngineMissing`] with install instructions if
    /// ripgrep is not found.
    pub fn check_available() -> Result<(), SearchError> {
        match Command::new("rg").arg("--version").output() {
            Ok(output) if output.status.success() => Ok(()),
            _ => Err(SearchError::EngineMissing),
        }
    }

    /// Arguments of one `rg` invocation.
    fn command_args(files: &[PathBuf], regex: &str, context: &ContextOptions) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "--no-config",
            "--color",
            "never",
            "--line-number",
            "--with-filename",
            "--no-heading",
            "--sort",
            "path",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        for (flag, value) in [
            ("-B", context.before),
            ("-A", context.after),
            ("-C", context.context),
        ] {
            if let Some(lines) = value {
                args.push(flag.into());
                args.push(lines.to_string().into());
            }
        }

        args.push("-e".into());
        args.push(regex.into());
        args.extend(files.iter().map(|file| file.clone().into_os_string()));
        args
    }
}

impl Default for RipgrepMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LogMatcher for RipgrepMatcher {
    fn search(
        &self,
        files: &[PathBuf],
        regex: &str,
        context: &ContextOptions,
    ) -> Result<Vec<String>, SearchError> {
        if files.is_empty() {
            return Ok(vec![]);
        }

        let args = Self::command_args(files, regex, context);
        debug!(?args, "running ripgrep");

        let output = Command::new("rg")
            .args(&args)
            .output()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => SearchError::EngineMissing,
                _ => SearchError::Spawn(err),
            })?;

        // Exit status 1 means no line matched.
        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(ToString::to_string)
                .collect()),
            Some(1) => Ok(vec![]),
            _ => Err(SearchError::Engine {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }
}
