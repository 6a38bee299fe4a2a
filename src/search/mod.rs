//! Searching the cached logs of a build.
//!
//! The matching itself is done by an external grep engine behind
//! [`LogMatcher`]. Its output follows the grep conventions and is passed on
//! unchanged:
//!
//! ```text
//! <file>:<line>:<text>    match
//! <file>-<line>-<text>    context
//! --                      separator between non-adjacent blocks
//! ```

pub mod ripgrep;

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::cache::{CacheError, CachedLog, LogCache};
use crate::zuul::{Build, LogFetcher};

/// Errors running the grep engine.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error(
        "ripgrep not found\n\n\
        Install ripgrep:\n  \
        brew install ripgrep    # macOS\n  \
        cargo install ripgrep   # any platform\n  \
        apt install ripgrep     # Debian/Ubuntu"
    )]
    EngineMissing,

    #[error("Failed to run ripgrep: {0}")]
    Spawn(#[source] io::Error),

    #[error("ripgrep failed ({status}): {stderr}")]
    Engine { status: String, stderr: String },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Context line counts passed to the grep engine.
///
/// `context` applies to both sides; all three are passed on independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextOptions {
    pub before: Option<u32>,
    pub after: Option<u32>,
    pub context: Option<u32>,
}

/// A grep engine searching local files.
pub trait LogMatcher {
    /// Run one search over all `files` and return the output lines in order.
    /// No output means no match.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is missing or fails.
    fn search(
        &self,
        files: &[PathBuf],
        regex: &str,
        context: &ContextOptions,
    ) -> Result<Vec<String>, SearchError>;
}

/// One classified line of grep output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrepLine<'a> {
    Match {
        file: &'a str,
        line_number: u64,
        text: &'a str,
    },
    Context {
        file: &'a str,
        line_number: u64,
        text: &'a str,
    },
    Separator,
}

impl<'a> GrepLine<'a> {
    /// Classify `line` given the files that were searched.
    ///
    /// Knowing the file names keeps parsing unambiguous when a path itself
    /// contains `:` or `-`. Returns `None` for lines of any other shape.
    #[must_use]
    pub fn parse(line: &'a str, files: &[PathBuf]) -> Option<Self> {
        if line == "--" {
            return Some(Self::Separator);
        }

        files
            .iter()
            .filter_map(|file| file.to_str())
            .filter(|file| line.starts_with(file))
            .max_by_key(|file| file.len())
            .and_then(|file| Self::parse_after_file(line, file))
    }

    fn parse_after_file(line: &'a str, file: &str) -> Option<Self> {
        let (file, rest) = line.split_at(file.len());
        let separator = rest.chars().next().filter(|c| *c == ':' || *c == '-')?;
        let (number, text) = rest[1..].split_once(separator)?;
        let line_number = number.parse().ok()?;

        Some(if separator == ':' {
            Self::Match {
                file,
                line_number,
                text,
            }
        } else {
            Self::Context {
                file,
                line_number,
                text,
            }
        })
    }
}

/// Grep output for one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildMatches {
    pub uuid: String,
    pub files: Vec<PathBuf>,
    pub lines: Vec<String>,
}

impl BuildMatches {
    #[must_use]
    pub fn is_match(&self) -> bool {
        !self.lines.is_empty()
    }

    /// Output lines prefixed with the build uuid, as shown to the user.
    pub fn prefixed_lines(&self) -> impl Iterator<Item = String> + '_ {
        self.lines.iter().map(|line| format!("{}:{line}", self.uuid))
    }

    /// Number of match lines, not counting context lines and separators.
    #[must_use]
    pub fn match_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| matches!(GrepLine::parse(line, &self.files), Some(GrepLine::Match { .. })))
            .count()
    }
}

/// Makes the requested files of a build available and searches them together.
pub struct MultiFileMatcher<'a> {
    cache: &'a LogCache,
    fetcher: &'a dyn LogFetcher,
    engine: &'a dyn LogMatcher,
}

impl<'a> MultiFileMatcher<'a> {
    #[must_use]
    pub fn new(cache: &'a LogCache, fetcher: &'a dyn LogFetcher, engine: &'a dyn LogMatcher) -> Self {
        Self {
            cache,
            fetcher,
            engine,
        }
    }

    /// Ensure every file of `files` is cached for `build`, in order.
    ///
    /// `on_file` is called after each file with its relative path and
    /// outcome; `progress` receives the file being downloaded and its chunk
    /// count so far.
    ///
    /// # Errors
    ///
    /// Returns cache errors. Download failures are not errors; they leave an
    /// empty placeholder behind.
    pub fn ensure_files(
        &self,
        build: &Build,
        files: &BTreeSet<String>,
        progress: &mut dyn FnMut(&str, usize),
        on_file: &mut dyn FnMut(&str, &CachedLog),
    ) -> Result<Vec<PathBuf>, SearchError> {
        let mut paths = Vec::with_capacity(files.len());
        for file in files {
            let log = self
                .cache
                .ensure(self.fetcher, build, file, &mut |chunks| progress(file.as_str(), chunks))?;
            on_file(file, &log);
            paths.push(log.path);
        }
        Ok(paths)
    }

    /// Search the given local files of `build` in one engine invocation.
    ///
    /// # Errors
    ///
    /// Returns engine errors.
    pub fn search_files(
        &self,
        build: &Build,
        paths: Vec<PathBuf>,
        regex: &str,
        context: &ContextOptions,
    ) -> Result<BuildMatches, SearchError> {
        let lines = if paths.is_empty() {
            Vec::new()
        } else {
            self.engine.search(&paths, regex, context)?
        };

        let matches = BuildMatches {
            uuid: build.uuid.clone(),
            files: paths,
            lines,
        };
        debug!(uuid = %matches.uuid, matches = matches.match_count(), "searched build logs");
        Ok(matches)
    }

    /// [`MultiFileMatcher::ensure_files`] followed by
    /// [`MultiFileMatcher::search_files`], without progress reporting.
    ///
    /// # Errors
    ///
    /// Returns cache and engine errors.
    pub fn search_build(
        &self,
        build: &Build,
        files: &BTreeSet<String>,
        regex: &str,
        context: &ContextOptions,
    ) -> Result<BuildMatches, SearchError> {
        let paths = self.ensure_files(build, files, &mut |_, _| {}, &mut |_, _| {})?;
        self.search_files(build, paths, regex, context)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::cache::FetchOutcome;
    use crate::cache::tests::{FakeFetcher, build};

    /// Substring matcher producing grep-shaped output, with no context support.
    #[derive(Default)]
    struct SubstringMatcher {
        calls: RefCell<Vec<Vec<PathBuf>>>,
    }

    impl LogMatcher for SubstringMatcher {
        fn search(
            &self,
            files: &[PathBuf],
            regex: &str,
            _context: &ContextOptions,
        ) -> Result<Vec<String>, SearchError> {
            self.calls.borrow_mut().push(files.to_vec());
            let mut lines = Vec::new();
            for file in files {
                let content = fs::read_to_string(file).map_err(SearchError::Spawn)?;
                for (index, line) in content.lines().enumerate() {
                    if line.contains(regex) {
                        lines.push(format!("{}:{}:{line}", file.display(), index + 1));
                    }
                }
            }
            Ok(lines)
        }
    }

    fn files(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(ToString::to_string).collect()
    }

    mod grep_line_tests {
        use super::*;

        #[test]
        fn classifies_lines() {
            let files = vec![PathBuf::from("logs/a.txt")];

            assert_eq!(
                GrepLine::parse("logs/a.txt:12:ERROR: boom", &files),
                Some(GrepLine::Match {
                    file: "logs/a.txt",
                    line_number: 12,
                    text: "ERROR: boom",
                })
            );
            assert_eq!(
                GrepLine::parse("logs/a.txt-11-before - line", &files),
                Some(GrepLine::Context {
                    file: "logs/a.txt",
                    line_number: 11,
                    text: "before - line",
                })
            );
            assert_eq!(GrepLine::parse("--", &files), Some(GrepLine::Separator));
        }

        #[test]
        fn path_with_separators_is_unambiguous() {
            let files = vec![
                PathBuf::from("cache/u-1/a:b-1.txt"),
                PathBuf::from("cache/u-1/a"),
            ];

            assert_eq!(
                GrepLine::parse("cache/u-1/a:b-1.txt-3-x:1:y", &files),
                Some(GrepLine::Context {
                    file: "cache/u-1/a:b-1.txt",
                    line_number: 3,
                    text: "x:1:y",
                })
            );
        }

        #[test]
        fn unknown_shapes_are_none() {
            let files = vec![PathBuf::from("a.txt")];

            assert_eq!(GrepLine::parse("b.txt:1:x", &files), None);
            assert_eq!(GrepLine::parse("a.txt:x:y", &files), None);
            assert_eq!(GrepLine::parse("a.txt", &files), None);
        }
    }

    mod matcher_tests {
        use super::*;

        #[test]
        fn searches_all_files_in_one_call() {
            let dir = TempDir::new().unwrap();
            let cache = LogCache::open(dir.path()).unwrap();
            let fetcher = FakeFetcher::default()
                .with_log("u1", "a.txt", "ok\nERROR one\n")
                .with_log("u1", "b.txt", "ERROR two\n");
            let engine = SubstringMatcher::default();
            let matcher = MultiFileMatcher::new(&cache, &fetcher, &engine);

            let matches = matcher
                .search_build(
                    &build("u1", "2022-02-09T16:57:33"),
                    &files(&["a.txt", "b.txt"]),
                    "ERROR",
                    &ContextOptions::default(),
                )
                .unwrap();

            assert_eq!(engine.calls.borrow().len(), 1);
            assert_eq!(engine.calls.borrow()[0].len(), 2);
            assert!(matches.is_match());
            assert_eq!(matches.match_count(), 2);
            let prefixed: Vec<String> = matches.prefixed_lines().collect();
            assert!(prefixed[0].starts_with("u1:"));
            assert!(prefixed[0].ends_with("a.txt:2:ERROR one"));
        }

        #[test]
        fn failed_download_is_searched_as_empty() {
            let dir = TempDir::new().unwrap();
            let cache = LogCache::open(dir.path()).unwrap();
            let fetcher = FakeFetcher::default();
            let engine = SubstringMatcher::default();
            let matcher = MultiFileMatcher::new(&cache, &fetcher, &engine);
            let mut outcomes = Vec::new();

            let build = build("u1", "2022-02-09T16:57:33");
            let paths = matcher
                .ensure_files(&build, &files(&["missing.txt"]), &mut |_, _| {}, &mut |file, log| {
                    outcomes.push((file.to_string(), log.outcome.clone()));
                })
                .unwrap();
            let matches = matcher
                .search_files(&build, paths, "ERROR", &ContextOptions::default())
                .unwrap();

            assert!(!matches.is_match());
            assert_eq!(outcomes.len(), 1);
            assert!(matches!(outcomes[0].1, FetchOutcome::Placeholder { .. }));
        }

        #[test]
        fn no_files_skips_the_engine() {
            let dir = TempDir::new().unwrap();
            let cache = LogCache::open(dir.path()).unwrap();
            let fetcher = FakeFetcher::default();
            let engine = SubstringMatcher::default();
            let matcher = MultiFileMatcher::new(&cache, &fetcher, &engine);

            let matches = matcher
                .search_files(
                    &build("u1", "2022-02-09T16:57:33"),
                    Vec::new(),
                    "x",
                    &ContextOptions::default(),
                )
                .unwrap();

            assert!(!matches.is_match());
            assert!(engine.calls.borrow().is_empty());
        }
    }
}
