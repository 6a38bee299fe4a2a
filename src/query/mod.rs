//! Resolution of command-line parameters and stored searches into one query.
//!
//! For every parameter the stored search wins when it defines the field, the
//! command line fills in otherwise, and a built-in default covers the rest.
//! Jobs are the exception: a stored search that names `jobs` or `job-groups`
//! replaces the command line's job selection instead of merging with it.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{ConfigError, ConfigStore, StoredSearch};
use crate::search::ContextOptions;
use crate::zuul::{Build, BuildQuery, BuildResult};

pub const DEFAULT_TENANT: &str = "openstack";
pub const DEFAULT_LIMIT: u64 = 10;
pub const DEFAULT_LOG_FILE: &str = "job-output.txt";

/// Limit used when querying the builds of a single review.
pub const REVIEW_LIMIT: u64 = 10_000_000_000;

/// Parameters as given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliParams {
    pub tenant: Option<String>,
    pub project: Option<String>,
    pub pipeline: Option<String>,
    pub jobs: Vec<String>,
    pub job_groups: Vec<String>,
    pub branches: Vec<String>,
    pub result: Option<BuildResult>,
    pub voting: Option<bool>,
    pub limit: Option<u64>,
    pub review: Option<u64>,
    pub patchset: Option<u64>,
    pub days: Option<u32>,
    pub regex: Option<String>,
    pub context: ContextOptions,
    pub files: Vec<String>,
}

/// The effective parameters of one command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedQuery {
    pub tenant: String,
    pub project: Option<String>,
    pub pipeline: Option<String>,
    pub jobs: BTreeSet<String>,
    pub branches: Vec<String>,
    pub result: Option<BuildResult>,
    pub voting: Option<bool>,
    pub limit: u64,
    pub review: Option<u64>,
    pub patchset: Option<u64>,
    pub days: Option<u32>,
    pub regex: Option<String>,
    pub context: ContextOptions,
    pub files: BTreeSet<String>,
}

impl ResolvedQuery {
    /// Filters for the builds endpoint.
    #[must_use]
    pub fn build_query(&self) -> BuildQuery {
        BuildQuery {
            project: self.project.clone(),
            pipeline: self.pipeline.clone(),
            jobs: self.jobs.clone(),
            branches: self.branches.clone(),
            result: self.result,
            voting: self.voting,
            limit: Some(self.limit),
            change: self.review,
            patchset: self.patchset,
        }
    }

    /// The regex to search for.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingRegex`] naming `source` when no regex was
    /// resolved.
    pub fn require_regex(&self, source: &str) -> Result<&str, ConfigError> {
        self.regex
            .as_deref()
            .ok_or_else(|| ConfigError::MissingRegex(source.to_string()))
    }

    /// Whether `build` satisfies the build filters of this query.
    ///
    /// The tenant is not compared since build records do not carry it.
    #[must_use]
    pub fn matches_build(&self, build: &Build) -> bool {
        let jobs_match = self.jobs.is_empty()
            || build
                .job_name
                .as_ref()
                .is_some_and(|job| self.jobs.contains(job));
        let branches_match = self.branches.is_empty()
            || build
                .branch
                .as_ref()
                .is_some_and(|branch| self.branches.contains(branch));

        filter_matches(self.project.as_deref(), build.project.as_deref())
            && filter_matches(self.pipeline.as_deref(), build.pipeline.as_deref())
            && filter_matches(self.result.map(BuildResult::as_str), build.result.as_deref())
            && self.voting.is_none_or(|voting| build.voting == Some(voting))
            && jobs_match
            && branches_match
    }

    /// This query written back as a fully populated stored search.
    ///
    /// Job groups appear expanded into `jobs`. Review and day filters have no
    /// stored-search counterpart and are left out.
    #[must_use]
    pub fn to_stored_search(&self) -> StoredSearch {
        StoredSearch {
            tenant: Some(self.tenant.clone()),
            project: self.project.clone(),
            pipeline: self.pipeline.clone(),
            jobs: Some(self.jobs.clone()),
            job_groups: None,
            branches: Some(self.branches.clone()),
            result: self.result,
            voting: self.voting,
            limit: Some(self.limit),
            regex: self.regex.clone(),
            before_context: self.context.before,
            after_context: self.context.after,
            context: self.context.context,
            files: Some(self.files.clone()),
        }
    }
}

/// Render `name → search` as a YAML document.
///
/// # Errors
///
/// Returns [`ConfigError::Document`] if serialization fails.
pub fn render_stored_search(name: &str, search: &StoredSearch) -> Result<String, ConfigError> {
    let document = BTreeMap::from([(name, search)]);
    serde_yaml::to_string(&document).map_err(ConfigError::Document)
}

/// Parse a document produced by [`render_stored_search`].
///
/// # Errors
///
/// Returns [`ConfigError::Document`] if `yaml` is not a `name → search` map.
pub fn parse_stored_searches(yaml: &str) -> Result<BTreeMap<String, StoredSearch>, ConfigError> {
    serde_yaml::from_str(yaml).map_err(ConfigError::Document)
}

/// Check `pattern` for regex syntax errors.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidRegex`] with the parser's explanation.
pub fn validate_regex(pattern: &str) -> Result<(), ConfigError> {
    regex::Regex::new(pattern)
        .map(drop)
        .map_err(|err| ConfigError::InvalidRegex {
            value: pattern.to_string(),
            reason: err.to_string(),
        })
}

fn filter_matches(filter: Option<&str>, value: Option<&str>) -> bool {
    filter.is_none_or(|expected| value == Some(expected))
}

/// Stored-search value if defined, else the command-line value.
fn layered<T: Clone>(stored: Option<&T>, cli: Option<&T>) -> Option<T> {
    stored.or(cli).cloned()
}

/// Computes effective queries against a loaded [`ConfigStore`].
pub struct QueryResolver<'a> {
    store: &'a ConfigStore,
}

impl<'a> QueryResolver<'a> {
    #[must_use]
    pub fn new(store: &'a ConfigStore) -> Self {
        Self { store }
    }

    /// Resolve command-line parameters alone.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for undefined job groups, an invalid regex, or
    /// a patchset without a review.
    pub fn resolve(&self, cli: &CliParams) -> Result<ResolvedQuery, ConfigError> {
        self.resolve_with(&StoredSearch::default(), cli)
    }

    /// Resolve the stored search `name` on top of the command line.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UndefinedSearch`] if `name` is not configured,
    /// plus the errors of [`QueryResolver::resolve`].
    pub fn resolve_stored(&self, name: &str, cli: &CliParams) -> Result<ResolvedQuery, ConfigError> {
        let search = self.store.search(name)?;
        self.resolve_with(search, cli)
    }

    /// The effective query of `search` for one build, or `None` when the build
    /// does not satisfy the search's build filters.
    ///
    /// Each call starts from `cli` afresh, so resolving many searches in a row
    /// never carries values from one search over to the next.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`QueryResolver::resolve`].
    pub fn resolve_for_build(
        &self,
        build: &Build,
        search: &StoredSearch,
        cli: &CliParams,
    ) -> Result<Option<ResolvedQuery>, ConfigError> {
        let query = self.resolve_with(search, cli)?;
        Ok(query.matches_build(build).then_some(query))
    }

    /// Layer `stored` over `cli` field by field.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`QueryResolver::resolve`].
    pub fn resolve_with(
        &self,
        stored: &StoredSearch,
        cli: &CliParams,
    ) -> Result<ResolvedQuery, ConfigError> {
        if cli.patchset.is_some() && cli.review.is_none() {
            return Err(ConfigError::PatchsetWithoutReview);
        }

        let jobs = if stored.defines_jobs() {
            let mut jobs = stored.jobs.clone().unwrap_or_default();
            jobs.extend(
                self.store
                    .expand_job_groups(stored.job_groups.as_deref().unwrap_or_default())?,
            );
            jobs
        } else {
            let mut jobs: BTreeSet<String> = cli.jobs.iter().cloned().collect();
            jobs.extend(self.store.expand_job_groups(&cli.job_groups)?);
            jobs
        };

        let limit = if cli.review.is_some() {
            REVIEW_LIMIT
        } else {
            layered(stored.limit.as_ref(), cli.limit.as_ref()).unwrap_or(DEFAULT_LIMIT)
        };

        let regex = layered(stored.regex.as_ref(), cli.regex.as_ref());
        if let Some(pattern) = &regex {
            validate_regex(pattern)?;
        }

        let mut files = stored
            .files
            .clone()
            .unwrap_or_else(|| cli.files.iter().cloned().collect());
        if files.is_empty() {
            files.insert(DEFAULT_LOG_FILE.to_string());
        }

        Ok(ResolvedQuery {
            tenant: layered(stored.tenant.as_ref(), cli.tenant.as_ref())
                .unwrap_or_else(|| DEFAULT_TENANT.to_string()),
            project: layered(stored.project.as_ref(), cli.project.as_ref()),
            pipeline: layered(stored.pipeline.as_ref(), cli.pipeline.as_ref()),
            jobs,
            branches: stored
                .branches
                .clone()
                .unwrap_or_else(|| cli.branches.clone()),
            result: layered(stored.result.as_ref(), cli.result.as_ref()),
            voting: layered(stored.voting.as_ref(), cli.voting.as_ref()),
            limit,
            review: cli.review,
            patchset: cli.patchset,
            days: cli.days,
            regex,
            context: ContextOptions {
                before: layered(stored.before_context.as_ref(), cli.context.before.as_ref()),
                after: layered(stored.after_context.as_ref(), cli.context.after.as_ref()),
                context: layered(stored.context.as_ref(), cli.context.context.as_ref()),
            },
            files,
        })
    }
}
