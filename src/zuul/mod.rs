//! Zuul build records and the build-query contract.
//!
//! The builds API of Zuul only understands a result-count `limit`, not a date
//! range. [`list_builds`] emulates "the builds of the last N days" on top of it
//! by growing the limit until the returned builds cover the requested window.

pub mod http;

use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;

use chrono::{NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Timestamp format of `start_time` / `end_time`, e.g. `2022-02-06T12:21:04`.
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Upper bound on the number of requests a single window query may issue.
pub const MAX_WINDOW_REQUESTS: usize = 16;

/// Upper bound on the `limit` a window query may grow to.
pub const MAX_WINDOW_LIMIT: u64 = 100_000;

/// Starting limit of a window query when the caller did not set one.
const DEFAULT_WINDOW_START_LIMIT: u64 = 10;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Errors talking to the Zuul builds API or its log server.
#[derive(Debug, Error)]
pub enum ZuulError {
    /// The build query could not be sent, answered, or decoded.
    #[error("Cannot access Zuul")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Build {0} not found")]
    BuildNotFound(String),

    #[error("More than one result for build {uuid}: {count} builds")]
    AmbiguousBuild { uuid: String, count: usize },

    #[error("Build {0} has no log URL")]
    MissingLogUrl(String),

    #[error("HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("transfer failed: {0}")]
    Transfer(#[source] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ZuulError {
    /// Wrap any failure of the build query into [`ZuulError::Unavailable`].
    pub fn unavailable(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Unavailable(err.into())
    }
}

/// One recorded execution of a Zuul job.
///
/// Fields the service may leave `null` are optional. Fields this crate does not
/// interpret are kept in `extra` so the record round-trips unchanged through
/// the cache sidecar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub uuid: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub project: Option<String>,
    pub branch: Option<String>,
    pub job_name: Option<String>,
    pub pipeline: Option<String>,
    pub result: Option<String>,
    pub voting: Option<bool>,
    pub ref_url: Option<String>,
    pub patchset: Option<String>,
    pub log_url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Build {
    /// Parsed `start_time`, or `None` when absent or malformed.
    #[must_use]
    pub fn started_at(&self) -> Option<NaiveDateTime> {
        self.start_time
            .as_deref()
            .and_then(|s| parse_timestamp(s).ok())
    }

    /// Review link including the patchset, when the build belongs to a change.
    #[must_use]
    pub fn review(&self) -> Option<String> {
        match (&self.ref_url, &self.patchset) {
            (Some(url), Some(patchset)) => Some(format!("{url}/{patchset}")),
            (Some(url), None) => Some(url.clone()),
            _ => None,
        }
    }

    /// URL of a file below the build's log directory.
    #[must_use]
    pub fn log_file_url(&self, relative_path: &str) -> Option<String> {
        let base = self.log_url.as_deref().filter(|url| !url.is_empty())?;
        Some(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            relative_path.trim_start_matches('/')
        ))
    }

    /// Zuul reports builds without a change (periodic pipelines) with a
    /// `ref_url` ending in `/commit/None`. Treat those as having no review.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self
            .ref_url
            .as_deref()
            .is_some_and(|url| url.ends_with("/commit/None"))
        {
            self.ref_url = None;
        }
        self
    }
}

/// Parse a Zuul timestamp.
///
/// # Errors
///
/// Returns the chrono parse error if `value` is not in [`DATETIME_FORMAT`].
pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, DATETIME_FORMAT)
}

/// The time `days` days before `now`, or [`NaiveDateTime::MIN`] when that
/// is out of range.
#[must_use]
pub fn days_before(now: NaiveDateTime, days: u32) -> NaiveDateTime {
    TimeDelta::try_days(i64::from(days))
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(NaiveDateTime::MIN)
}

/// Build result values accepted as a filter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[value(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildResult {
    Success,
    Failure,
    PostFailure,
    TimedOut,
    Lost,
}

impl BuildResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::PostFailure => "POST_FAILURE",
            Self::TimedOut => "TIMED_OUT",
            Self::Lost => "LOST",
        }
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filters sent to the builds endpoint. Unset filters are not sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildQuery {
    pub project: Option<String>,
    pub pipeline: Option<String>,
    pub jobs: BTreeSet<String>,
    pub branches: Vec<String>,
    pub result: Option<BuildResult>,
    pub voting: Option<bool>,
    pub limit: Option<u64>,
    pub change: Option<u64>,
    pub patchset: Option<u64>,
}

impl BuildQuery {
    /// Query string pairs; `job_name` and `branch` repeat once per value.
    #[must_use]
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();

        if let Some(project) = &self.project {
            pairs.push(("project", project.clone()));
        }
        if let Some(pipeline) = &self.pipeline {
            pairs.push(("pipeline", pipeline.clone()));
        }
        pairs.extend(self.jobs.iter().map(|job| ("job_name", job.clone())));
        pairs.extend(self.branches.iter().map(|branch| ("branch", branch.clone())));
        if let Some(result) = self.result {
            pairs.push(("result", result.as_str().to_string()));
        }
        if let Some(voting) = self.voting {
            pairs.push(("voting", if voting { "1" } else { "0" }.to_string()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        if let Some(change) = self.change {
            pairs.push(("change", change.to_string()));
        }
        if let Some(patchset) = self.patchset {
            pairs.push(("patchset", patchset.to_string()));
        }

        pairs
    }

    #[must_use]
    pub fn with_limit(&self, limit: u64) -> Self {
        Self {
            limit: Some(limit),
            ..self.clone()
        }
    }
}

/// Read access to the builds API.
pub trait BuildService {
    /// Builds matching `query`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ZuulError::Unavailable`] if the service cannot be queried.
    fn list_builds(&self, tenant: &str, query: &BuildQuery) -> Result<Vec<Build>, ZuulError>;

    /// The single build with the given uuid.
    ///
    /// # Errors
    ///
    /// Returns [`ZuulError::BuildNotFound`] or [`ZuulError::AmbiguousBuild`]
    /// when the lookup does not yield exactly one build.
    fn get_build(&self, tenant: &str, uuid: &str) -> Result<Build, ZuulError>;
}

/// Download access to the log server of a build.
pub trait LogFetcher {
    /// Stream the file at `relative_path` below the build's log URL into
    /// `dest`, calling `progress` with the running chunk count.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if the build has no log URL, the server does not
    /// answer with success, or the transfer breaks.
    fn fetch_log(
        &self,
        build: &Build,
        relative_path: &str,
        dest: &mut dyn Write,
        progress: &mut dyn FnMut(usize),
    ) -> Result<u64, ZuulError>;
}

/// List builds, restricted to the last `days_ago` days when given.
///
/// # Errors
///
/// Propagates errors of the underlying service.
pub fn list_builds(
    service: &dyn BuildService,
    tenant: &str,
    query: &BuildQuery,
    days_ago: Option<u32>,
) -> Result<Vec<Build>, ZuulError> {
    match days_ago {
        None => service.list_builds(tenant, query),
        Some(days) => {
            list_builds_in_window(service, tenant, query, days, Utc::now().naive_utc())
        }
    }
}

/// Builds started within `days_ago` days before `now`.
///
/// The query is repeated with a growing limit until the oldest returned build
/// is at least `days_ago` days old, the service runs out of builds, or one of
/// the [`MAX_WINDOW_REQUESTS`] / [`MAX_WINDOW_LIMIT`] caps is hit. Each growth
/// step is at least the starting limit.
///
/// # Errors
///
/// Propagates errors of the underlying service.
pub fn list_builds_in_window(
    service: &dyn BuildService,
    tenant: &str,
    query: &BuildQuery,
    days_ago: u32,
    now: NaiveDateTime,
) -> Result<Vec<Build>, ZuulError> {
    let requested_days = f64::from(days_ago);
    let oldest_allowed = days_before(now, days_ago);
    let original_limit = query.limit.unwrap_or(DEFAULT_WINDOW_START_LIMIT).max(1);

    let mut limit = original_limit;
    let mut requests = 0;
    let mut builds = loop {
        let builds = service.list_builds(tenant, &query.with_limit(limit))?;
        requests += 1;

        // Fewer builds than asked for: nothing older exists upstream.
        if (builds.len() as u64) < limit {
            break builds;
        }

        let Some(oldest) = builds.iter().rev().find_map(Build::started_at) else {
            break builds;
        };
        #[allow(clippy::cast_precision_loss)]
        let covered_days = (now - oldest).num_seconds() as f64 / SECONDS_PER_DAY;
        if covered_days >= requested_days {
            break builds;
        }

        if requests >= MAX_WINDOW_REQUESTS || limit >= MAX_WINDOW_LIMIT {
            warn!(
                requests,
                limit, covered_days, "day window not reached, returning the builds found so far"
            );
            break builds;
        }

        limit = next_window_limit(limit, original_limit, covered_days, requested_days);
        debug!(covered_days, requested_days, limit, "widening build query");
    };

    builds.retain(|build| {
        build
            .started_at()
            .is_some_and(|start| start >= oldest_allowed)
    });
    Ok(builds)
}

/// Estimate the limit needed to cover `requested_days` from the density of
/// the last response, never growing by less than `original_limit`.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn next_window_limit(limit: u64, original_limit: u64, covered_days: f64, requested_days: f64) -> u64 {
    let estimate = if covered_days > 0.0 {
        (requested_days / covered_days * limit as f64).ceil() as u64
    } else {
        MAX_WINDOW_LIMIT
    };
    let increase = original_limit.max(estimate.saturating_sub(limit));
    limit.saturating_add(increase).min(MAX_WINDOW_LIMIT)
}
