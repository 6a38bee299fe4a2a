//! Command implementations behind the CLI.
//!
//! Every command writes its report to the given writer. Collaborators that
//! reach outside the process (the Zuul API, the log server and the grep
//! engine) come in through [`Session`] so the commands run the same against
//! fakes.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use indicatif::ProgressBar;
use tracing::debug;

use crate::cache::{CacheError, FetchOutcome, LogCache, RetentionPolicy};
use crate::config::ConfigStore;
use crate::output::{build_table, builds_table, cache_stats_table, format_size, matched_searches_table};
use crate::query::{CliParams, DEFAULT_TENANT, QueryResolver, ResolvedQuery, render_stored_search};
use crate::search::{LogMatcher, MultiFileMatcher};
use crate::zuul::{self, Build, BuildService, LogFetcher};

/// Collaborators and settings of one invocation.
pub struct Session<'a> {
    pub builds: &'a dyn BuildService,
    pub logs: &'a dyn LogFetcher,
    pub engine: &'a dyn LogMatcher,
    pub store: &'a ConfigStore,
    pub log_store_dir: PathBuf,
    /// Shows log downloads while they run.
    pub progress: ProgressBar,
}

impl Session<'_> {
    fn open_cache(&self) -> Result<LogCache, CacheError> {
        LogCache::open(&self.log_store_dir)
    }

    fn query_builds(&self, query: &ResolvedQuery) -> anyhow::Result<Vec<Build>> {
        let builds = zuul::list_builds(self.builds, &query.tenant, &query.build_query(), query.days)?;
        debug!(count = builds.len(), "builds found");
        Ok(builds)
    }
}

fn has_log_url(build: &Build) -> bool {
    build.log_url.as_deref().is_some_and(|url| !url.is_empty())
}

/// List the builds matching the command-line filters.
///
/// # Errors
///
/// Returns an error if the filters are invalid or Zuul cannot be queried.
pub fn list_builds(session: &Session<'_>, cli: &CliParams, out: &mut dyn Write) -> anyhow::Result<()> {
    let query = QueryResolver::new(session.store).resolve(cli)?;
    let builds = session.query_builds(&query)?;
    writeln!(out, "{}", builds_table(&builds, &query))?;
    Ok(())
}

/// Show one build, from the cache when present, else from Zuul.
///
/// # Errors
///
/// Returns an error if the build is neither cached nor known to Zuul.
pub fn show_build(
    session: &Session<'_>,
    tenant: Option<&str>,
    uuid: &str,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let cache = session.open_cache()?;
    let build = match cache.get_metadata(uuid) {
        Ok(build) => build,
        Err(CacheError::NotFound(_)) => {
            debug!(uuid, "build not cached, asking Zuul");
            session.builds.get_build(tenant.unwrap_or(DEFAULT_TENANT), uuid)?
        }
        Err(err) => return Err(err.into()),
    };
    writeln!(out, "{}", build_table(&build))?;
    Ok(())
}

/// Search the logs of the builds matching the command line.
///
/// # Errors
///
/// Returns an error for invalid parameters, Zuul failures, cache failures
/// and grep engine failures.
pub fn search_logs(session: &Session<'_>, cli: &CliParams, out: &mut dyn Write) -> anyhow::Result<()> {
    let query = QueryResolver::new(session.store).resolve(cli)?;
    let regex = query.require_regex("log")?;
    run_search(session, &query, regex, out)
}

/// Print the stored search `name` and run it like [`search_logs`].
///
/// # Errors
///
/// Returns the errors of [`search_logs`], and a configuration error if the
/// search is undefined or has no regex.
pub fn run_stored_search(
    session: &Session<'_>,
    name: &str,
    cli: &CliParams,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let query = QueryResolver::new(session.store).resolve_stored(name, cli)?;
    let regex = query.require_regex(name)?;

    writeln!(out, "Running stored search:")?;
    for line in render_stored_search(name, &query.to_stored_search())?.lines() {
        writeln!(out, "  {line}")?;
    }

    run_search(session, &query, regex, out)
}

fn run_search(
    session: &Session<'_>,
    query: &ResolvedQuery,
    regex: &str,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let builds = session.query_builds(query)?;
    writeln!(out, "Found builds:")?;
    writeln!(out, "{}", builds_table(&builds, query))?;

    let cache = session.open_cache()?;
    let matcher = MultiFileMatcher::new(&cache, session.logs, session.engine);

    writeln!(out, "Downloading logs:")?;
    let mut local_files = Vec::new();
    for build in &builds {
        if !has_log_url(build) {
            writeln!(out, "{}: empty log URL. Skipping.", build.uuid)?;
            continue;
        }

        let mut outcomes = Vec::new();
        let paths = matcher.ensure_files(
            build,
            &query.files,
            &mut |file, chunks| {
                session.progress.set_message(format!("{}: {file}", build.uuid));
                session.progress.set_position(chunks as u64);
            },
            &mut |file, log| outcomes.push((file.to_string(), log.outcome.clone())),
        )?;
        session.progress.suspend(|| {
            outcomes
                .iter()
                .try_for_each(|(file, outcome)| report_download(out, &build.uuid, file, outcome))
        })?;
        local_files.push((build, paths));
    }
    session.progress.finish_and_clear();

    writeln!(out, "Searching logs:")?;
    let mut matching = Vec::new();
    for (build, paths) in local_files {
        let matches = matcher.search_files(build, paths, regex, &query.context)?;
        if matches.is_match() {
            for line in matches.prefixed_lines() {
                writeln!(out, "{line}")?;
            }
            writeln!(out)?;
            matching.push(build);
        }
    }

    writeln!(out, "Builds with matching logs {}/{}:", matching.len(), builds.len())?;
    writeln!(out, "{}", builds_table(matching, query))?;
    Ok(())
}

fn report_download(
    out: &mut dyn Write,
    uuid: &str,
    file: &str,
    outcome: &FetchOutcome,
) -> std::io::Result<()> {
    match outcome {
        FetchOutcome::Cached => Ok(()),
        FetchOutcome::Fetched { bytes } => {
            writeln!(out, "{uuid}: {file}: Done ({})", format_size(*bytes))
        }
        FetchOutcome::Placeholder { reason } => {
            writeln!(out, "{uuid}: {file}: Download failed: {reason}")
        }
    }
}

/// Check every build matching the command line against every stored search.
///
/// For each stored search the build filters are compared first; when they
/// match and the search has a regex, the build's logs are searched too.
///
/// # Errors
///
/// Returns an error for invalid parameters or stored searches, Zuul failures,
/// cache failures and grep engine failures.
pub fn match_searches(session: &Session<'_>, cli: &CliParams, out: &mut dyn Write) -> anyhow::Result<()> {
    let resolver = QueryResolver::new(session.store);
    let query = resolver.resolve(cli)?;
    let builds = session.query_builds(&query)?;
    writeln!(out, "Found builds:")?;
    writeln!(out, "{}", builds_table(&builds, &query))?;

    let cache = session.open_cache()?;
    let matcher = MultiFileMatcher::new(&cache, session.logs, session.engine);

    let mut results: Vec<(&Build, Vec<String>)> = Vec::new();
    for build in &builds {
        if !has_log_url(build) {
            writeln!(out, "{}: empty log URL. Skipping.", build.uuid)?;
            continue;
        }

        let mut signatures = Vec::new();
        for (name, search) in session.store.searches() {
            let Some(search_query) = resolver.resolve_for_build(build, search, cli)? else {
                continue;
            };
            writeln!(out, "{}: Search {name} matched build query", build.uuid)?;

            let Some(regex) = search_query.regex.as_deref() else {
                writeln!(out, "{}: Search {name} has no regex. Skipping.", build.uuid)?;
                continue;
            };
            let matches = matcher.search_build(build, &search_query.files, regex, &search_query.context)?;
            if matches.is_match() {
                writeln!(out, "{}: Search {name} matched signature!", build.uuid)?;
                for line in matches.prefixed_lines() {
                    writeln!(out, "{line}")?;
                }
                signatures.push(name.clone());
            }
        }

        if !signatures.is_empty() {
            results.push((build, signatures));
        }
    }

    writeln!(out, "Builds matching stored searches {}/{}:", results.len(), builds.len())?;
    let table = matched_searches_table(
        results
            .iter()
            .map(|(build, signatures)| (*build, signatures.as_slice())),
    );
    writeln!(out, "{table}")?;
    Ok(())
}

/// Print cache usage statistics.
///
/// # Errors
///
/// Returns an error if the cache cannot be scanned.
pub fn show_cache(log_store_dir: &Path, out: &mut dyn Write) -> anyhow::Result<()> {
    let cache = LogCache::open(log_store_dir)?;
    writeln!(out, "{}", cache_stats_table(&cache.stats()?))?;
    Ok(())
}

/// Purge the cache according to `policy` at `now`, printing statistics
/// before and after.
///
/// # Errors
///
/// Returns the first filesystem error; builds purged before it stay purged.
pub fn purge_cache(
    log_store_dir: &Path,
    policy: RetentionPolicy,
    now: NaiveDateTime,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let cache = LogCache::open(log_store_dir)?;
    writeln!(out, "{}", cache_stats_table(&cache.stats()?))?;

    writeln!(out, "Purging...")?;
    let report = cache.purge(policy, now)?;
    if report.deleted_builds > 0 {
        writeln!(
            out,
            "Deleted {} builds, freed {}",
            report.deleted_builds,
            format_size(report.freed_bytes)
        )?;
    }

    writeln!(out, "{}", cache_stats_table(&cache.stats()?))?;
    Ok(())
}
