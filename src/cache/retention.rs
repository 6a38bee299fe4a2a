//! Cache statistics and retention-based purge.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{CacheError, LogCache, METADATA_FILE, read_metadata};
use crate::config::ConfigError;
use crate::zuul::days_before;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Which cached builds survive a purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep builds started less than `days` days ago.
    MaxAge { days: u32 },
    /// Keep the most recent builds that fit into `bytes` together.
    MaxSize { bytes: u64 },
}

impl RetentionPolicy {
    /// Build a policy from the `--days` / `--gb` selectors.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidRetention`] unless exactly one selector
    /// is given, or if the size budget is negative or not a number.
    pub fn from_selectors(days: Option<u32>, gb: Option<f64>) -> Result<Self, ConfigError> {
        match (days, gb) {
            (Some(days), None) => Ok(Self::MaxAge { days }),
            (None, Some(gb)) => {
                if !gb.is_finite() || gb < 0.0 {
                    return Err(ConfigError::InvalidRetention(format!(
                        "size budget must be a non-negative number of GiB, got {gb}"
                    )));
                }
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let bytes = (gb * BYTES_PER_GIB).floor() as u64;
                Ok(Self::MaxSize { bytes })
            }
            (Some(_), Some(_)) => Err(ConfigError::InvalidRetention(
                "--days and --gb are mutually exclusive".to_string(),
            )),
            (None, None) => Err(ConfigError::InvalidRetention(
                "either --days or --gb is required".to_string(),
            )),
        }
    }
}

/// Disk usage summary of the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size_bytes: u64,
    pub builds: usize,
    pub logfiles: usize,
    pub oldest_build: Option<NaiveDateTime>,
}

/// Outcome of a purge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub deleted_builds: usize,
    pub freed_bytes: u64,
}

#[derive(Debug)]
struct CachedBuild {
    dir: PathBuf,
    started_at: Option<NaiveDateTime>,
    bytes: u64,
}

#[derive(Debug, Default)]
struct DirUsage {
    bytes: u64,
    logfiles: usize,
}

impl LogCache {
    /// Recompute usage statistics from the current disk state.
    ///
    /// Build directories without a readable sidecar still count towards size,
    /// build and logfile totals.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be scanned.
    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();

        for dir in self.build_dirs()? {
            let usage = dir_usage(&dir)?;
            stats.builds += 1;
            stats.size_bytes += usage.bytes;
            stats.logfiles += usage.logfiles;

            if let Some(start) = started_at(&dir) {
                stats.oldest_build = Some(stats.oldest_build.map_or(start, |oldest| oldest.min(start)));
            }
        }

        Ok(stats)
    }

    /// Delete every cached build that `policy` does not retain at `now`.
    ///
    /// Builds are ordered most recent first; builds without a usable start
    /// time come last. The longest prefix satisfying the policy is kept and
    /// the rest is deleted.
    ///
    /// # Errors
    ///
    /// Returns the first filesystem error. Builds deleted before the error
    /// stay deleted.
    pub fn purge(&self, policy: RetentionPolicy, now: NaiveDateTime) -> Result<PurgeReport, CacheError> {
        let mut builds = Vec::new();
        for dir in self.build_dirs()? {
            let bytes = dir_usage(&dir)?.bytes;
            builds.push(CachedBuild {
                started_at: started_at(&dir),
                dir,
                bytes,
            });
        }
        builds.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let kept = retained_count(
            builds.iter().map(|build| (build.started_at, build.bytes)),
            policy,
            now,
        );
        debug!(kept, total = builds.len(), ?policy, "purging cache");

        let mut report = PurgeReport::default();
        for build in &builds[kept..] {
            fs::remove_dir_all(&build.dir).map_err(|source| CacheError::Delete {
                path: build.dir.clone(),
                source,
            })?;
            info!(path = %build.dir.display(), bytes = build.bytes, "purged cached build");
            report.deleted_builds += 1;
            report.freed_bytes += build.bytes;
        }

        Ok(report)
    }

    fn build_dirs(&self) -> Result<Vec<PathBuf>, CacheError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CacheError::Read {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CacheError::Read {
                path: self.root.clone(),
                source,
            })?;
            let is_dir = entry.file_type().is_ok_and(|kind| kind.is_dir());
            if is_dir {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

/// Number of leading builds (most recent first) that `policy` keeps.
fn retained_count(
    builds: impl IntoIterator<Item = (Option<NaiveDateTime>, u64)>,
    policy: RetentionPolicy,
    now: NaiveDateTime,
) -> usize {
    match policy {
        RetentionPolicy::MaxAge { days } => {
            let cutoff = days_before(now, days);
            builds
                .into_iter()
                .take_while(|(started_at, _)| started_at.is_some_and(|start| start > cutoff))
                .count()
        }
        RetentionPolicy::MaxSize { bytes: budget } => {
            let mut total: u64 = 0;
            builds
                .into_iter()
                .take_while(|(_, bytes)| {
                    total = total.saturating_add(*bytes);
                    total <= budget
                })
                .count()
        }
    }
}

fn started_at(build_dir: &Path) -> Option<NaiveDateTime> {
    read_metadata(&build_dir.join(METADATA_FILE))
        .ok()
        .and_then(|build| build.started_at())
}

fn dir_usage(build_dir: &Path) -> Result<DirUsage, CacheError> {
    let mut usage = DirUsage::default();

    for entry in WalkDir::new(build_dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        usage.bytes += entry.metadata()?.len();
        if !(entry.depth() == 1 && entry.file_name() == METADATA_FILE) {
            usage.logfiles += 1;
        }
    }

    Ok(usage)
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use tempfile::TempDir;

    use super::*;
    use crate::cache::tests::{FakeFetcher, build};
    use crate::zuul::parse_timestamp;

    fn at(value: &str) -> NaiveDateTime {
        parse_timestamp(value).unwrap()
    }

    const NEWER_START: &str = "2022-02-09T16:57:33";
    const OLDER_START: &str = "2022-02-06T12:21:04";

    /// Two builds: the newer with one log file, the older with two.
    fn populated_cache() -> (TempDir, LogCache) {
        let dir = TempDir::new().unwrap();
        let cache = LogCache::open(dir.path().join("cache")).unwrap();
        let fetcher = FakeFetcher::default()
            .with_log("newer", "job-output.txt", "newer build log\n")
            .with_log("older", "job-output.txt", "older build log\n")
            .with_log("older", "logs/n-cpu.txt", "cpu log line\n");

        let newer = build("newer", NEWER_START);
        let older = build("older", OLDER_START);
        cache.ensure(&fetcher, &newer, "job-output.txt", &mut |_| {}).unwrap();
        cache.ensure(&fetcher, &older, "job-output.txt", &mut |_| {}).unwrap();
        cache.ensure(&fetcher, &older, "logs/n-cpu.txt", &mut |_| {}).unwrap();

        (dir, cache)
    }

    fn dir_bytes(cache: &LogCache, uuid: &str) -> u64 {
        dir_usage(&cache.root().join(uuid)).unwrap().bytes
    }

    mod stats_tests {
        use super::*;

        #[test]
        fn empty_cache() {
            let dir = TempDir::new().unwrap();
            let cache = LogCache::open(dir.path()).unwrap();

            let stats = cache.stats().unwrap();

            assert_eq!(stats, CacheStats::default());
        }

        #[test]
        fn counts_builds_and_logfiles() {
            let (_dir, cache) = populated_cache();

            let stats = cache.stats().unwrap();

            assert_eq!(stats.builds, 2);
            assert_eq!(stats.logfiles, 3);
            assert_eq!(
                stats.size_bytes,
                dir_bytes(&cache, "newer") + dir_bytes(&cache, "older")
            );
            assert_eq!(stats.oldest_build, Some(at(OLDER_START)));
        }

        #[test]
        fn tolerates_directory_without_sidecar() {
            let (_dir, cache) = populated_cache();
            let stray = cache.root().join("stray");
            fs::create_dir_all(&stray).unwrap();
            fs::write(stray.join("job-output.txt"), "abc").unwrap();

            let stats = cache.stats().unwrap();

            assert_eq!(stats.builds, 3);
            assert_eq!(stats.logfiles, 4);
            assert_eq!(stats.oldest_build, Some(at(OLDER_START)));
        }

        #[test]
        fn missing_root_is_empty() {
            let dir = TempDir::new().unwrap();
            let cache = LogCache::open(dir.path().join("cache")).unwrap();
            fs::remove_dir(cache.root()).unwrap();

            assert_eq!(cache.stats().unwrap(), CacheStats::default());
        }
    }

    mod purge_tests {
        use super::*;

        #[test]
        fn by_age_keeps_builds_younger_than_cutoff() {
            let (_dir, cache) = populated_cache();
            let before = cache.stats().unwrap();
            let newer_bytes = dir_bytes(&cache, "newer");

            let report = cache
                .purge(RetentionPolicy::MaxAge { days: 1 }, at(OLDER_START))
                .unwrap();
            assert_eq!(report, PurgeReport::default());
            assert_eq!(cache.stats().unwrap(), before);

            let later = at(OLDER_START) + TimeDelta::days(1) + TimeDelta::minutes(1);
            let report = cache.purge(RetentionPolicy::MaxAge { days: 1 }, later).unwrap();

            assert_eq!(report.deleted_builds, 1);
            assert_eq!(report.freed_bytes, before.size_bytes - newer_bytes);
            let after = cache.stats().unwrap();
            assert_eq!(after.size_bytes, newer_bytes);
            assert_eq!(after.builds, 1);
            assert_eq!(after.logfiles, 1);
            assert!(cache.root().join("newer").exists());
            assert!(!cache.root().join("older").exists());
        }

        #[test]
        fn huge_age_keeps_everything() {
            let (_dir, cache) = populated_cache();
            let before = cache.stats().unwrap();

            let report = cache
                .purge(RetentionPolicy::MaxAge { days: u32::MAX }, at(NEWER_START))
                .unwrap();

            assert_eq!(report, PurgeReport::default());
            assert_eq!(cache.stats().unwrap(), before);
        }

        #[test]
        fn by_size_keeps_recent_prefix_within_budget() {
            let (_dir, cache) = populated_cache();
            let newer_bytes = dir_bytes(&cache, "newer");

            let report = cache
                .purge(RetentionPolicy::MaxSize { bytes: newer_bytes }, at(NEWER_START))
                .unwrap();

            assert_eq!(report.deleted_builds, 1);
            assert!(cache.root().join("newer").exists());
            assert!(!cache.root().join("older").exists());
        }

        #[test]
        fn zero_budget_deletes_everything() {
            let (_dir, cache) = populated_cache();

            let report = cache
                .purge(RetentionPolicy::MaxSize { bytes: 0 }, at(NEWER_START))
                .unwrap();

            assert_eq!(report.deleted_builds, 2);
            assert_eq!(cache.stats().unwrap().builds, 0);
        }

        #[test]
        fn undated_builds_are_purged_first() {
            let (_dir, cache) = populated_cache();
            let stray = cache.root().join("stray");
            fs::create_dir_all(&stray).unwrap();
            fs::write(stray.join("job-output.txt"), "abc").unwrap();

            let report = cache
                .purge(RetentionPolicy::MaxAge { days: 365 }, at(NEWER_START))
                .unwrap();

            assert_eq!(report.deleted_builds, 1);
            assert!(!stray.exists());
            assert_eq!(cache.stats().unwrap().builds, 2);
        }
    }

    mod policy_tests {
        use super::*;

        fn days_ago(now: NaiveDateTime, days: i64) -> Option<NaiveDateTime> {
            Some(now - TimeDelta::days(days))
        }

        #[test]
        fn age_exactly_at_cutoff_is_excluded() {
            let now = at("2022-02-10T00:00:00");
            let builds = [(days_ago(now, 0), 1), (days_ago(now, 2), 1), (days_ago(now, 3), 1)];

            assert_eq!(retained_count(builds, RetentionPolicy::MaxAge { days: 2 }, now), 1);
            assert_eq!(retained_count(builds, RetentionPolicy::MaxAge { days: 3 }, now), 2);
        }

        #[test]
        fn age_stops_at_first_old_build() {
            let now = at("2022-02-10T00:00:00");
            let builds = [(days_ago(now, 5), 1), (days_ago(now, 0), 1)];

            assert_eq!(retained_count(builds, RetentionPolicy::MaxAge { days: 2 }, now), 0);
        }

        #[test]
        fn huge_age_keeps_every_dated_build() {
            let now = at("2022-02-10T00:00:00");
            let builds = [
                (days_ago(now, 0), 1),
                (Some(at("1970-01-01T00:00:00")), 1),
                (None, 1),
            ];

            assert_eq!(
                retained_count(builds, RetentionPolicy::MaxAge { days: u32::MAX }, now),
                2
            );
        }

        #[test]
        fn larger_budget_never_keeps_fewer() {
            let now = at("2022-02-10T00:00:00");
            let builds = [(None, 300), (None, 100), (None, 250), (None, 50)];

            let mut previous = 0;
            for budget in (0..=800).step_by(25) {
                let kept = retained_count(builds, RetentionPolicy::MaxSize { bytes: budget }, now);
                assert!(kept >= previous);
                previous = kept;
            }
            assert_eq!(previous, 4);
        }

        #[test]
        fn budget_counts_cumulative_size() {
            let now = at("2022-02-10T00:00:00");
            let builds = [(None, 346), (None, 307)];

            assert_eq!(retained_count(builds, RetentionPolicy::MaxSize { bytes: 652 }, now), 1);
            assert_eq!(retained_count(builds, RetentionPolicy::MaxSize { bytes: 653 }, now), 2);
        }

        #[test]
        fn selectors() {
            assert_eq!(
                RetentionPolicy::from_selectors(Some(7), None).unwrap(),
                RetentionPolicy::MaxAge { days: 7 }
            );
            assert_eq!(
                RetentionPolicy::from_selectors(None, Some(1.5)).unwrap(),
                RetentionPolicy::MaxSize {
                    bytes: 1_610_612_736
                }
            );
            assert!(RetentionPolicy::from_selectors(Some(1), Some(1.0)).is_err());
            assert!(RetentionPolicy::from_selectors(None, None).is_err());
            assert!(RetentionPolicy::from_selectors(None, Some(-1.0)).is_err());
        }
    }
}
