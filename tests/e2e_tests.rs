//! End-to-end CLI tests for logsearch.
//!
//! These tests run the binary with an isolated config directory and log
//! cache. None of them reach a Zuul deployment: they either fail before the
//! first request or only touch the local cache.

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test Environment Helper
// =============================================================================

/// Isolated test environment with its own config directory and log cache.
struct TestEnv {
    temp_dir: TempDir,
    config_dir: PathBuf,
    cache_dir: PathBuf,
}

impl TestEnv {
    /// Create an environment with an empty config directory.
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("config");
        fs::create_dir_all(&config_dir).expect("Failed to create config dir");

        Self {
            cache_dir: temp_dir.path().join("cache"),
            config_dir,
            temp_dir,
        }
    }

    /// Create an environment with job groups and stored searches.
    fn with_config() -> Self {
        let env = Self::new();
        fs::write(
            env.config_dir.join("searches.yaml"),
            r#"
job-groups:
  devstack: [devstack, devstack-multinode]
searches:
  nova-timeout:
    project: openstack/nova
    regex: "Timed out waiting"
  no-regex:
    project: openstack/nova
"#,
        )
        .expect("Failed to write config");
        env
    }

    /// Put a build record into the cache as if its logs had been fetched.
    fn cache_build(&self, uuid: &str, metadata: &str) {
        let dir = self.cache_dir.join(uuid);
        fs::create_dir_all(&dir).expect("Failed to create build dir");
        fs::write(dir.join("build.meta"), metadata).expect("Failed to write metadata");
        fs::write(dir.join("job-output.txt"), "line one\nline two\n").expect("Failed to write log");
    }

    /// Command running in the environment. The Zuul URL points at a closed
    /// local port so a stray request fails instead of hitting the network.
    fn cmd(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("logsearch");
        cmd.current_dir(self.temp_dir.path())
            .env_remove("RUST_LOG")
            .env("LOGSEARCH_CONFIG_DIR", &self.config_dir)
            .env("LOGSEARCH_LOG_STORE_DIR", &self.cache_dir)
            .env("LOGSEARCH_ZUUL_API_URL", "http://127.0.0.1:9/api");
        cmd
    }
}

// =============================================================================
// Help and Argument Validation
// =============================================================================

mod cli_tests {
    use super::*;

    #[test]
    fn no_command_prints_help() {
        let env = TestEnv::new();

        env.cmd()
            .assert()
            .success()
            .stdout(predicate::str::contains("Search Zuul CI results"))
            .stdout(predicate::str::contains("storedsearch"))
            .stdout(predicate::str::contains("cache-purge"));
    }

    #[test]
    fn log_requires_regex() {
        let env = TestEnv::new();

        env.cmd().arg("log").assert().failure();
    }

    #[test]
    fn cache_purge_requires_selector() {
        let env = TestEnv::new();

        env.cmd().arg("cache-purge").assert().failure();
    }

    #[test]
    fn cache_purge_rejects_both_selectors() {
        let env = TestEnv::new();

        env.cmd()
            .args(["cache-purge", "--days", "1", "--gb", "1"])
            .assert()
            .failure();
    }

    #[test]
    fn unknown_result_is_rejected() {
        let env = TestEnv::new();

        env.cmd()
            .args(["build", "--result", "MAYBE"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("MAYBE"));
    }
}

// =============================================================================
// Query Errors
// =============================================================================

mod query_error_tests {
    use super::*;

    #[test]
    fn patchset_without_review() {
        let env = TestEnv::new();

        env.cmd()
            .args(["build", "--patchset", "3"])
            .assert()
            .failure()
            .stderr(predicate::str::contains(
                "The patchset parameter is only valid if the review parameter is also provided.",
            ));
    }

    #[test]
    fn invalid_regex() {
        let env = TestEnv::new();

        env.cmd()
            .args(["log", "("])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid regex: '('"));
    }

    #[test]
    fn undefined_job_group() {
        let env = TestEnv::with_config();

        env.cmd()
            .args(["build", "--job-group", "grenade"])
            .assert()
            .failure()
            .stderr(predicate::str::contains(
                "The requested job group grenade is not defined in the config files.",
            ));
    }

    #[test]
    fn undefined_stored_search() {
        let env = TestEnv::with_config();

        env.cmd()
            .args(["storedsearch", "missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("The stored search missing not found"))
            .stderr(predicate::str::contains("no-regex, nova-timeout"));
    }

    #[test]
    fn stored_search_without_regex() {
        let env = TestEnv::with_config();

        env.cmd()
            .args(["storedsearch", "no-regex"])
            .assert()
            .failure()
            .stderr(predicate::str::contains(
                "The stored search no-regex does not define a regex",
            ));
    }

    #[test]
    fn malformed_config_file() {
        let env = TestEnv::new();
        fs::write(env.config_dir.join("broken.conf"), "job-groups: [unclosed").expect("Failed to write config");

        env.cmd()
            .args(["build"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse config file"))
            .stderr(predicate::str::contains("broken.conf"));
    }

    #[test]
    fn unreachable_zuul() {
        let env = TestEnv::new();

        env.cmd()
            .args(["build"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cannot access Zuul"));
    }
}

// =============================================================================
// Cache Commands
// =============================================================================

mod cache_tests {
    use super::*;

    const METADATA: &str = r#"{
        "uuid": "fake-uuid",
        "start_time": "2022-02-09T16:57:33",
        "project": "openstack/nova",
        "job_name": "nova-next",
        "log_url": "https://logs.example.org/fake/"
    }"#;

    #[test]
    fn show_empty_cache() {
        let env = TestEnv::new();

        env.cmd()
            .arg("cache-show")
            .assert()
            .success()
            .stdout(predicate::str::contains("Disk size"))
            .stdout(predicate::str::contains("0.00 B"));
    }

    #[test]
    fn show_populated_cache() {
        let env = TestEnv::new();
        env.cache_build("fake-uuid", METADATA);

        env.cmd()
            .arg("cache-show")
            .assert()
            .success()
            .stdout(predicate::str::is_match(r"\| Number of builds\s+\| 1").unwrap())
            .stdout(predicate::str::is_match(r"\| Number of logfiles\s+\| 1").unwrap())
            .stdout(predicate::str::contains("2022-02-09 16:57:33"));
    }

    #[test]
    fn purge_by_days_deletes_old_builds() {
        let env = TestEnv::new();
        env.cache_build("fake-uuid", METADATA);

        env.cmd()
            .args(["cache-purge", "--days", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Purging..."))
            .stdout(predicate::str::contains("Deleted 1 builds"));

        assert!(!env.cache_dir.join("fake-uuid").exists());
    }

    #[test]
    fn purge_by_size_keeps_what_fits() {
        let env = TestEnv::new();
        env.cache_build("fake-uuid", METADATA);

        env.cmd()
            .args(["cache-purge", "--gb", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Deleted").not());

        assert!(env.cache_dir.join("fake-uuid").exists());
    }

    #[test]
    fn purge_rejects_negative_size() {
        let env = TestEnv::new();

        env.cmd()
            .args(["cache-purge", "--gb=-1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid purge selection"));
    }

    #[test]
    fn build_show_reads_cache() {
        let env = TestEnv::new();
        env.cache_build("fake-uuid", METADATA);

        env.cmd()
            .args(["build-show", "fake-uuid"])
            .assert()
            .success()
            .stdout(predicate::str::contains("nova-next"))
            .stdout(predicate::str::contains("openstack/nova"));
    }

    #[test]
    fn log_store_dir_flag_overrides_env() {
        let env = TestEnv::new();
        let other = env.temp_dir.path().join("other-cache");

        env.cmd()
            .arg("cache-show")
            .arg("--log-store-dir")
            .arg(&other)
            .assert()
            .success();

        assert!(other.is_dir());
        assert!(!env.cache_dir.exists());
    }

    #[test]
    fn settings_file_sets_log_store_dir() {
        let env = TestEnv::new();
        let configured = env.temp_dir.path().join("configured-cache");
        fs::write(
            env.config_dir.join("logsearch.toml"),
            format!("log_store_dir = \"{}\"\n", configured.display()),
        )
        .expect("Failed to write settings");

        env.cmd()
            .env_remove("LOGSEARCH_LOG_STORE_DIR")
            .arg("cache-show")
            .assert()
            .success();

        assert!(configured.is_dir());
    }
}
