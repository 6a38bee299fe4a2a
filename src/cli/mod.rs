//! CLI interface for logsearch.
//!
//! Provides command-line argument parsing using clap.

use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};

use crate::query::CliParams;
use crate::search::ContextOptions;
use crate::zuul::BuildResult;

/// Command-line interface for logsearch.
#[derive(Debug, Parser)]
#[command(name = "logsearch")]
#[command(author, version, about = "Search Zuul CI results", long_about = None)]
pub struct Cli {
    /// Print debug logs.
    #[arg(long, global = true)]
    pub debug: bool,

    /// The API url of the Zuul deployment to use.
    /// Defaulted to the OpenDev Zuul (https://zuul.opendev.org/api).
    #[arg(long, global = true, env = "LOGSEARCH_ZUUL_API_URL")]
    pub zuul_api_url: Option<String>,

    /// The local directory to download the logs to. Defaulted to .logsearch/.
    #[arg(long, global = true, env = "LOGSEARCH_LOG_STORE_DIR")]
    pub log_store_dir: Option<PathBuf>,

    /// The directory holding the job groups and stored searches.
    /// Defaulted to .logsearch.conf.d/ if it exists, else the user config
    /// directory.
    #[arg(long, global = true, env = "LOGSEARCH_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Filters selecting builds.
#[derive(Debug, Clone, Default, Args)]
pub struct BuildFilterArgs {
    /// The name of the tenant in the Zuul installation. Defaulted to 'openstack'.
    #[arg(long)]
    pub tenant: Option<String>,

    /// The name of the project built.
    #[arg(long)]
    pub project: Option<String>,

    /// The name of the Zuul pipeline the build run.
    #[arg(long)]
    pub pipeline: Option<String>,

    /// The name of the Zuul job run the build. Can be repeated to express OR
    /// relationship.
    #[arg(long = "job", value_name = "JOB")]
    pub jobs: Vec<String>,

    /// The name of a job group defined in the config files. Can be repeated.
    #[arg(long = "job-group", value_name = "GROUP")]
    pub job_groups: Vec<String>,

    /// The name of the git branch the build run on. Can be repeated to express
    /// OR relationship.
    #[arg(long = "branch", value_name = "BRANCH")]
    pub branches: Vec<String>,

    /// The result of the build.
    #[arg(long, value_enum)]
    pub result: Option<BuildResult>,

    /// Filter for voting jobs.
    #[arg(long, conflicts_with = "non_voting")]
    pub voting: bool,

    /// Filter for non voting jobs.
    #[arg(long)]
    pub non_voting: bool,

    /// Number of builds returned. Defaulted to 10.
    #[arg(long)]
    pub limit: Option<u64>,

    /// The review number (Gerrit change) the builds belong to.
    #[arg(long, value_name = "CHANGE")]
    pub review: Option<u64>,

    /// The patchset number of the review. Requires --review.
    #[arg(long)]
    pub patchset: Option<u64>,

    /// Only builds started in the last N days.
    #[arg(long, value_name = "N")]
    pub days: Option<u32>,
}

impl BuildFilterArgs {
    fn voting(&self) -> Option<bool> {
        match (self.voting, self.non_voting) {
            (true, _) => Some(true),
            (false, true) => Some(false),
            (false, false) => None,
        }
    }

    /// Parameters carrying these filters.
    #[must_use]
    pub fn to_params(&self) -> CliParams {
        CliParams {
            tenant: self.tenant.clone(),
            project: self.project.clone(),
            pipeline: self.pipeline.clone(),
            jobs: self.jobs.clone(),
            job_groups: self.job_groups.clone(),
            branches: self.branches.clone(),
            result: self.result,
            voting: self.voting(),
            limit: self.limit,
            review: self.review,
            patchset: self.patchset,
            days: self.days,
            ..CliParams::default()
        }
    }
}

/// Which files to search and how much context to show.
#[derive(Debug, Clone, Default, Args)]
pub struct SearchArgs {
    /// A relative filepath within the build directory to search in. Can be
    /// repeated. Defaulted to job-output.txt.
    #[arg(long = "file", value_name = "PATH")]
    pub files: Vec<String>,

    /// Print number of lines of leading context before matching lines.
    #[arg(short = 'B', long)]
    pub before_context: Option<u32>,

    /// Print number of lines of trailing context after matching lines.
    #[arg(short = 'A', long)]
    pub after_context: Option<u32>,

    /// Print number of context lines.
    #[arg(short = 'C', long)]
    pub context: Option<u32>,
}

impl SearchArgs {
    /// Add the search settings to `params`.
    #[must_use]
    pub fn apply(&self, params: CliParams) -> CliParams {
        CliParams {
            files: self.files.clone(),
            context: ContextOptions {
                before: self.before_context,
                after: self.after_context,
                context: self.context,
            },
            ..params
        }
    }
}

/// Available CLI commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Search for builds.
    Build {
        #[command(flatten)]
        filters: BuildFilterArgs,
    },

    /// Show the metadata of a specific build.
    BuildShow {
        /// The UUID of the build.
        uuid: String,

        /// The tenant to ask Zuul in if the build is not cached.
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Search the logs of the builds.
    Log {
        #[command(flatten)]
        filters: BuildFilterArgs,

        #[command(flatten)]
        search: SearchArgs,

        /// A regular expression to search for.
        regex: String,
    },

    /// Run a search defined in the config files.
    Storedsearch {
        /// The name of the stored search.
        name: String,

        #[command(flatten)]
        filters: BuildFilterArgs,

        #[command(flatten)]
        search: SearchArgs,
    },

    /// Check which stored searches match the builds.
    Match {
        #[command(flatten)]
        filters: BuildFilterArgs,
    },

    /// Show statistics of the local log cache.
    CacheShow,

    /// Delete old builds from the local log cache.
    #[command(group(ArgGroup::new("selector").required(true).args(["days", "gb"])))]
    CachePurge {
        /// Keep only the builds started in the last N days.
        #[arg(long, value_name = "N")]
        days: Option<u32>,

        /// Keep only the most recent builds fitting into this many GiB.
        #[arg(long, value_name = "GB")]
        gb: Option<f64>,
    },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn log_args_become_params() {
        let cli = Cli::parse_from([
            "logsearch",
            "log",
            "--job",
            "nova-next",
            "--job-group",
            "devstack",
            "--branch",
            "master",
            "--result",
            "POST_FAILURE",
            "--non-voting",
            "--file",
            "a.txt",
            "-B",
            "2",
            "--days",
            "3",
            "ERROR",
        ]);

        let Some(Commands::Log {
            filters,
            search,
            regex,
        }) = cli.command
        else {
            panic!("expected log command");
        };
        let params = search.apply(filters.to_params());

        assert_eq!(regex, "ERROR");
        assert_eq!(params.jobs, vec!["nova-next"]);
        assert_eq!(params.job_groups, vec!["devstack"]);
        assert_eq!(params.branches, vec!["master"]);
        assert_eq!(params.result, Some(BuildResult::PostFailure));
        assert_eq!(params.voting, Some(false));
        assert_eq!(params.files, vec!["a.txt"]);
        assert_eq!(params.context.before, Some(2));
        assert_eq!(params.days, Some(3));
        assert_eq!(params.tenant, None);
    }

    #[test]
    fn voting_flags_conflict() {
        let result = Cli::try_parse_from(["logsearch", "build", "--voting", "--non-voting"]);
        assert!(result.is_err());
    }

    #[test]
    fn purge_requires_exactly_one_selector() {
        assert!(Cli::try_parse_from(["logsearch", "cache-purge"]).is_err());
        assert!(Cli::try_parse_from(["logsearch", "cache-purge", "--days", "1", "--gb", "1"]).is_err());
        assert!(Cli::try_parse_from(["logsearch", "cache-purge", "--gb", "0.5"]).is_ok());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from(["logsearch", "cache-show", "--log-store-dir", "/tmp/x", "--debug"]);

        assert!(cli.debug);
        assert_eq!(cli.log_store_dir, Some(PathBuf::from("/tmp/x")));
    }
}
