use std::env;
use std::io::{self, Write};
use std::process::ExitCode;

use chrono::Utc;
use clap::{CommandFactory, Parser};
use logsearch::cache::RetentionPolicy;
use logsearch::cli::{Cli, Commands};
use logsearch::commands::{self, Session};
use logsearch::config::ConfigStore;
use logsearch::config::settings::{Settings, resolve_config_dir};
use logsearch::output::download_spinner;
use logsearch::query::CliParams;
use logsearch::search::ripgrep::RipgrepMatcher;
use logsearch::zuul::http::ZuulClient;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let debug = cli.debug;

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if debug {
                eprintln!("Error: {err:?}");
            } else {
                eprintln!("Error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let cwd = env::current_dir()?;
    let config_dir = resolve_config_dir(cli.config_dir.as_deref(), &cwd);
    let (settings, store) = match &config_dir {
        Some(dir) => (Settings::load(dir)?, ConfigStore::load_dir(dir)?),
        None => (Settings::default(), ConfigStore::default()),
    };
    let log_store_dir = settings.log_store_dir(cli.log_store_dir.as_deref());

    let mut stdout = io::stdout().lock();
    let out: &mut dyn Write = &mut stdout;

    let client = ZuulClient::new(settings.zuul_api_url(cli.zuul_api_url.as_deref()))?;
    let engine = RipgrepMatcher::new();
    let session = Session {
        builds: &client,
        logs: &client,
        engine: &engine,
        store: &store,
        log_store_dir,
        progress: download_spinner()?,
    };

    match command {
        Commands::Build { filters } => commands::list_builds(&session, &filters.to_params(), out),
        Commands::BuildShow { uuid, tenant } => {
            commands::show_build(&session, tenant.as_deref(), &uuid, out)
        }
        Commands::Log {
            filters,
            search,
            regex,
        } => {
            let params = search.apply(filters.to_params());
            let params = CliParams {
                regex: Some(regex),
                ..params
            };
            commands::search_logs(&session, &params, out)
        }
        Commands::Storedsearch {
            name,
            filters,
            search,
        } => commands::run_stored_search(&session, &name, &search.apply(filters.to_params()), out),
        Commands::Match { filters } => commands::match_searches(&session, &filters.to_params(), out),
        Commands::CacheShow => commands::show_cache(&session.log_store_dir, out),
        Commands::CachePurge { days, gb } => {
            let policy = RetentionPolicy::from_selectors(days, gb)?;
            commands::purge_cache(&session.log_store_dir, policy, Utc::now().naive_utc(), out)
        }
    }
}
