//! logsearch - search the logs of Zuul CI builds.
//!
//! Builds are looked up through the Zuul REST API, their log files are
//! downloaded into a local cache on demand and searched with ripgrep.
//! Frequently used queries can be stored in config files and replayed.
//!
//! # Modules
//!
//! - [`zuul`] - Build records, the builds API and the day-window query
//! - [`cache`] - Local log cache with statistics and retention purge
//! - [`config`] - Job groups, stored searches and tool settings
//! - [`query`] - Layering of stored searches over command-line parameters
//! - [`search`] - Grep engine boundary and multi-file search of a build
//! - [`commands`] - High-level operations behind each subcommand
//! - [`output`] - Plain-text tables
//! - [`cli`] - Command-line interface definitions

pub mod cache;
pub mod cli;
pub mod commands;
pub mod config;
pub mod output;
pub mod query;
pub mod search;
pub mod zuul;
