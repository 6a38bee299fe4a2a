//! Plain-text tables and progress display for terminal output.

use std::fmt;

use indicatif::style::TemplateError;
use indicatif::{ProgressBar, ProgressStyle};

use crate::cache::CacheStats;
use crate::query::ResolvedQuery;
use crate::zuul::Build;

const SIZE_UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Display format of build start times in cache statistics.
const OLDEST_BUILD_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Spinner line shown while log files download.
const DOWNLOAD_TEMPLATE: &str = "{spinner:.green} Downloading {msg} ({pos} chunks)";

/// Left aligned table with a header row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    #[must_use]
    pub fn new<S: Into<String>>(header: impl IntoIterator<Item = S>) -> Self {
        Self {
            header: header.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn add_row<S: Into<String>>(&mut self, row: impl IntoIterator<Item = S>) {
        self.rows.push(row.into_iter().map(Into::into).collect());
    }

    fn widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.header.iter().map(|cell| cell.chars().count()).collect();
        for row in &self.rows {
            for (index, cell) in row.iter().enumerate() {
                let width = cell.chars().count();
                match widths.get_mut(index) {
                    Some(current) => *current = (*current).max(width),
                    None => widths.push(width),
                }
            }
        }
        widths
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let widths = self.widths();
        let border: String = widths
            .iter()
            .map(|width| format!("+{}", "-".repeat(width + 2)))
            .collect::<String>()
            + "+";

        writeln!(f, "{border}")?;
        write_row(f, &widths, &self.header)?;
        writeln!(f, "{border}")?;
        for row in &self.rows {
            write_row(f, &widths, row)?;
        }
        write!(f, "{border}")
    }
}

fn write_row(f: &mut fmt::Formatter<'_>, widths: &[usize], row: &[String]) -> fmt::Result {
    for (index, width) in widths.iter().enumerate() {
        let cell = row.get(index).map_or("", String::as_str);
        write!(f, "| {cell:<width$} ")?;
    }
    writeln!(f, "|")
}

/// Spinner for log downloads, drawn on stderr when it is a terminal.
///
/// # Errors
///
/// Returns an error if the progress template is malformed.
pub fn download_spinner() -> Result<ProgressBar, TemplateError> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template(DOWNLOAD_TEMPLATE)?);
    Ok(spinner)
}

/// Human readable size with two decimals, e.g. `653.00 B` or `1.50 GiB`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.2} {}", SIZE_UNITS[unit])
}

fn cell(value: Option<&String>) -> String {
    value.cloned().unwrap_or_default()
}

/// All interesting fields of one build.
#[must_use]
pub fn build_table(build: &Build) -> Table {
    let mut table = Table::new(["field", "value"]);
    table.add_row(["uuid".to_string(), build.uuid.clone()]);
    table.add_row(["finished".to_string(), cell(build.end_time.as_ref())]);
    table.add_row(["project".to_string(), cell(build.project.as_ref())]);
    table.add_row(["branch".to_string(), cell(build.branch.as_ref())]);
    table.add_row(["job".to_string(), cell(build.job_name.as_ref())]);
    table.add_row(["pipeline".to_string(), cell(build.pipeline.as_ref())]);
    table.add_row(["result".to_string(), cell(build.result.as_ref())]);
    table.add_row(["review".to_string(), build.review().unwrap_or_default()]);
    table.add_row(["log url".to_string(), cell(build.log_url.as_ref())]);
    table
}

/// Columns shown for a list of builds.
///
/// A column is shown when the query did not pin its field to one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildColumn {
    Uuid,
    Finished,
    Project,
    Pipeline,
    Result,
    Review,
    Branch,
    Job,
}

impl BuildColumn {
    fn title(self) -> &'static str {
        match self {
            Self::Uuid => "uuid",
            Self::Finished => "finished",
            Self::Project => "project",
            Self::Pipeline => "pipeline",
            Self::Result => "result",
            Self::Review => "review",
            Self::Branch => "branch",
            Self::Job => "job",
        }
    }

    fn value(self, build: &Build) -> String {
        match self {
            Self::Uuid => build.uuid.clone(),
            Self::Finished => cell(build.end_time.as_ref()),
            Self::Project => cell(build.project.as_ref()),
            Self::Pipeline => cell(build.pipeline.as_ref()),
            Self::Result => cell(build.result.as_ref()),
            Self::Review => build.review().unwrap_or_default(),
            Self::Branch => cell(build.branch.as_ref()),
            Self::Job => cell(build.job_name.as_ref()),
        }
    }

    fn for_query(query: &ResolvedQuery) -> Vec<Self> {
        let mut columns = vec![Self::Uuid, Self::Finished];
        if query.project.is_none() {
            columns.push(Self::Project);
        }
        if query.pipeline.is_none() {
            columns.push(Self::Pipeline);
        }
        if query.result.is_none() {
            columns.push(Self::Result);
        }
        if query.review.is_none() {
            columns.push(Self::Review);
        }
        if query.branches.len() != 1 {
            columns.push(Self::Branch);
        }
        if query.jobs.len() != 1 {
            columns.push(Self::Job);
        }
        columns
    }
}

/// One row per build, with the columns `query` leaves open.
#[must_use]
pub fn builds_table<'a>(builds: impl IntoIterator<Item = &'a Build>, query: &ResolvedQuery) -> Table {
    let columns = BuildColumn::for_query(query);
    let mut table = Table::new(columns.iter().map(|column| column.title()));
    for build in builds {
        table.add_row(columns.iter().map(|column| column.value(build)));
    }
    table
}

/// Builds together with the stored searches whose signature they matched.
#[must_use]
pub fn matched_searches_table<'a>(
    rows: impl IntoIterator<Item = (&'a Build, &'a [String])>,
) -> Table {
    let mut table = Table::new(["uuid", "finished", "project", "job", "review", "matching searches"]);
    for (build, searches) in rows {
        table.add_row([
            build.uuid.clone(),
            cell(build.end_time.as_ref()),
            cell(build.project.as_ref()),
            cell(build.job_name.as_ref()),
            build.review().unwrap_or_default(),
            searches.join(", "),
        ]);
    }
    table
}

/// Cache usage as field/value rows.
#[must_use]
pub fn cache_stats_table(stats: &CacheStats) -> Table {
    let mut table = Table::new(["field", "value"]);
    table.add_row(["Disk size".to_string(), format_size(stats.size_bytes)]);
    table.add_row(["Number of builds".to_string(), stats.builds.to_string()]);
    table.add_row(["Number of logfiles".to_string(), stats.logfiles.to_string()]);
    table.add_row([
        "Oldest build".to_string(),
        stats
            .oldest_build
            .map(|start| start.format(OLDEST_BUILD_FORMAT).to_string())
            .unwrap_or_default(),
    ]);
    table
}
