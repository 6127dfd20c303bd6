//! Staleness-then-popularity package selection.
//!
//! Every package in the download snapshot is a candidate. Candidates are
//! ordered by when they were last processed (oldest first, never-processed
//! packages count as processed at the Unix epoch) and ties go to the package
//! with more downloads. Packages another runner is working on right now are
//! left out entirely.
//!
//! The chosen packages are handed to the tester as plain-text lists, one
//! file per platform subdir (`<dir>/<subdir>.txt`, one name per line).

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::downloads::DownloadSnapshot;
use crate::status::{PackageState, StatusDocument};

/// How long a `running` document is trusted before it counts as abandoned.
#[must_use]
pub fn abandon_after() -> Duration {
    Duration::hours(24)
}

/// Processing time assigned to packages with no usable history.
#[must_use]
pub fn epoch() -> DateTime<Utc> {
    DateTime::from(std::time::UNIX_EPOCH)
}

/// When a package was last processed, as far as selection is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Eligible; sorts by this instant.
    Processed(DateTime<Utc>),
    /// Another runner started it recently; not eligible this run.
    InProgress,
}

/// Freshness of a package given its status document (if any).
#[must_use]
pub fn freshness(doc: Option<&StatusDocument>, now: DateTime<Utc>) -> Freshness {
    let Some(doc) = doc else {
        return Freshness::Processed(epoch());
    };
    if doc.state != PackageState::Running {
        return Freshness::Processed(doc.started_at);
    }
    if now - doc.started_at > abandon_after() {
        // interrupted job, as stale as a package never seen
        Freshness::Processed(epoch())
    } else {
        Freshness::InProgress
    }
}

/// Pick up to `max_count` packages to test next.
///
/// `max_count <= 0` returns every eligible package. Packages without a
/// snapshot entry are never returned, whatever their status history.
#[must_use]
pub fn select(
    now: DateTime<Utc>,
    max_count: i64,
    snapshot: &DownloadSnapshot,
    statuses: &BTreeMap<String, StatusDocument>,
) -> Vec<String> {
    let mut candidates: Vec<(DateTime<Utc>, Reverse<u64>, &str)> = snapshot
        .iter()
        .filter_map(|(package, downloads)| {
            match freshness(statuses.get(package), now) {
                Freshness::Processed(at) => Some((at, Reverse(*downloads), package.as_str())),
                Freshness::InProgress => {
                    debug!(package = %package, "already running elsewhere, skipping");
                    None
                }
            }
        })
        .collect();
    candidates.sort_unstable();

    let limit = usize::try_from(max_count)
        .ok()
        .filter(|n| *n > 0)
        .unwrap_or(candidates.len());

    candidates
        .into_iter()
        .take(limit)
        .map(|(_, _, package)| package.to_string())
        .collect()
}

/// Group packages by the subdirs they publish for, keeping selection order
/// within each group. Packages with no known subdir are dropped.
///
/// # Errors
///
/// Propagates the first error returned by `subdirs_of`.
pub fn group_by_subdir<F, E>(
    packages: &[String],
    mut subdirs_of: F,
) -> Result<BTreeMap<String, Vec<String>>, E>
where
    F: FnMut(&str) -> Result<BTreeSet<String>, E>,
{
    let mut lists: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for package in packages {
        for subdir in subdirs_of(package)? {
            lists.entry(subdir).or_default().push(package.clone());
        }
    }
    Ok(lists)
}

/// Path of the list file for `subdir` inside `dir`.
#[must_use]
pub fn list_path(dir: &Path, subdir: &str) -> PathBuf {
    dir.join(format!("{subdir}.txt"))
}

/// Write one `<subdir>.txt` per group, creating `dir` as needed.
///
/// List files left in `dir` by an earlier selection are removed first, so
/// the directory only ever describes the current selection.
///
/// # Errors
///
/// Returns an I/O error if the directory or a list file cannot be written,
/// or a stale list cannot be removed.
pub fn write_package_lists(dir: &Path, lists: &BTreeMap<String, Vec<String>>) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "txt") {
            debug!(path = %path.display(), "removing list from earlier selection");
            fs::remove_file(&path)?;
        }
    }
    for (subdir, packages) in lists {
        let mut file = fs::File::create(list_path(dir, subdir))?;
        for package in packages {
            writeln!(file, "{package}")?;
        }
    }
    Ok(())
}

/// Non-blank trimmed lines of a list file; a missing file reads as empty.
///
/// # Errors
///
/// Returns an I/O error if the file exists but cannot be read.
pub fn read_package_list(path: &Path) -> io::Result<Vec<String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
