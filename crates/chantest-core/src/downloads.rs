//! Download-count snapshot read from a stats checkout.
//!
//! Each package has one summary file `<channel_dir>/<package>.json`:
//!
//! ```text
//! {"package": "samtools", "downloads_per_date": [{"date": "...", "total": 1234}, ...]}
//! ```
//!
//! Only the last entry of the series matters; it carries the running total.
//! Per-platform files live under `<channel_dir>/<package>/<subdir>.json`
//! (one level of nesting per upload label) and tell which subdirs publish it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::error::ErrorCode;

/// Package name → most recent total download count.
pub type DownloadSnapshot = BTreeMap<String, u64>;

/// Subdir that makes every platform-specific listing redundant.
pub const NOARCH: &str = "noarch";

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl SnapshotError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::SnapshotReadFailed
    }
}

#[derive(Debug, Deserialize)]
struct PackageDownloads {
    package: String,
    downloads_per_date: Vec<DailyTotal>,
}

#[derive(Debug, Deserialize)]
struct DailyTotal {
    total: u64,
}

/// Read every `<channel_dir>/*.json` summary into a snapshot.
///
/// A missing channel directory yields an empty snapshot. Summaries with an
/// empty series are skipped with a warning.
///
/// # Errors
///
/// Returns [`SnapshotError`] if a summary cannot be read or is not the
/// expected JSON shape.
pub fn load_snapshot(channel_dir: &Path) -> Result<DownloadSnapshot, SnapshotError> {
    let mut snapshot = DownloadSnapshot::new();
    for path in json_files(channel_dir)? {
        let raw = fs::read(&path).map_err(|source| SnapshotError::Io {
            path: path.clone(),
            source,
        })?;
        let stats: PackageDownloads =
            serde_json::from_slice(&raw).map_err(|source| SnapshotError::Json {
                path: path.clone(),
                source,
            })?;
        let Some(latest) = stats.downloads_per_date.last() else {
            warn!(path = %path.display(), "download series is empty, skipping");
            continue;
        };
        snapshot.insert(stats.package, latest.total);
    }
    Ok(snapshot)
}

/// Platform subdirs a package is published for, derived from
/// `<channel_dir>/<package>/*/*.json` file stems.
///
/// When `noarch` is among them it is the only subdir returned.
///
/// # Errors
///
/// Returns [`SnapshotError::Io`] if a directory exists but cannot be listed.
pub fn package_subdirs(
    channel_dir: &Path,
    package: &str,
) -> Result<BTreeSet<String>, SnapshotError> {
    let package_dir = channel_dir.join(package);
    let mut subdirs = BTreeSet::new();
    for label_dir in list_dir(&package_dir)? {
        if !label_dir.is_dir() {
            continue;
        }
        for file in json_files(&label_dir)? {
            if let Some(stem) = file.file_stem().and_then(|s| s.to_str()) {
                subdirs.insert(stem.to_string());
            }
        }
    }
    if subdirs.contains(NOARCH) {
        return Ok(BTreeSet::from([NOARCH.to_string()]));
    }
    Ok(subdirs)
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>, SnapshotError> {
    let mut files: Vec<PathBuf> = list_dir(dir)?
        .into_iter()
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, SnapshotError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(SnapshotError::Io {
                path: dir.to_path_buf(),
                source,
            });
        }
    };
    entries
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|source| SnapshotError::Io {
            path: dir.to_path_buf(),
            source,
        })
}
