//! Per-package status documents and the directory tree that holds them.
//!
//! Layout: `<root>/<package>/status.json`. The tester writes a `running`
//! document when it starts on a package and overwrites it with the terminal
//! document when it is done; the selector reads the whole tree on its next
//! run to decide what is stale. There is no locking: a single writer per
//! package is assumed and the last write wins.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ErrorCode;

/// File name of the status document inside a package directory.
pub const STATUS_FILE: &str = "status.json";

/// Result of one solve or test step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "not run")]
    NotRun,
}

impl Outcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
            Self::NotRun => "not run",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a package within one tester run.
///
/// `Running` is the only non-terminal state; the rest are the leaves of
/// `solving -> {solved -> testing -> ...} | ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageState {
    Running,
    Passed,
    Failed,
    TimedOut,
    SolveFailed,
    SolveTimedOut,
}

impl PackageState {
    /// Terminal state implied by an attempt's two outcomes.
    #[must_use]
    pub const fn from_outcomes(solve: Outcome, test: Outcome) -> Self {
        match (solve, test) {
            (Outcome::Success, Outcome::Success) => Self::Passed,
            (Outcome::Success, Outcome::Timeout) => Self::TimedOut,
            (Outcome::Success, Outcome::Failed | Outcome::NotRun) => Self::Failed,
            (Outcome::Timeout, _) => Self::SolveTimedOut,
            (Outcome::Failed | Outcome::NotRun, _) => Self::SolveFailed,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::TimedOut => "timed-out",
            Self::SolveFailed => "solve-failed",
            Self::SolveTimedOut => "solve-timed-out",
        }
    }
}

impl std::fmt::Display for PackageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved package as reported by the solver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    pub build: String,
    pub build_number: u64,
    pub subdir: String,
    pub channel: String,
}

/// Outcome of solving and testing a package with one implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub implementation: String,
    pub solve: Outcome,
    pub test: Outcome,
    /// Present only when the solve succeeded.
    pub package: Option<PackageDescriptor>,
}

impl AttemptRecord {
    /// A record with both steps still `not run`.
    #[must_use]
    pub fn pending(implementation: impl Into<String>) -> Self {
        Self {
            implementation: implementation.into(),
            solve: Outcome::NotRun,
            test: Outcome::NotRun,
            package: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> PackageState {
        PackageState::from_outcomes(self.solve, self.test)
    }
}

/// Persisted record for one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDocument {
    pub name: String,
    pub platform: String,
    #[serde(with = "timestamp")]
    pub started_at: DateTime<Utc>,
    pub state: PackageState,
    #[serde(default, alias = "status")]
    pub attempts: Vec<AttemptRecord>,
}

impl StatusDocument {
    /// Document announcing that testing of `name` has begun.
    #[must_use]
    pub fn running(name: &str, platform: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            platform: platform.to_string(),
            started_at,
            state: PackageState::Running,
            attempts: Vec::new(),
        }
    }

    /// Close out a running document with the given attempts.
    ///
    /// The state is taken from the first attempt; an empty list leaves the
    /// package `solve-failed` since nothing resolved.
    #[must_use]
    pub fn finish(mut self, attempts: Vec<AttemptRecord>) -> Self {
        self.state = attempts
            .first()
            .map_or(PackageState::SolveFailed, AttemptRecord::state);
        self.attempts = attempts;
        self
    }
}

/// `started_at` is stored in the one fixed timestamp layout.
mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    use crate::clock::{format_utc_time, parse_utc_time};

    pub fn serialize<S: Serializer>(time: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_utc_time(*time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse_utc_time(&raw).map_err(D::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("status I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed status document {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StatusError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } => ErrorCode::StatusWriteFailed,
            Self::Json { .. } => ErrorCode::StatusReadFailed,
        }
    }
}

/// Directory-per-package status tree.
#[derive(Debug, Clone)]
pub struct StatusStore {
    root: PathBuf,
}

impl StatusStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the status document and logs for `package`.
    #[must_use]
    pub fn package_dir(&self, package: &str) -> PathBuf {
        self.root.join(package)
    }

    #[must_use]
    pub fn status_path(&self, package: &str) -> PathBuf {
        self.package_dir(package).join(STATUS_FILE)
    }

    /// Load the document for one package, `None` if it has none yet.
    ///
    /// # Errors
    ///
    /// Returns [`StatusError`] if the file exists but cannot be read or parsed.
    pub fn load(&self, package: &str) -> Result<Option<StatusDocument>, StatusError> {
        let path = self.status_path(package);
        match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|source| StatusError::Json { path, source }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StatusError::Io { path, source }),
        }
    }

    /// Load every document in the tree, keyed by package directory name.
    ///
    /// Directories without a status file are ignored; unreadable or
    /// malformed documents are logged and skipped so one bad file cannot
    /// stall selection for the whole channel.
    ///
    /// # Errors
    ///
    /// Returns [`StatusError::Io`] if the root exists but cannot be listed.
    pub fn load_all(&self) -> Result<BTreeMap<String, StatusDocument>, StatusError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(root = %self.root.display(), "status root missing, nothing processed yet");
                return Ok(BTreeMap::new());
            }
            Err(source) => {
                return Err(StatusError::Io {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut documents = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|source| StatusError::Io {
                path: self.root.clone(),
                source,
            })?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !entry.path().join(STATUS_FILE).is_file() {
                continue;
            }
            match self.load(&name) {
                Ok(Some(doc)) => {
                    documents.insert(name, doc);
                }
                Ok(None) => {}
                Err(err) => warn!(package = %name, error = %err, "skipping status document"),
            }
        }
        Ok(documents)
    }

    /// Overwrite the document for `doc.name`.
    ///
    /// Output is pretty-printed with a one-space indent and sorted keys.
    ///
    /// # Errors
    ///
    /// Returns [`StatusError`] if the directory or file cannot be written.
    pub fn write(&self, doc: &StatusDocument) -> Result<PathBuf, StatusError> {
        let path = self.status_path(&doc.name);
        let dir = self.package_dir(&doc.name);
        fs::create_dir_all(&dir).map_err(|source| StatusError::Io {
            path: dir.clone(),
            source,
        })?;

        let bytes = render_sorted(doc).map_err(|source| StatusError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, bytes).map_err(|source| StatusError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

fn render_sorted(doc: &StatusDocument) -> Result<Vec<u8>, serde_json::Error> {
    // serde_json's default map is ordered, so a round trip through `Value`
    // sorts every object's keys.
    let value = serde_json::to_value(doc)?;
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut ser)?;
    out.push(b'\n');
    Ok(out)
}
