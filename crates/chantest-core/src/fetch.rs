//! Package archive downloads.
//!
//! Solves run against an archived copy of the channel index, so the URLs in
//! the solver report point at the archive mirror. [`UrlRewriter`] maps them
//! back to the live download location before fetching.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info};

use crate::config::DownloadConfig;
use crate::error::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid archive URL pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("GET {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Pattern(_) => ErrorCode::ConfigParseError,
            Self::Http { .. } | Self::Io { .. } => ErrorCode::DownloadFailed,
        }
    }
}

/// Regex substitution from archive-mirror URLs to direct download URLs.
#[derive(Debug, Clone)]
pub struct UrlRewriter {
    pattern: Regex,
    replacement: String,
}

impl UrlRewriter {
    /// # Errors
    ///
    /// Returns [`FetchError::Pattern`] if `pattern` is not a valid regex.
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self, FetchError> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.into(),
        })
    }

    /// # Errors
    ///
    /// Returns [`FetchError::Pattern`] if the configured pattern is invalid.
    pub fn from_config(config: &DownloadConfig) -> Result<Self, FetchError> {
        Self::new(&config.archive_pattern, config.archive_replacement.clone())
    }

    /// Rewrite every match; URLs that do not match are returned unchanged.
    #[must_use]
    pub fn rewrite(&self, url: &str) -> String {
        self.pattern
            .replace_all(url, self.replacement.as_str())
            .into_owned()
    }
}

/// Streams a remote file to disk.
pub trait ArchiveFetcher {
    /// Download `url` into `dest`, overwriting it.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] on HTTP or filesystem failure.
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError>;
}

/// Blocking HTTP fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("chantest/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent }
    }
}

impl ArchiveFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        debug!(url, dest = %dest.display(), "downloading archive");
        let response = self.agent.get(url).call().map_err(|source| FetchError::Http {
            url: url.to_string(),
            source: Box::new(source),
        })?;

        let io_err = |source| FetchError::Io {
            path: dest.to_path_buf(),
            source,
        };
        let mut file = fs::File::create(dest).map_err(io_err)?;
        let bytes = io::copy(&mut response.into_reader(), &mut file).map_err(io_err)?;
        info!(url, bytes, "downloaded archive");
        Ok(bytes)
    }
}

/// Download an archive to `<dir>/<subdir>/<file_name>`, the layout the
/// build tool expects for a local package file.
///
/// # Errors
///
/// Returns [`FetchError`] if the directory cannot be created or the
/// download fails.
pub fn download_into(
    fetcher: &dyn ArchiveFetcher,
    url: &str,
    dir: &Path,
    subdir: &str,
    file_name: &str,
) -> Result<PathBuf, FetchError> {
    let target_dir = dir.join(subdir);
    fs::create_dir_all(&target_dir).map_err(|source| FetchError::Io {
        path: target_dir.clone(),
        source,
    })?;
    let dest = target_dir.join(file_name);
    fetcher.fetch(url, &dest)?;
    Ok(dest)
}
