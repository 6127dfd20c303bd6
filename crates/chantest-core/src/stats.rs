//! Sparse checkout of the download-statistics repository.
//!
//! The stats repository is large, so it is cloned without blobs and only the
//! per-package summary files are checked out. Once packages are selected the
//! checkout is widened to their per-subdir files, one package at a time.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::error::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to spawn `git {command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`git {command}` exited with code {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl GitError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::GitCommandFailed
    }
}

/// A stats checkout, either cloned here or provided by the caller.
#[derive(Debug, Clone)]
pub struct StatsCheckout {
    root: PathBuf,
    channel_dir: PathBuf,
    sparse: bool,
}

impl StatsCheckout {
    /// Clone `repo` into the existing empty directory `root`, checking out
    /// only `<channel_dir>/*.json`.
    ///
    /// # Errors
    ///
    /// Returns [`GitError`] if any git step fails.
    pub fn clone_sparse(repo: &str, root: &Path, channel_dir: &Path) -> Result<Self, GitError> {
        info!(repo, dest = %root.display(), "cloning stats repository");
        git(
            root,
            &[
                "clone",
                "--depth=1",
                "--filter=blob:none",
                "--no-checkout",
                repo,
                ".",
            ],
        )?;
        git(root, &["sparse-checkout", "init", "--no-cone"])?;
        let summaries = format!("{}/*.json", slashed(channel_dir));
        git(root, &["sparse-checkout", "set", "--no-cone", &summaries])?;
        git(root, &["checkout", "--quiet"])?;

        Ok(Self {
            root: root.to_path_buf(),
            channel_dir: channel_dir.to_path_buf(),
            sparse: true,
        })
    }

    /// Use a directory that already holds the files; nothing is fetched.
    #[must_use]
    pub fn existing(root: &Path, channel_dir: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            channel_dir: channel_dir.to_path_buf(),
            sparse: false,
        }
    }

    /// Absolute path of the channel's download directory.
    #[must_use]
    pub fn channel_path(&self) -> PathBuf {
        self.root.join(&self.channel_dir)
    }

    /// Add `<channel_dir>/<package>/*/*.json` to the checkout.
    ///
    /// A no-op for [`StatsCheckout::existing`] checkouts.
    ///
    /// # Errors
    ///
    /// Returns [`GitError`] if `git sparse-checkout add` fails.
    pub fn widen(&self, package: &str) -> Result<(), GitError> {
        if !self.sparse {
            return Ok(());
        }
        let pattern = format!("{}/{package}/*/*.json", slashed(&self.channel_dir));
        git(&self.root, &["sparse-checkout", "add", &pattern])
    }
}

fn slashed(path: &Path) -> String {
    path.to_string_lossy().trim_end_matches('/').to_string()
}

fn git(cwd: &Path, args: &[&str]) -> Result<(), GitError> {
    let command = args.join(" ");
    debug!(cwd = %cwd.display(), "git {command}");
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|source| GitError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(GitError::Failed {
            command,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}
