use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clock::TimeSource;

/// Name of the config file picked up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "chantest.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub time: TimeConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_channel")]
    pub name: String,
    #[serde(default = "default_stats_repo")]
    pub stats_repo: String,
    #[serde(default = "default_downloads_prefix")]
    pub downloads_prefix: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: default_channel(),
            stats_repo: default_stats_repo(),
            downloads_prefix: default_downloads_prefix(),
        }
    }
}

impl ChannelConfig {
    /// Directory (relative to a stats checkout) holding per-package download files.
    #[must_use]
    pub fn channel_dir(&self) -> PathBuf {
        Path::new(&self.downloads_prefix).join(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeConfig {
    #[serde(default = "default_time_servers")]
    pub servers: Vec<String>,
    #[serde(default = "default_time_timeout")]
    pub timeout_secs: u64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            servers: default_time_servers(),
            timeout_secs: default_time_timeout(),
        }
    }
}

impl TimeConfig {
    /// Build the SNTP-backed time source described by this section.
    #[must_use]
    pub fn time_source(&self) -> TimeSource {
        TimeSource::new(self.servers.clone(), Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    #[serde(default = "default_solver_program")]
    pub program: String,
    #[serde(default = "default_solver_timeout")]
    pub timeout_secs: u64,
    /// Exported as `CONDA_RC` for solve runs when set.
    #[serde(default)]
    pub condarc: Option<PathBuf>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            program: default_solver_program(),
            timeout_secs: default_solver_timeout(),
            condarc: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_build_program")]
    pub program: String,
    #[serde(default = "default_build_timeout")]
    pub timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            program: default_build_program(),
            timeout_secs: default_build_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_archive_pattern")]
    pub archive_pattern: String,
    #[serde(default = "default_archive_replacement")]
    pub archive_replacement: String,
    #[serde(default = "default_download_timeout")]
    pub timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            archive_pattern: default_archive_pattern(),
            archive_replacement: default_archive_replacement(),
            timeout_secs: default_download_timeout(),
        }
    }
}

/// Load configuration.
///
/// An explicit `path` must exist. Without one, [`DEFAULT_CONFIG_FILE`] in
/// `cwd` is used when present and built-in defaults otherwise.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: Option<&Path>, cwd: &Path) -> Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let candidate = cwd.join(DEFAULT_CONFIG_FILE);
            if !candidate.exists() {
                return Ok(Config::default());
            }
            candidate
        }
    };

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<Config>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

fn default_channel() -> String {
    "bioconda".to_string()
}

fn default_stats_repo() -> String {
    "https://github.com/bioconda/bioconda-stats".to_string()
}

fn default_downloads_prefix() -> String {
    "package-downloads/anaconda.org".to_string()
}

fn default_time_servers() -> Vec<String> {
    (0..4).map(|i| format!("{i}.pool.ntp.org")).collect()
}

const fn default_time_timeout() -> u64 {
    2
}

fn default_solver_program() -> String {
    "mamba".to_string()
}

const fn default_solver_timeout() -> u64 {
    3 * 60
}

fn default_build_program() -> String {
    "conda-mambabuild".to_string()
}

const fn default_build_timeout() -> u64 {
    9 * 60
}

fn default_archive_pattern() -> String {
    "https://github.com/bioconda/bioconda-repodata-archive/raw/.*/repodata/https=3A=2F/"
        .to_string()
}

fn default_archive_replacement() -> String {
    "https://".to_string()
}

const fn default_download_timeout() -> u64 {
    10 * 60
}
