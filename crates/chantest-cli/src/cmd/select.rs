use anyhow::{Context as _, Result};
use chantest_core::clock::{Clock as _, format_utc_time};
use chantest_core::config::Config;
use chantest_core::downloads::{load_snapshot, package_subdirs};
use chantest_core::selector::{group_by_subdir, select, write_package_lists};
use chantest_core::stats::StatsCheckout;
use chantest_core::status::StatusStore;
use clap::Args;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::output::{OutputMode, kv, render};

#[derive(Args, Debug)]
pub struct SelectArgs {
    /// How many packages to pick; zero or less picks every eligible package.
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    pub num_packages: i64,

    /// Directory receiving one `<subdir>.txt` list per platform.
    #[arg(long, default_value = "selected_packages")]
    pub output_dir: PathBuf,

    /// Status tree from earlier runs (`<dir>/<package>/status.json`).
    #[arg(long, default_value = "status")]
    pub status_dir: PathBuf,

    /// Existing stats checkout to read instead of cloning the stats repository.
    #[arg(long)]
    pub stats_dir: Option<PathBuf>,

    /// Use this instant (`YYYY-MM-DDTHH:MM:SS+00:00`) instead of asking the time servers.
    #[arg(long)]
    pub now: Option<String>,
}

#[derive(Debug, Serialize)]
struct SelectReport {
    now: String,
    selected: Vec<String>,
    subdirs: BTreeMap<String, usize>,
}

/// Execute `chantest select`.
///
/// # Errors
///
/// Returns an error if the time source, the stats checkout, the status tree
/// or writing the package lists fails.
pub fn run_select(
    args: &SelectArgs,
    config: &Config,
    output: OutputMode,
    cwd: &Path,
) -> Result<()> {
    let now = super::clock(args.now.as_deref(), &config.time)?.now()?;
    info!(now = %format_utc_time(now), "selecting packages");

    let channel_dir = config.channel.channel_dir();
    // the clone lives in here and is removed on return
    let scratch;
    let checkout = if let Some(stats_dir) = &args.stats_dir {
        StatsCheckout::existing(&cwd.join(stats_dir), &channel_dir)
    } else {
        scratch = tempfile::TempDir::new().context("creating stats checkout directory")?;
        StatsCheckout::clone_sparse(&config.channel.stats_repo, scratch.path(), &channel_dir)?
    };

    let snapshot = load_snapshot(&checkout.channel_path())?;
    let statuses = StatusStore::new(cwd.join(&args.status_dir)).load_all()?;
    info!(
        candidates = snapshot.len(),
        known = statuses.len(),
        "loaded download snapshot and status tree"
    );

    let selected = select(now, args.num_packages, &snapshot, &statuses);
    for package in &selected {
        checkout.widen(package)?;
    }
    let channel_path = checkout.channel_path();
    let lists = group_by_subdir(&selected, |package| package_subdirs(&channel_path, package))?;

    let output_dir = cwd.join(&args.output_dir);
    write_package_lists(&output_dir, &lists)
        .with_context(|| format!("writing package lists to {}", output_dir.display()))?;

    let subdirs: BTreeMap<String, usize> = lists
        .iter()
        .map(|(subdir, packages)| (subdir.clone(), packages.len()))
        .collect();
    info!(selected = selected.len(), ?subdirs, "selection written");

    let report = SelectReport {
        now: format_utc_time(now),
        selected,
        subdirs,
    };
    render(output, &report, |r, w| {
        kv(w, "selected", r.selected.len().to_string())?;
        for (subdir, count) in &r.subdirs {
            kv(w, subdir, count.to_string())?;
        }
        Ok(())
    })
}
