#![forbid(unsafe_code)]

mod cmd;
mod output;

use chantest_core::clock::TimeError;
use chantest_core::config::load_config;
use chantest_core::downloads::SnapshotError;
use chantest_core::error::ErrorCode;
use chantest_core::fetch::FetchError;
use chantest_core::process::ProcessError;
use chantest_core::solver::SolveError;
use chantest_core::stats::GitError;
use chantest_core::status::StatusError;
use clap::{Parser, Subcommand};
use output::OutputMode;
use std::env;
use std::path::PathBuf;
use tracing::{debug, error};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "chantest: continuous install-and-test sweeps over a package channel",
    long_about = None
)]
struct Cli {
    /// Config file (default: `chantest.toml` in the working directory, if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Pick the next packages to test",
        long_about = "Rank every package in the download snapshot by when it was last \
                      tested, then by downloads, and write per-subdir package lists.",
        after_help = "EXAMPLES:\n    # Pick the 50 stalest packages\n    chantest select --num-packages 50\n\n    # Use a local stats checkout\n    chantest select --stats-dir ../bioconda-stats"
    )]
    Select(cmd::select::SelectArgs),

    #[command(
        about = "Solve and test the selected packages",
        long_about = "Dry-run solve each listed package, test its archive with the build \
                      tool, and write a status document per package.",
        after_help = "EXAMPLES:\n    # Test the linux-64 and noarch lists on a linux-64 runner\n    chantest test --subdir linux-64 --subdir noarch"
    )]
    Test(cmd::test::TestArgs),

    #[command(about = "Print the current time from the configured time servers")]
    Time,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CHANTEST_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "chantest=debug,info"
        } else {
            "chantest=info,warn"
        })
    });

    let format = env::var("CHANTEST_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Code of the first typed library error in the chain.
fn error_code(err: &anyhow::Error) -> Option<ErrorCode> {
    err.chain().find_map(|cause| {
        cause
            .downcast_ref::<TimeError>()
            .map(TimeError::code)
            .or_else(|| cause.downcast_ref::<ProcessError>().map(ProcessError::code))
            .or_else(|| cause.downcast_ref::<SolveError>().map(SolveError::code))
            .or_else(|| cause.downcast_ref::<StatusError>().map(StatusError::code))
            .or_else(|| cause.downcast_ref::<SnapshotError>().map(SnapshotError::code))
            .or_else(|| cause.downcast_ref::<GitError>().map(GitError::code))
            .or_else(|| cause.downcast_ref::<FetchError>().map(FetchError::code))
    })
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cwd = env::current_dir()?;
    let config = load_config(cli.config.as_deref(), &cwd)?;
    debug!(?config, "configuration loaded");
    let output = OutputMode::from_json_flag(cli.json);

    let result = match cli.command {
        Commands::Select(ref args) => cmd::select::run_select(args, &config, output, &cwd),
        Commands::Test(ref args) => cmd::test::run_test(args, &config, output, &cwd),
        Commands::Time => cmd::time::run_time(&config, output),
    };

    if let Some(code) = result.as_ref().err().and_then(error_code) {
        error!(code = %code, "{}", code.message());
        if let Some(hint) = code.hint() {
            eprintln!("hint: {hint}");
        }
    }
    result
}
