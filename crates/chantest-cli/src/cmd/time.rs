use anyhow::Result;
use chantest_core::clock::{Clock as _, format_utc_time};
use chantest_core::config::Config;
use serde::Serialize;

use crate::output::{OutputMode, kv, render};

#[derive(Debug, Serialize)]
struct TimeReport {
    now: String,
}

/// Execute `chantest time`: print the current time from the time servers.
///
/// # Errors
///
/// Returns an error if every configured server fails.
pub fn run_time(config: &Config, output: OutputMode) -> Result<()> {
    let now = config.time.time_source().now()?;
    let report = TimeReport {
        now: format_utc_time(now),
    };
    render(output, &report, |r, w| kv(w, "now", &r.now))
}
