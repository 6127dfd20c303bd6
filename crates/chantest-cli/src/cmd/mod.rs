pub mod select;
pub mod time;

use anyhow::{Context as _, Result};
use chantest_core::clock::{Clock, FixedClock, parse_utc_time};
use chantest_core::config::TimeConfig;

/// The time authority for a command: a fixed instant when `--now` is given,
/// the configured time servers otherwise.
///
/// # Errors
///
/// Returns an error if `now` is not in the fixed timestamp layout.
pub fn clock(now: Option<&str>, config: &TimeConfig) -> Result<Box<dyn Clock>> {
    match now {
        Some(text) => {
            let at = parse_utc_time(text).context("invalid --now")?;
            Ok(Box::new(FixedClock(at)))
        }
        None => Ok(Box::new(config.time_source())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_now_is_used_verbatim() {
        let clock = clock(Some("2024-07-01T06:00:00+00:00"), &TimeConfig::default()).expect("clock");
        let now = clock.now().expect("fixed clock");
        assert_eq!(
            chantest_core::clock::format_utc_time(now),
            "2024-07-01T06:00:00+00:00"
        );
    }

    #[test]
    fn malformed_now_is_rejected() {
        let err = clock(Some("2024-07-01 06:00:00"), &TimeConfig::default())
            .err()
            .expect("bad layout");
        assert!(format!("{err:#}").contains("--now"));
    }
}
