//! Dry-run solves and the shape of their `--json` report.
//!
//! `<solver> create --dry-run --name=solve --json <package>` prints
//!
//! ```text
//! {"actions": {"FETCH": [{"name": ..., "version": ..., "url": ..., "fn": ...}, ...]}}
//! ```
//!
//! The requested package must appear in `FETCH` exactly once. Anything else
//! means the solver's report format is not what this tool was written
//! against, and that is surfaced as an error instead of guessed around.

use serde::Deserialize;

use crate::error::ErrorCode;
use crate::process::Invocation;
use crate::status::PackageDescriptor;

/// One entry of the solver's `FETCH` action list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FetchDescriptor {
    pub name: String,
    pub version: String,
    pub build: String,
    pub build_number: u64,
    pub subdir: String,
    pub channel: String,
    pub url: String,
    #[serde(rename = "fn")]
    pub file_name: String,
}

impl FetchDescriptor {
    /// The subset recorded in status documents.
    #[must_use]
    pub fn descriptor(&self) -> PackageDescriptor {
        PackageDescriptor {
            name: self.name.clone(),
            version: self.version.clone(),
            build: self.build.clone(),
            build_number: self.build_number,
            subdir: self.subdir.clone(),
            channel: self.channel.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SolveReport {
    actions: SolveActions,
}

#[derive(Debug, Deserialize)]
struct SolveActions {
    #[serde(rename = "FETCH")]
    fetch: Vec<FetchDescriptor>,
}

#[derive(Debug, thiserror::Error)]
pub enum SolveError {
    #[error("solver output is not the expected JSON shape: {0}")]
    Shape(#[from] serde_json::Error),

    #[error("solver output fetches {count} entries named {package:?}, expected exactly one")]
    Ambiguous { package: String, count: usize },
}

impl SolveError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::UnexpectedSolverOutput
    }
}

/// Find the single fetch entry for `package` in raw solver stdout.
///
/// # Errors
///
/// Returns [`SolveError::Shape`] if the JSON does not have an
/// `actions.FETCH` list of descriptors, and [`SolveError::Ambiguous`] if the
/// package is listed zero or several times.
pub fn find_fetch(stdout: &[u8], package: &str) -> Result<FetchDescriptor, SolveError> {
    let report: SolveReport = serde_json::from_slice(stdout)?;
    let mut matches: Vec<FetchDescriptor> = report
        .actions
        .fetch
        .into_iter()
        .filter(|info| info.name == package)
        .collect();
    if matches.len() != 1 {
        return Err(SolveError::Ambiguous {
            package: package.to_string(),
            count: matches.len(),
        });
    }
    Ok(matches.remove(0))
}

/// Command line for a dry-run solve of `package`.
#[must_use]
pub fn solve_invocation(program: &str, package: &str) -> Invocation {
    Invocation::new(program).args(["create", "--dry-run", "--name=solve", "--json", package])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> String {
        format!(
            r#"{{"name": "{name}", "version": "1.0", "build": "py_0", "build_number": 0,
                "subdir": "noarch", "channel": "bioconda",
                "url": "https://conda.anaconda.org/bioconda/noarch/{name}-1.0-py_0.tar.bz2",
                "fn": "{name}-1.0-py_0.tar.bz2", "md5": "ignored"}}"#
        )
    }

    fn report(entries: &[String]) -> Vec<u8> {
        format!(
            r#"{{"success": true, "actions": {{"FETCH": [{}], "LINK": []}}}}"#,
            entries.join(",")
        )
        .into_bytes()
    }

    #[test]
    fn picks_the_requested_package() {
        let raw = report(&[entry("python"), entry("multiqc"), entry("click")]);
        let info = find_fetch(&raw, "multiqc").expect("one match");
        assert_eq!(info.name, "multiqc");
        assert_eq!(info.file_name, "multiqc-1.0-py_0.tar.bz2");
        assert_eq!(info.subdir, "noarch");

        let descriptor = info.descriptor();
        assert_eq!(descriptor.version, "1.0");
        assert_eq!(descriptor.build, "py_0");
        assert_eq!(descriptor.channel, "bioconda");
    }

    #[test]
    fn zero_matches_is_an_error() {
        let raw = report(&[entry("python")]);
        let err = find_fetch(&raw, "multiqc").expect_err("no match");
        assert!(matches!(err, SolveError::Ambiguous { count: 0, .. }));
        assert_eq!(err.code(), ErrorCode::UnexpectedSolverOutput);
    }

    #[test]
    fn duplicate_matches_is_an_error() {
        let raw = report(&[entry("multiqc"), entry("multiqc")]);
        let err = find_fetch(&raw, "multiqc").expect_err("two matches");
        assert!(matches!(err, SolveError::Ambiguous { count: 2, .. }));
    }

    #[test]
    fn missing_fetch_list_is_a_shape_error() {
        let err = find_fetch(br#"{"actions": {"LINK": []}}"#, "multiqc").expect_err("no FETCH");
        assert!(matches!(err, SolveError::Shape(_)));
        let err = find_fetch(b"not json", "multiqc").expect_err("garbage");
        assert!(matches!(err, SolveError::Shape(_)));
    }

    #[test]
    fn invocation_matches_solver_cli() {
        let inv = solve_invocation("mamba", "bwa");
        assert_eq!(inv.to_string(), "mamba create --dry-run --name=solve --json bwa");
    }
}
