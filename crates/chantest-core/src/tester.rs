//! Solve-then-test for each selected package.
//!
//! Per package:
//!
//! 1. A `running` status document is written with the authority time.
//! 2. The solver does a dry-run install. A failure or timeout is recorded
//!    and the test step is skipped.
//! 3. The resolved archive is downloaded and handed to the build tool's
//!    `--test` mode.
//! 4. The terminal status document overwrites the `running` one.
//!
//! Captured stdout of any failed or timed-out step is kept next to the
//! status document. Step failures are outcomes, not errors: only problems
//! with the environment itself (a program that cannot be started, a solver
//! report in an unknown format, an unreachable time source) end the run.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::{BuildConfig, Config, SolverConfig};
use crate::fetch::{ArchiveFetcher, UrlRewriter, download_into};
use crate::process::{self, Invocation, ProcessError};
use crate::selector::{list_path, read_package_list};
use crate::solver::{FetchDescriptor, find_fetch, solve_invocation};
use crate::status::{AttemptRecord, Outcome, PackageState, StatusDocument, StatusStore};

/// Directory under the workspace holding the per-subdir package lists.
pub const SELECTED_PACKAGES_DIR: &str = "selected_packages";

/// Drives one platform's packages through solve and test.
pub struct PackageTester<'a> {
    store: StatusStore,
    platform: String,
    solver: SolverConfig,
    build: BuildConfig,
    rewriter: UrlRewriter,
    fetcher: &'a dyn ArchiveFetcher,
    clock: &'a dyn Clock,
}

impl<'a> PackageTester<'a> {
    /// # Errors
    ///
    /// Returns an error if the configured archive URL pattern is invalid.
    pub fn new(
        output_root: &Path,
        platform: &str,
        config: &Config,
        fetcher: &'a dyn ArchiveFetcher,
        clock: &'a dyn Clock,
    ) -> Result<Self> {
        Ok(Self {
            store: StatusStore::new(output_root),
            platform: platform.to_string(),
            solver: config.solver.clone(),
            build: config.build.clone(),
            rewriter: UrlRewriter::from_config(&config.download)?,
            fetcher,
            clock,
        })
    }

    #[must_use]
    pub const fn store(&self) -> &StatusStore {
        &self.store
    }

    /// Solve and test one package, persisting its status document.
    ///
    /// # Errors
    ///
    /// Returns an error if the time source is unavailable, a program cannot
    /// be started, the solver report has an unexpected shape, or the status
    /// document or a log cannot be written.
    pub fn test_package(&self, package: &str) -> Result<StatusDocument> {
        let started_at = self.clock.now()?;
        let running = StatusDocument::running(package, &self.platform, started_at);
        self.store.write(&running)?;

        let attempt = self.attempt(package)?;
        let doc = running.finish(vec![attempt]);
        self.store.write(&doc)?;
        Ok(doc)
    }

    fn attempt(&self, package: &str) -> Result<AttemptRecord> {
        let mut record = AttemptRecord::pending(program_name(&self.solver.program));

        let (solve, fetch_info) = self.solve(package)?;
        record.solve = solve;
        let Some(fetch_info) = fetch_info else {
            return Ok(record);
        };
        record.package = Some(fetch_info.descriptor());
        record.test = self.test_build(package, &fetch_info)?;
        Ok(record)
    }

    fn solve(&self, package: &str) -> Result<(Outcome, Option<FetchDescriptor>)> {
        let mut invocation =
            solve_invocation(&self.solver.program, package).env("CONDA_QUIET", "1");
        if let Some(condarc) = &self.solver.condarc {
            invocation = invocation.env("CONDA_RC", condarc);
        }

        let timeout = Duration::from_secs(self.solver.timeout_secs);
        match process::run(&invocation, timeout) {
            Ok(stdout) => {
                let info = find_fetch(&stdout, package)
                    .with_context(|| format!("solving {package} with {}", self.solver.program))?;
                Ok((Outcome::Success, Some(info)))
            }
            Err(err) => {
                let outcome = step_outcome(err, |log| {
                    let log_name = format!("{}-create.log.json", program_name(&self.solver.program));
                    self.write_log(package, &log_name, log)
                })?;
                Ok((outcome, None))
            }
        }
    }

    fn test_build(&self, package: &str, info: &FetchDescriptor) -> Result<Outcome> {
        let log_name = format!("{}-create.log", program_name(&self.build.program));
        let url = self.rewriter.rewrite(&info.url);
        let scratch = tempfile::TempDir::new().context("creating download directory")?;

        let archive = match download_into(
            self.fetcher,
            &url,
            scratch.path(),
            &info.subdir,
            &info.file_name,
        ) {
            Ok(path) => path,
            Err(err) => {
                warn!(package, url = %url, error = %err, code = %err.code(), "download failed");
                self.write_log(package, &log_name, err.to_string().as_bytes())?;
                return Ok(Outcome::Failed);
            }
        };

        let invocation = Invocation::new(&self.build.program)
            .arg("--test")
            .arg(&archive)
            .env("CONDA_QUIET", "1");
        let timeout = Duration::from_secs(self.build.timeout_secs);
        match process::run(&invocation, timeout) {
            Ok(_) => Ok(Outcome::Success),
            Err(err) => step_outcome(err, |log| self.write_log(package, &log_name, log)),
        }
    }

    fn write_log(&self, package: &str, file_name: &str, log: &[u8]) -> Result<()> {
        let dir = self.store.package_dir(package);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(file_name);
        fs::write(&path, log).with_context(|| format!("writing {}", path.display()))
    }
}

/// Last path component of a configured program, used in records and log names.
fn program_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program)
}

/// Turn a step's process error into its recorded outcome, saving the log.
/// Errors that say nothing about the package are passed through.
fn step_outcome(
    err: ProcessError,
    save_log: impl FnOnce(&[u8]) -> Result<()>,
) -> Result<Outcome> {
    let outcome = match &err {
        ProcessError::TimedOut { .. } => Outcome::Timeout,
        ProcessError::Failed { .. } => Outcome::Failed,
        ProcessError::Spawn { .. } | ProcessError::Io { .. } => return Err(err.into()),
    };
    warn!(error = %err, code = %err.code(), "step did not succeed");
    save_log(err.stdout().unwrap_or_default())?;
    Ok(outcome)
}

/// Packages named in `<workspace>/selected_packages/<subdir>.txt` for any of
/// `subdirs`, sorted and de-duplicated.
///
/// # Errors
///
/// Returns an error if a list file exists but cannot be read.
pub fn collect_packages(workspace: &Path, subdirs: &[String]) -> Result<Vec<String>> {
    let lists_dir = workspace.join(SELECTED_PACKAGES_DIR);
    let mut packages = BTreeSet::new();
    for subdir in subdirs {
        let path = list_path(&lists_dir, subdir);
        let names =
            read_package_list(&path).with_context(|| format!("reading {}", path.display()))?;
        packages.extend(names);
    }
    Ok(packages.into_iter().collect())
}

/// Terminal states reached in one run, by package.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub states: BTreeMap<String, PackageState>,
}

impl RunSummary {
    /// Number of packages that ended in `state`.
    #[must_use]
    pub fn count(&self, state: PackageState) -> usize {
        self.states.values().filter(|s| **s == state).count()
    }
}

/// Test `packages` one after another.
///
/// # Errors
///
/// Returns the first environment-level error (see [`PackageTester::test_package`]);
/// per-package failures are recorded in the summary instead.
pub fn test_packages(tester: &PackageTester<'_>, packages: &[String]) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    let total = packages.len();
    for (i, package) in packages.iter().enumerate() {
        info!("[{}/{total}] testing {package}", i + 1);
        let doc = tester
            .test_package(package)
            .with_context(|| format!("testing {package}"))?;
        info!(package = %package, state = ?doc.state, "package done");
        summary.states.insert(package.clone(), doc.state);
    }
    Ok(summary)
}

/// Output root for a platform inside a workspace.
#[must_use]
pub fn output_root(workspace: &Path, platform: &str) -> PathBuf {
    workspace.join(platform)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::fetch::FetchError;
    use chrono::{TimeZone, Utc};
    use std::cell::RefCell;
    use std::os::unix::fs::PermissionsExt as _;
    use tempfile::TempDir;

    struct FakeFetcher {
        fail: bool,
        urls: RefCell<Vec<String>>,
    }

    impl FakeFetcher {
        fn ok() -> Self {
            Self {
                fail: false,
                urls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ArchiveFetcher for FakeFetcher {
        fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
            self.urls.borrow_mut().push(url.to_string());
            if self.fail {
                return Err(FetchError::Io {
                    path: dest.to_path_buf(),
                    source: std::io::Error::other("connection reset"),
                });
            }
            fs::write(dest, b"fake archive").map_err(|source| FetchError::Io {
                path: dest.to_path_buf(),
                source,
            })?;
            Ok(12)
        }
    }

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path.to_string_lossy().into_owned()
    }

    const SOLVE_OK: &str = r#"cat <<EOF
{"actions": {"FETCH": [
  {"name": "python", "version": "3.12.0", "build": "h0", "build_number": 0, "subdir": "linux-64",
   "channel": "conda-forge", "url": "https://conda.anaconda.org/conda-forge/linux-64/python.conda", "fn": "python.conda"},
  {"name": "bwa", "version": "0.7.18", "build": "he4a0461_1", "build_number": 1, "subdir": "linux-64",
   "channel": "bioconda",
   "url": "https://github.com/bioconda/bioconda-repodata-archive/raw/abc/repodata/https=3A=2F/conda.anaconda.org/bioconda/linux-64/bwa-0.7.18-he4a0461_1.tar.bz2",
   "fn": "bwa-0.7.18-he4a0461_1.tar.bz2"}
]}}
EOF"#;

    struct Fixture {
        _bin: TempDir,
        out: TempDir,
        config: Config,
    }

    fn fixture(solve_body: &str, build_body: &str) -> Fixture {
        let bin = TempDir::new().expect("tempdir");
        let out = TempDir::new().expect("tempdir");
        let mut config = Config::default();
        config.solver.program = script(bin.path(), "fake-solver", solve_body);
        config.solver.timeout_secs = 5;
        config.build.program = script(bin.path(), "fake-build", build_body);
        config.build.timeout_secs = 1;
        Fixture {
            _bin: bin,
            out,
            config,
        }
    }

    fn clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2024, 7, 1, 6, 0, 0).single().expect("valid time"))
    }

    #[test]
    fn passing_package_records_descriptor() {
        let fx = fixture(SOLVE_OK, "test -s \"$2\" && echo tested");
        let fetcher = FakeFetcher::ok();
        let clock = clock();
        let tester =
            PackageTester::new(fx.out.path(), "linux-64", &fx.config, &fetcher, &clock).expect("tester");

        let doc = tester.test_package("bwa").expect("test_package");
        assert_eq!(doc.state, PackageState::Passed);
        assert_eq!(doc.started_at, clock.0);
        let attempt = &doc.attempts[0];
        assert_eq!(attempt.implementation, "fake-solver");
        assert_eq!(attempt.solve, Outcome::Success);
        assert_eq!(attempt.test, Outcome::Success);
        let package = attempt.package.as_ref().expect("descriptor");
        assert_eq!(package.version, "0.7.18");
        assert_eq!(package.build_number, 1);
        assert_eq!(
            *fetcher.urls.borrow(),
            vec!["https://conda.anaconda.org/bioconda/linux-64/bwa-0.7.18-he4a0461_1.tar.bz2"]
        );
        assert_eq!(tester.store().load("bwa").expect("load"), Some(doc));
    }

    #[test]
    fn solve_failure_skips_test_and_keeps_log() {
        let fx = fixture("echo '{\"error\": \"nothing provides bwa\"}'; exit 1", "exit 0");
        let fetcher = FakeFetcher::ok();
        let clock = clock();
        let tester =
            PackageTester::new(fx.out.path(), "linux-64", &fx.config, &fetcher, &clock).expect("tester");

        let doc = tester.test_package("bwa").expect("test_package");
        assert_eq!(doc.state, PackageState::SolveFailed);
        assert_eq!(doc.attempts[0].test, Outcome::NotRun);
        assert!(doc.attempts[0].package.is_none());
        assert!(fetcher.urls.borrow().is_empty());

        let log = fx.out.path().join("bwa").join("fake-solver-create.log.json");
        assert_eq!(fs::read(&log).expect("solver log"), b"{\"error\": \"nothing provides bwa\"}\n");
        assert!(!fx.out.path().join("bwa").join("fake-build-create.log").exists());
    }

    #[test]
    fn build_timeout_is_recorded() {
        let fx = fixture(SOLVE_OK, "echo building; sleep 30");
        let fetcher = FakeFetcher::ok();
        let clock = clock();
        let tester =
            PackageTester::new(fx.out.path(), "linux-64", &fx.config, &fetcher, &clock).expect("tester");

        let doc = tester.test_package("bwa").expect("test_package");
        assert_eq!(doc.state, PackageState::TimedOut);
        assert_eq!(doc.attempts[0].solve, Outcome::Success);
        assert_eq!(doc.attempts[0].test, Outcome::Timeout);
        let log = fx.out.path().join("bwa").join("fake-build-create.log");
        assert_eq!(fs::read(&log).expect("build log"), b"building\n");
    }

    #[test]
    fn download_failure_fails_the_test_step() {
        let fx = fixture(SOLVE_OK, "exit 0");
        let fetcher = FakeFetcher {
            fail: true,
            urls: RefCell::new(Vec::new()),
        };
        let clock = clock();
        let tester =
            PackageTester::new(fx.out.path(), "linux-64", &fx.config, &fetcher, &clock).expect("tester");

        let doc = tester.test_package("bwa").expect("test_package");
        assert_eq!(doc.state, PackageState::Failed);
        assert_eq!(doc.attempts[0].test, Outcome::Failed);
        let log = fs::read_to_string(fx.out.path().join("bwa").join("fake-build-create.log"))
            .expect("build log");
        assert!(log.contains("connection reset"), "{log}");
    }

    #[test]
    fn unexpected_solver_report_is_fatal() {
        let fx = fixture("echo '{\"actions\": {\"FETCH\": []}}'", "exit 0");
        let fetcher = FakeFetcher::ok();
        let clock = clock();
        let tester =
            PackageTester::new(fx.out.path(), "linux-64", &fx.config, &fetcher, &clock).expect("tester");

        let err = tester.test_package("bwa").expect_err("no FETCH match must abort");
        assert!(format!("{err:#}").contains("expected exactly one"), "{err:#}");
        // the running document stays behind, so the next selection skips it for a day
        let doc = tester.store().load("bwa").expect("load").expect("running doc");
        assert_eq!(doc.state, PackageState::Running);
    }

    #[test]
    fn batch_continues_past_failures() {
        let fx = fixture(
            &format!("if [ \"$5\" = bad ]; then exit 2; fi\n{}", SOLVE_OK.replace("bwa", "$5")),
            "exit 0",
        );
        let fetcher = FakeFetcher::ok();
        let clock = clock();
        let tester =
            PackageTester::new(fx.out.path(), "linux-64", &fx.config, &fetcher, &clock).expect("tester");

        let packages = vec!["bad".to_string(), "good".to_string()];
        let summary = test_packages(&tester, &packages).expect("batch");
        assert_eq!(summary.states["bad"], PackageState::SolveFailed);
        assert_eq!(summary.states["good"], PackageState::Passed);
        assert_eq!(summary.count(PackageState::Passed), 1);
    }

    #[test]
    fn package_lists_are_merged_sorted_unique() {
        let ws = TempDir::new().expect("tempdir");
        let lists = ws.path().join(SELECTED_PACKAGES_DIR);
        fs::create_dir_all(&lists).expect("mkdir");
        fs::write(lists.join("linux-64.txt"), "samtools\nbwa\n").expect("write");
        fs::write(lists.join("noarch.txt"), "multiqc\nbwa\n\n").expect("write");

        let subdirs = vec![
            "linux-64".to_string(),
            "noarch".to_string(),
            "osx-64".to_string(),
        ];
        let packages = collect_packages(ws.path(), &subdirs).expect("collect");
        assert_eq!(packages, vec!["bwa", "multiqc", "samtools"]);
        assert_eq!(
            output_root(ws.path(), "linux-64"),
            ws.path().join("linux-64")
        );
    }
}
