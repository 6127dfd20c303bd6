//! E2E tests for `chantest select` against a local stats checkout.
//!
//! Each test runs the binary in an isolated temp directory with `--now`, so
//! neither the time servers nor the stats repository are contacted.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const NOW: &str = "2024-07-01T12:00:00+00:00";
const CHANNEL: &str = "stats/package-downloads/anaconda.org/bioconda";

fn chantest(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("chantest"));
    cmd.current_dir(dir);
    cmd.env("CHANTEST_LOG", "error");
    cmd
}

/// Summary file plus one per-subdir file per `subdirs` entry.
fn add_package(root: &Path, package: &str, totals: &[u64], subdirs: &[&str]) {
    let channel = root.join(CHANNEL);
    let series: Vec<Value> = totals
        .iter()
        .map(|total| json!({"date": "2024-06-30", "total": total}))
        .collect();
    fs::create_dir_all(channel.join(package).join("main")).expect("mkdir");
    fs::write(
        channel.join(format!("{package}.json")),
        json!({"package": package, "downloads_per_date": series}).to_string(),
    )
    .expect("write summary");
    for subdir in subdirs {
        fs::write(
            channel.join(package).join("main").join(format!("{subdir}.json")),
            "{}",
        )
        .expect("write subdir file");
    }
}

fn add_status(root: &Path, package: &str, state: &str, started_at: &str) {
    let dir = root.join("status").join(package);
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(
        dir.join("status.json"),
        json!({
            "name": package,
            "platform": "linux-64",
            "started_at": started_at,
            "state": state,
            "attempts": [],
        })
        .to_string(),
    )
    .expect("write status");
}

fn seed(root: &Path) {
    add_package(root, "bwa", &[10, 100], &["linux-64", "osx-64"]);
    add_package(root, "multiqc", &[50], &["linux-64", "noarch"]);
    add_package(root, "samtools", &[1000], &["linux-64"]);
    add_package(root, "pysam", &[5000], &["linux-64"]);
    add_status(root, "samtools", "passed", "2024-07-01T11:00:00+00:00");
    // started two hours ago on another runner
    add_status(root, "pysam", "running", "2024-07-01T10:00:00+00:00");
}

fn read_list(root: &Path, subdir: &str) -> String {
    fs::read_to_string(root.join("selected_packages").join(format!("{subdir}.txt")))
        .unwrap_or_else(|e| panic!("{subdir}.txt: {e}"))
}

#[test]
fn unlimited_selection_writes_lists_per_subdir() {
    let dir = TempDir::new().expect("tempdir");
    seed(dir.path());

    let output = chantest(dir.path())
        .args(["select", "--stats-dir", "stats", "--num-packages", "0", "--now", NOW, "--json"])
        .output()
        .expect("select should not crash");
    assert!(
        output.status.success(),
        "select failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report: Value = serde_json::from_slice(&output.stdout).expect("select --json output");
    assert_eq!(report["now"], NOW);
    assert_eq!(report["selected"], json!(["bwa", "multiqc", "samtools"]));
    assert_eq!(report["subdirs"], json!({"linux-64": 2, "noarch": 1, "osx-64": 1}));

    assert_eq!(read_list(dir.path(), "linux-64"), "bwa\nsamtools\n");
    assert_eq!(read_list(dir.path(), "noarch"), "multiqc\n");
    assert_eq!(read_list(dir.path(), "osx-64"), "bwa\n");
}

#[test]
fn default_count_picks_the_most_popular_never_tested_package() {
    let dir = TempDir::new().expect("tempdir");
    seed(dir.path());

    chantest(dir.path())
        .args(["select", "--stats-dir", "stats", "--now", NOW])
        .assert()
        .success()
        .stdout(predicate::str::contains("selected:").and(predicate::str::contains("1")));

    assert_eq!(read_list(dir.path(), "linux-64"), "bwa\n");
    assert!(!dir.path().join("selected_packages/noarch.txt").exists());
}

#[test]
fn abandoned_running_package_is_selected_again() {
    let dir = TempDir::new().expect("tempdir");
    add_package(dir.path(), "pysam", &[5], &["linux-64"]);
    add_package(dir.path(), "bwa", &[10], &["linux-64"]);
    add_status(dir.path(), "pysam", "running", "2024-06-29T12:00:00+00:00");
    add_status(dir.path(), "bwa", "failed", "2024-06-01T12:00:00+00:00");

    chantest(dir.path())
        .args(["select", "--stats-dir", "stats", "--num-packages", "1", "--now", NOW])
        .assert()
        .success();

    assert_eq!(read_list(dir.path(), "linux-64"), "pysam\n");
}

#[test]
fn second_selection_replaces_earlier_lists() {
    let dir = TempDir::new().expect("tempdir");
    seed(dir.path());

    chantest(dir.path())
        .args(["select", "--stats-dir", "stats", "--now", NOW])
        .assert()
        .success();
    assert_eq!(read_list(dir.path(), "osx-64"), "bwa\n");

    // bwa has been tested since; only linux-64 packages are due now
    add_status(dir.path(), "bwa", "passed", "2024-07-01T11:30:00+00:00");
    add_status(dir.path(), "multiqc", "passed", "2024-07-01T11:30:00+00:00");
    chantest(dir.path())
        .args(["select", "--stats-dir", "stats", "--now", NOW])
        .assert()
        .success();

    assert_eq!(read_list(dir.path(), "linux-64"), "samtools\n");
    assert!(!dir.path().join("selected_packages/osx-64.txt").exists());
    assert!(!dir.path().join("selected_packages/noarch.txt").exists());
}

#[test]
fn malformed_now_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    seed(dir.path());

    chantest(dir.path())
        .args(["select", "--stats-dir", "stats", "--now", "2024-07-01 12:00"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--now"));
}

#[test]
fn missing_explicit_config_fails() {
    let dir = TempDir::new().expect("tempdir");

    chantest(dir.path())
        .args(["--config", "absent.toml", "select", "--stats-dir", "stats", "--now", NOW])
        .assert()
        .failure()
        .stderr(predicate::str::contains("absent.toml"));
}
