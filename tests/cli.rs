//! CLI integration tests.
//!
//! Run with: `cargo test --test cli`

use std::path::PathBuf;
use std::process::Command;

fn cli() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_scenario-sandbox"));
    command
        .env("SANDBOX_INSTALLER", "none")
        .env("SANDBOX_QUIET", "1")
        .env("SANDBOX_RETRY_DELAY_MS", "10")
        .env("SANDBOX_SETTLE_DELAY_MS", "5")
        .env("SANDBOX_DISTRIBUTABLE", "none");
    command
}

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

#[test]
fn runs_command_against_loaded_fixture() {
    let output = cli()
        .arg(fixture("minimal-app.yaml"))
        .args(["--", "cat", "src/index.js"])
        .output()
        .unwrap();

    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "console.log(\"hello from the sandbox\");\n"
    );
}

#[test]
fn failing_command_exits_with_one_and_reports_output() {
    let output = cli()
        .arg(fixture("minimal-app.yaml"))
        .args(["--", "echo broken >&2; exit 4"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("broken"));
    assert!(stderr.contains("exit code Some(4)"));
}

#[test]
fn missing_distributable_fails_before_running() {
    let output = cli()
        .env("SANDBOX_DISTRIBUTABLE", "dist/does-not-exist.tgz")
        .args(["--", "true"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("distributable package not found"));
}

#[test]
fn default_distributable_is_required() {
    let workdir = tempfile::TempDir::new().unwrap();
    let output = cli()
        .env_remove("SANDBOX_DISTRIBUTABLE")
        .current_dir(workdir.path())
        .args(["--", "true"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("dist/package.tgz"));
    assert!(stderr.contains("build and pack the project"));
}

#[test]
fn default_distributable_present_allows_run() {
    let workdir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(workdir.path().join("dist")).unwrap();
    std::fs::write(workdir.path().join("dist/package.tgz"), b"tarball").unwrap();

    let output = cli()
        .env_remove("SANDBOX_DISTRIBUTABLE")
        .current_dir(workdir.path())
        .args(["--", "true"])
        .output()
        .unwrap();

    assert!(output.status.success());
}

#[test]
fn separate_arguments_keep_their_quoting() {
    let output = cli()
        .args(["--", "sh", "-c", "echo a b"])
        .output()
        .unwrap();

    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "a b\n");
}

#[test]
fn missing_separator_prints_usage() {
    let output = cli().arg(fixture("minimal-app.yaml")).output().unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Usage:"));
}
