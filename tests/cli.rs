//! CLI smoke tests for the verbs that need no external tooling.

use assert_cmd::Command;
use predicates::prelude::*;

fn covolve() -> Command {
    Command::cargo_bin("covolve").expect("binary builds")
}

#[test]
fn help_lists_subcommands() {
    covolve()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("scan"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("init"));
}

#[test]
fn validate_accepts_a_minimal_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("covolve.toml");
    std::fs::write(
        &config,
        "[llm]\nbase_url = \"http://localhost:8000/v1\"\nmodel = \"m\"\n",
    )
    .unwrap();

    covolve()
        .args(["validate", "-c"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn validate_rejects_a_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    covolve()
        .args(["validate", "-c"])
        .arg(dir.path().join("absent.toml"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn validate_rejects_bad_alpha() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("covolve.toml");
    std::fs::write(
        &config,
        "[llm]\nbase_url = \"http://x/v1\"\nmodel = \"m\"\n[knowledge]\nalpha = 2.0\n",
    )
    .unwrap();

    covolve()
        .args(["validate", "-c"])
        .arg(&config)
        .assert()
        .code(1);
}

#[test]
fn init_writes_starter_config_once() {
    let dir = tempfile::tempdir().unwrap();

    covolve()
        .arg("init")
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Created covolve.toml"));
    assert!(dir.path().join("covolve.toml").exists());

    covolve()
        .arg("init")
        .current_dir(dir.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("already exists"));
}
