//! Command-line smoke tests for the `meshvault` binary

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_subcommands() {
    Command::cargo_bin("meshvault")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("demo"));
}

#[test]
fn test_start_help_lists_flags() {
    Command::cargo_bin("meshvault")
        .unwrap()
        .args(["start", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--listen-addr"))
        .stdout(predicate::str::contains("--bootstrap-node"))
        .stdout(predicate::str::contains("--encryption-key"));
}

#[test]
fn test_invalid_encryption_key_fails() {
    Command::cargo_bin("meshvault")
        .unwrap()
        .args(["start", "--encryption-key", "not-hex"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("encryption_key"));
}

#[test]
fn test_missing_config_file_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    let missing = dir.path().join("absent.toml");

    Command::cargo_bin("meshvault")
        .unwrap()
        .args(["start", "--config"])
        .arg(&missing)
        .assert()
        .failure();
}
