//! CLI integration tests
//!
//! Tests the hargproxy binary using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;

fn hargproxy() -> Command {
    Command::cargo_bin("hargproxy")
        .expect("Failed to locate hargproxy binary - ensure it's built before running tests")
}

#[test]
fn test_cli_help() {
    hargproxy()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("hargproxy"))
        .stdout(predicate::str::contains("--gateway-interface"))
        .stdout(predicate::str::contains("--print-config"));
}

#[test]
fn test_cli_version() {
    hargproxy()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("hargproxy"));
}

#[test]
fn test_print_config_applies_overrides() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[network]
command_port = 4100

[session]
response_timeout = 1500
"#,
    )
    .expect("Failed to write config");

    hargproxy()
        .arg("--config")
        .arg(&path)
        .args(["--gateway-interface", "br0", "--tap", "--print-config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("gateway_interface = \"br0\""))
        .stdout(predicate::str::contains("boiler_interface = \"eth1\""))
        .stdout(predicate::str::contains("command_port = 4100"))
        .stdout(predicate::str::contains("response_timeout = 1500"))
        .stdout(predicate::str::contains("tap = true"));
}

#[test]
fn test_missing_config_file_fails() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");

    hargproxy()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("--print-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_invalid_config_file_fails() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[network]\ndiscovery_port = \"not a port\"\n").expect("Failed to write config");

    hargproxy()
        .arg("--config")
        .arg(&path)
        .arg("--print-config")
        .assert()
        .failure();
}
