//! Smoke tests -- verify the binary runs and key subcommands exist.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn faultline() -> Command {
    Command::cargo_bin("faultline").unwrap()
}

fn config_file(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("faultline.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "[storage]\ndb_path = {:?}", dir.join("faultline.db").display().to_string()).unwrap();
    path
}

#[test]
fn test_cli_help() {
    faultline()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Telemetry-to-resolution incident pipeline"));
}

#[test]
fn test_cli_version() {
    faultline()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("faultline"));
}

#[test]
fn test_ingest_subcommand_exists() {
    faultline().args(["ingest", "--help"]).assert().success();
}

#[test]
fn test_incident_list_subcommand_exists() {
    faultline().args(["incident", "list", "--help"]).assert().success();
}

#[test]
fn test_forecast_run_subcommand_exists() {
    faultline().args(["forecast", "run", "--help"]).assert().success();
}

#[test]
fn test_simulate_prints_json_lines() {
    let out = faultline()
        .args(["simulate", "--machines", "1", "--metrics", "pressure", "--readings", "4"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    for line in lines {
        let v: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(v["machine_id"], "M001");
    }
}

#[test]
fn test_config_prints_toml() {
    let dir = tempfile::tempdir().unwrap();
    faultline()
        .arg("--config")
        .arg(config_file(dir.path()))
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[storage]").and(predicate::str::contains("faultline.db")));
}

#[test]
fn test_ingest_then_list() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_file(dir.path());
    let readings = dir.path().join("readings.jsonl");
    let sim = faultline()
        .args(["simulate", "--machines", "2", "--readings", "20", "--spike-every", "10"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    std::fs::write(&readings, sim).unwrap();

    faultline()
        .arg("--config")
        .arg(&config)
        .arg("ingest")
        .arg("--file")
        .arg(&readings)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"accepted\": 80"));

    faultline()
        .arg("--config")
        .arg(&config)
        .args(["incident", "list", "--json"])
        .assert()
        .success();
}
