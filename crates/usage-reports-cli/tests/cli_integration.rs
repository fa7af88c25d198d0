use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_ur<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ur"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ur binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ur(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "ur command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn seed_file(dir: &Path) -> PathBuf {
    let records = serde_json::json!([
        {
            "email": "alice@univ-a.example",
            "role": "admin",
            "ip_address": "10.0.0.1",
            "queue_name": "default",
            "rows_returned": 10,
            "date_inserted": "2023-05-01 10:00:00",
            "date_reset": null,
            "outcome": "Success",
            "tool_year": 2023,
            "tool_id": 1,
            "permalink": null
        },
        {
            "email": "bob@univ-b.example",
            "role": "analyst",
            "ip_address": "10.0.0.2",
            "queue_name": "default",
            "rows_returned": 20,
            "date_inserted": "2023-05-02 11:00:00",
            "date_reset": null,
            "outcome": "Success",
            "tool_year": 2023,
            "tool_id": 1,
            "permalink": null
        }
    ]);
    let path = dir.join("records.json");
    fs::write(&path, records.to_string())
        .unwrap_or_else(|err| panic!("failed to write seed file: {err}"));
    path
}

#[test]
fn schema_version_reports_migrated_database() {
    let dir = unique_temp_dir("ur-cli-schema");
    let db = dir.join("reports.sqlite3");

    let value = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(value["current_version"], 1);
    assert_eq!(value["target_version"], 1);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn seed_then_report_round_trips_through_the_store() {
    let dir = unique_temp_dir("ur-cli-report");
    let db = dir.join("reports.sqlite3");
    let input = seed_file(&dir);

    let value = run_json(["--db", path_str(&db), "seed", "--input", path_str(&input)]);
    assert_eq!(value["inserted"], 2);

    let value = run_json([
        "--db",
        path_str(&db),
        "report",
        "user-summary",
        "--domains",
        path_str(&dir.join("missing.json")),
    ]);
    assert_eq!(value["pagination"]["total"], 2);
    assert_eq!(value["users"].as_array().map_or(0, Vec::len), 2);

    let value = run_json([
        "--db",
        path_str(&db),
        "report",
        "detailed-logs",
        "--level",
        "analyst",
    ]);
    assert_eq!(value["pagination"]["total"], 1);
    assert_eq!(value["logs"][0]["email"], "bob@univ-b.example");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn unknown_report_kind_fails() {
    let dir = unique_temp_dir("ur-cli-unknown");
    let db = dir.join("reports.sqlite3");

    let output = run_ur(["--db", path_str(&db), "report", "passwords"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown report kind"));

    let _ = fs::remove_dir_all(&dir);
}
