//! End-to-end desk workflows: init, roster, reports, listing, transitions
//! and the live watcher.
//!
//! Each test runs the `sitrep` binary as a subprocess in an isolated temp
//! directory.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Test Harness
// ---------------------------------------------------------------------------

fn sitrep(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("sitrep"));
    cmd.current_dir(dir);
    cmd.env("SITREP_LOG", "error");
    cmd.env_remove("FORMAT");
    cmd
}

fn init_desk(dir: &Path) {
    sitrep(dir).args(["init"]).assert().success();
}

/// Shorten the archive delay so `--wait` finishes quickly.
fn fast_archive(dir: &Path) {
    let config = dir.join(".sitrep/config.toml");
    std::fs::write(&config, "[archive]\ndelay_ms = 50\n").expect("write config");
}

fn json(cmd: &mut Command) -> Value {
    let output = cmd.arg("--json").output().expect("command runs");
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid JSON on stdout")
}

fn report(dir: &Path, category: &str, severity: u8, at: &str, officer: Option<&str>) -> String {
    let mut cmd = sitrep(dir);
    cmd.args([
        "report",
        "--category",
        category,
        "--severity",
        &severity.to_string(),
        "--victims",
        "2",
        "--at",
        at,
    ]);
    if let Some(officer) = officer {
        cmd.args(["--officer", officer]);
    }
    let value = json(&mut cmd);
    value["id"].as_str().expect("id field").to_string()
}

fn listed_ids(value: &Value) -> Vec<String> {
    value["records"]
        .as_array()
        .expect("records array")
        .iter()
        .map(|r| r["id"].as_str().expect("id").to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

#[test]
fn commands_before_init_report_not_initialized() {
    let dir = TempDir::new().expect("tempdir");
    sitrep(dir.path())
        .args(["list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E1001"));
}

#[test]
fn init_twice_requires_force() {
    let dir = TempDir::new().expect("tempdir");
    init_desk(dir.path());
    sitrep(dir.path())
        .args(["init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
    sitrep(dir.path()).args(["init", "--force"]).assert().success();
}

// ---------------------------------------------------------------------------
// Reports and listing
// ---------------------------------------------------------------------------

#[test]
fn list_is_newest_first_with_reporter_names() {
    let dir = TempDir::new().expect("tempdir");
    init_desk(dir.path());
    sitrep(dir.path())
        .args(["officer", "add", "off-1", "--name", "Asha Perera", "--phone", "+94 11"])
        .assert()
        .success();

    let older = report(dir.path(), "flood", 3, "2024-05-01T08:00:00Z", Some("off-1"));
    let newer = report(dir.path(), "fire", 5, "2024-05-01T09:00:00Z", Some("off-9"));

    let listed = json(sitrep(dir.path()).args(["list"]));
    assert_eq!(listed["total"], 2);
    assert_eq!(listed_ids(&listed), vec![newer, older]);
    assert_eq!(listed["records"][0]["reporter"]["name"], "Unknown Officer");
    assert_eq!(listed["records"][1]["reporter"]["name"], "Asha Perera");
    assert_eq!(listed["records"][1]["reporter"]["phone"], "+94 11");
}

#[test]
fn severity_and_search_filter_the_page() {
    let dir = TempDir::new().expect("tempdir");
    init_desk(dir.path());
    report(dir.path(), "Flash Flood", 5, "2024-05-01T08:00:00Z", None);
    report(dir.path(), "flood", 2, "2024-05-01T09:00:00Z", None);
    report(dir.path(), "fire", 5, "2024-05-01T10:00:00Z", None);

    let critical = json(sitrep(dir.path()).args(["list", "--severity", "critical"]));
    assert_eq!(critical["total"], 2);

    let floods = json(sitrep(dir.path()).args(["list", "--search", "FLOOD"]));
    assert_eq!(floods["total"], 2);

    let both = json(sitrep(dir.path()).args([
        "list",
        "--search",
        "flood",
        "--severity",
        "critical",
    ]));
    assert_eq!(both["total"], 1);
    assert_eq!(both["records"][0]["category"], "Flash Flood");
}

#[test]
fn pages_split_the_active_list() {
    let dir = TempDir::new().expect("tempdir");
    init_desk(dir.path());
    for hour in 0..5 {
        report(dir.path(), "flood", 3, &format!("2024-05-01T0{hour}:00:00Z"), None);
    }

    let first = json(sitrep(dir.path()).args(["list", "--page-size", "2"]));
    let third = json(sitrep(dir.path()).args(["list", "--page-size", "2", "--page", "3"]));
    assert_eq!(first["total"], 5);
    assert_eq!(listed_ids(&first).len(), 2);
    assert_eq!(listed_ids(&third).len(), 1);
    assert!(!listed_ids(&first).contains(&listed_ids(&third)[0]));
}

#[test]
fn stats_count_the_loaded_page() {
    let dir = TempDir::new().expect("tempdir");
    init_desk(dir.path());
    report(dir.path(), "flood", 5, "2024-05-01T08:00:00Z", None);
    report(dir.path(), "fire", 4, "2024-05-01T09:00:00Z", None);
    report(dir.path(), "storm", 1, "2024-05-01T10:00:00Z", None);

    let stats = json(sitrep(dir.path()).args(["stats"]));
    assert_eq!(stats["total"], 3);
    assert_eq!(stats["critical"], 2);
    assert_eq!(stats["victims"], 6);
    assert_eq!(stats["active"], 3);
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

#[test]
fn completing_moves_an_incident_between_lists() {
    let dir = TempDir::new().expect("tempdir");
    init_desk(dir.path());
    sitrep(dir.path())
        .args(["officer", "add", "off-2", "--name", "Nimal Silva"])
        .assert()
        .success();
    let id = report(dir.path(), "flood", 3, "2024-05-01T08:00:00Z", Some("off-2"));

    let moved = json(sitrep(dir.path()).args(["status", &id, "completed"]));
    assert_eq!(moved["from"], "pending");
    assert_eq!(moved["to"], "completed");

    let active = json(sitrep(dir.path()).args(["list"]));
    assert_eq!(active["total"], 0);

    let completed = json(sitrep(dir.path()).args(["completed", "--search", "nimal"]));
    assert_eq!(listed_ids(&completed), vec![id]);
}

#[test]
fn resolve_with_wait_archives_after_the_delay() {
    let dir = TempDir::new().expect("tempdir");
    init_desk(dir.path());
    fast_archive(dir.path());
    let id = report(dir.path(), "landslide", 4, "2024-05-01T08:00:00Z", None);

    let moved = json(sitrep(dir.path()).args(["status", &id, "RESOLVED", "--wait"]));
    assert_eq!(moved["archival_scheduled"], true);
    assert_eq!(moved["archived"], true);
    assert_eq!(moved["to"], "completed");

    let completed = json(sitrep(dir.path()).args(["completed"]));
    assert_eq!(completed["total"], 1);
}

#[test]
fn unknown_status_is_rejected_with_a_code() {
    let dir = TempDir::new().expect("tempdir");
    init_desk(dir.path());
    let id = report(dir.path(), "flood", 3, "2024-05-01T08:00:00Z", None);

    sitrep(dir.path())
        .args(["status", &id, "escalated"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E2002"));
    sitrep(dir.path())
        .args(["status", &id, "  "])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E2003"));
}

#[test]
fn missing_incident_is_not_found() {
    let dir = TempDir::new().expect("tempdir");
    init_desk(dir.path());
    sitrep(dir.path())
        .args(["status", "inc-00000000", "dispatched"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E2001"));
}

// ---------------------------------------------------------------------------
// Roster and watcher
// ---------------------------------------------------------------------------

#[test]
fn roster_is_sorted_by_name() {
    let dir = TempDir::new().expect("tempdir");
    init_desk(dir.path());
    for (id, name) in [("off-1", "Zara"), ("off-2", "Amal"), ("off-3", "Kumari")] {
        sitrep(dir.path())
            .args(["officer", "add", id, "--name", name])
            .assert()
            .success();
    }
    let roster = json(sitrep(dir.path()).args(["officers"]));
    let names: Vec<&str> = roster
        .as_array()
        .expect("array")
        .iter()
        .map(|o| o["name"].as_str().expect("name"))
        .collect();
    assert_eq!(names, ["Amal", "Kumari", "Zara"]);
}

#[test]
fn watch_prints_the_initial_frame() {
    let dir = TempDir::new().expect("tempdir");
    init_desk(dir.path());
    report(dir.path(), "flood", 3, "2024-05-01T08:00:00Z", None);

    let output = sitrep(dir.path())
        .args(["watch", "--polls", "2", "--interval-ms", "10", "--json"])
        .output()
        .expect("watch runs");
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).expect("utf8");
    let first: Value =
        serde_json::from_str(stdout.lines().next().expect("one frame")).expect("frame is JSON");
    assert_eq!(first["poll"], 0);
    assert_eq!(first["connection"], "connected");
    assert_eq!(first["total"], 1);
}

#[test]
fn text_output_has_headers() {
    let dir = TempDir::new().expect("tempdir");
    init_desk(dir.path());
    report(dir.path(), "flood", 3, "2024-05-01T08:00:00Z", None);
    sitrep(dir.path())
        .args(["list"])
        .env("FORMAT", "text")
        .assert()
        .success()
        .stdout(predicate::str::contains("ID  STATUS  SEV"))
        .stdout(predicate::str::contains("pending  3  2  flood"));
}

#[test]
fn sim_run_passes_a_small_campaign() {
    let dir = TempDir::new().expect("tempdir");
    let result = json(sitrep(dir.path()).args(["sim", "run", "--seeds", "3", "--rounds", "15"]));
    assert_eq!(result["seeds_run"], 3);
    assert_eq!(result["all_passed"], true);
}
