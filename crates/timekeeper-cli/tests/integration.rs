#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn timekeeper(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("timekeeper").unwrap();
    cmd.current_dir(dir.path())
        .env("TIMEKEEPER_CONFIG", dir.path().join("timekeeper.yaml"))
        .env_remove("RUST_LOG");
    cmd
}

// ---------------------------------------------------------------------------
// timekeeper parse
// ---------------------------------------------------------------------------

#[test]
fn parse_prints_the_plan() {
    let dir = TempDir::new().unwrap();
    timekeeper(&dir)
        .args(["parse", "turn on the porch light for 10 minutes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("DeviceDuration"))
        .stdout(predicate::str::contains("turn on light.porch_light"))
        .stdout(predicate::str::contains("+10:00"));
}

#[test]
fn parse_json_output() {
    let dir = TempDir::new().unwrap();
    let output = timekeeper(&dir)
        .args(["--json", "parse", "set", "a", "pizza", "timer", "for", "15", "minutes"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["shape"], "alarm");
    assert_eq!(json["label"], "pizza");
    assert_eq!(json["actions"][0]["delay"], 900);
}

#[test]
fn parse_recognizes_control_phrases() {
    let dir = TempDir::new().unwrap();
    timekeeper(&dir)
        .args(["parse", "cancel the pizza timer"])
        .assert()
        .success()
        .stdout(predicate::str::contains("control phrase"));
}

#[test]
fn parse_fails_on_non_timer_text() {
    let dir = TempDir::new().unwrap();
    timekeeper(&dir)
        .args(["parse", "what's the weather like"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no timer phrase"));
}

// ---------------------------------------------------------------------------
// timekeeper config
// ---------------------------------------------------------------------------

#[test]
fn config_show_without_file_prints_defaults() {
    let dir = TempDir::new().unwrap();
    timekeeper(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("timer.timekeeper_1"))
        .stdout(predicate::str::contains("mobile_app"));
}

#[test]
fn config_init_then_validate() {
    let dir = TempDir::new().unwrap();
    timekeeper(&dir).args(["config", "init"]).assert().success();
    assert!(dir.path().join("timekeeper.yaml").exists());

    timekeeper(&dir)
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    timekeeper(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn config_validate_rejects_duplicate_handles() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("timekeeper.yaml"),
        "pool:\n  handles:\n    - timer.a\n    - timer.a\n",
    )
    .unwrap();
    timekeeper(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error]"));
}

// ---------------------------------------------------------------------------
// timekeeper run
// ---------------------------------------------------------------------------

#[test]
fn console_sets_and_cancels_a_timer() {
    let dir = TempDir::new().unwrap();
    timekeeper(&dir)
        .args(["run", "--room", "kitchen"])
        .write_stdin(
            "set a pizza timer for 15 minutes\nlist\ncancel the pizza timer\nlist\nexit\n",
        )
        .assert()
        .success()
        .stdout(predicate::str::contains("pizza timer set for 15 minutes"))
        .stdout(predicate::str::contains("Cancelled the pizza timer"))
        .stdout(predicate::str::contains("Nothing running."));
}

#[test]
fn console_reports_unrecognized_input() {
    let dir = TempDir::new().unwrap();
    timekeeper(&dir)
        .arg("run")
        .write_stdin("play some jazz\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("didn't catch a timer"));
}

#[test]
fn console_refuses_invalid_config() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("timekeeper.yaml"), "pool:\n  handles: []\n").unwrap();
    timekeeper(&dir)
        .arg("run")
        .write_stdin("exit\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid config"));
}
