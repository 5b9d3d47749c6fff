//! Integration tests for the `xec` binary's argument parsing and dispatch.
//!
//! These drive the compiled binary directly (via `assert_cmd`) rather than
//! calling `xec::cli::run` in-process, so they also exercise `clap`'s own
//! usage/exit-code behavior.

use assert_cmd::Command;
use predicates::prelude::*;

fn xec() -> Command {
    Command::cargo_bin("xec").expect("xec binary should build")
}

#[test]
fn version_flag_prints_version_and_succeeds() {
    xec().arg("--version").assert().success().stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn missing_subcommand_is_bad_usage() {
    xec().assert().failure().code(2);
}

#[test]
fn on_without_any_hosts_is_bad_usage() {
    xec().arg("on").assert().failure().code(2);
}

#[test]
fn in_against_an_unresolvable_target_reports_target_not_found() {
    let dir = tempfile::tempdir().unwrap();
    xec()
        .current_dir(&dir)
        .args(["in", "no-such-target", "--", "echo", "hi"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("no-such-target"));
}

#[test]
fn unknown_subcommand_falls_through_to_external_and_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    xec().current_dir(&dir).args(["definitely-not-a-registered-command"]).assert().failure();
}

#[test]
fn copy_round_trips_a_file_between_two_local_paths() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("source.txt");
    let dst = dir.path().join("dest.txt");
    std::fs::write(&src, b"hello-from-xec").unwrap();

    xec().current_dir(&dir).args(["copy", src.to_str().unwrap(), dst.to_str().unwrap()]).assert().success();

    assert_eq!(std::fs::read_to_string(&dst).unwrap(), "hello-from-xec");
}

#[test]
fn run_against_an_undeclared_task_is_bad_usage() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join(".xec")).unwrap();
    std::fs::write(dir.path().join(".xec/config.yaml"), "hosts: {}\n").unwrap();

    xec()
        .current_dir(&dir)
        .args(["run", "no-such-task"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("no-such-task"));
}

#[test]
fn json_flag_emits_single_line_json_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let assert = xec()
        .current_dir(&dir)
        .args(["--json", "in", "no-such-target", "--", "echo", "hi"])
        .assert()
        .failure()
        .code(2);
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    let line = stdout.lines().next().expect("one line of JSON on stdout");
    let parsed: serde_json::Value = serde_json::from_str(line).expect("valid JSON");
    assert_eq!(parsed["kind"], "TargetNotFound");
    assert_eq!(parsed["ok"], false);
}
