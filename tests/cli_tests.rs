//! CLI surface tests
//!
//! These only exercise invocations that fail during argument validation,
//! before any sysfs access, so they run on hosts without RAPL and without
//! root.
#![allow(deprecated)] // suppress assert_cmd::Command::cargo_bin deprecation in tests

use predicates::prelude::*;

#[test]
fn test_help_lists_attachment_flags() {
    let mut cmd = assert_cmd::Command::cargo_bin("vatio").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("-p, --pid <PID>"))
        .stdout(predicate::str::contains("--name <NAME>"))
        .stdout(predicate::str::contains("--check"))
        .stdout(predicate::str::contains("--basepower"));
}

#[test]
fn test_help_lists_config_flags() {
    let mut cmd = assert_cmd::Command::cargo_bin("vatio").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("--output <FILE>"))
        .stdout(predicate::str::contains("--basefile <FILE>"))
        .stdout(predicate::str::contains("--base_period <SECONDS>"))
        .stdout(predicate::str::contains("--rapl_period <SECONDS>"))
        .stdout(predicate::str::contains("--interval <SECONDS>"))
        .stdout(predicate::str::contains("--gamma <GAMMA>"))
        .stdout(predicate::str::contains("--delta <DELTA>"))
        .stdout(predicate::str::contains("--loglvl <LOGLVL>"));
}

#[test]
fn test_pid_and_name_are_mutually_exclusive() {
    let mut cmd = assert_cmd::Command::cargo_bin("vatio").unwrap();
    cmd.arg("--pid").arg("1").arg("--name").arg("postgres");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_no_target_is_a_config_error() {
    let mut cmd = assert_cmd::Command::cargo_bin("vatio").unwrap();

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--pid or --name"));
}

#[test]
fn test_invalid_pid_is_rejected() {
    let mut cmd = assert_cmd::Command::cargo_bin("vatio").unwrap();
    cmd.arg("--pid").arg("not_a_number");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid digit found in string"));
}

#[test]
fn test_out_of_range_gamma_is_rejected() {
    let mut cmd = assert_cmd::Command::cargo_bin("vatio").unwrap();
    cmd.arg("--pid").arg("1").arg("--gamma").arg("1.5");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--gamma"));
}

#[test]
fn test_rapl_period_above_interval_is_rejected() {
    let mut cmd = assert_cmd::Command::cargo_bin("vatio").unwrap();
    cmd.arg("--pid")
        .arg("1")
        .arg("--interval")
        .arg("0.5")
        .arg("--rapl_period")
        .arg("2.0");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--rapl_period"));
}

#[test]
fn test_unknown_process_name_is_a_config_error() {
    let mut cmd = assert_cmd::Command::cargo_bin("vatio").unwrap();
    // A comm value longer than 15 chars can never match a real process.
    cmd.arg("--name").arg("no-such-process-name-here");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("no process named"));
}

// Attaching to real processes and reading RAPL counters requires root and
// Intel hardware; those paths are covered by the sampler and rapl module
// tests against synthetic sysfs trees.
