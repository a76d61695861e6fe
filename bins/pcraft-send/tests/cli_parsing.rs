//! CLI argument parsing tests for pcraft-send.
//!
//! These only exercise clap's parsing/help output; they never open a raw
//! socket (which would require privileges the test environment doesn't have).

use assert_cmd::Command;
use predicates::prelude::*;

fn send_cmd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_pcraft-send"))
}

#[test]
fn help_describes_the_tool() {
    send_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Send ICMP echo requests"));
}

#[test]
fn version_flag_is_accepted() {
    send_cmd().arg("--version").assert().success();
}

#[test]
fn missing_src_and_dst_is_rejected() {
    send_cmd()
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--src"));
}

#[test]
fn missing_dst_is_rejected() {
    send_cmd()
        .args(["--src", "10.0.0.1"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--dst"));
}

#[test]
fn malformed_address_is_rejected() {
    send_cmd()
        .args(["--src", "not-an-ip", "--dst", "10.0.0.2"])
        .assert()
        .failure()
        .code(2);
}
