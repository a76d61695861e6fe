//! CLI argument parsing tests for pcraft-sniff.
//!
//! These only exercise clap's parsing/help output; they never open a socket
//! or read a real capture.

use assert_cmd::Command;
use predicates::prelude::*;

fn sniff_cmd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_pcraft-sniff"))
}

#[test]
fn help_describes_the_tool() {
    sniff_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Sniff ICMP echo traffic"));
}

#[test]
fn version_flag_is_accepted() {
    sniff_cmd().arg("--version").assert().success();
}

#[test]
fn iface_and_read_file_are_mutually_exclusive() {
    sniff_cmd()
        .args(["-i", "eth0", "-r", "capture.pcap"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used"));
}

#[test]
fn missing_source_is_rejected() {
    sniff_cmd().assert().failure().code(2);
}

#[test]
fn invalid_filter_expression_is_rejected() {
    sniff_cmd()
        .args(["-r", "capture.pcap", "-f", "proto"])
        .assert()
        .failure()
        .code(2);
}
