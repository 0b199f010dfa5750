//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT sleep. The daemon waits on the event
//! loop; a sleeping handler stalls the VT handshake, and the kernel does not
//! wait forever for a release acknowledgement.

use architectural_enforcement::{find_violations, workspace_dir};

const SLEEP_PATTERNS: &[&str] = &["::sleep(", ".sleep(", "usleep("];

fn report(violations: &[architectural_enforcement::SourceLine]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    eprintln!("\n✅ REQUIRED:");
    eprintln!("  - Register interest with the EventLoop and return");
    eprintln!("  - Defer work with EventLoop::defer");
    panic!(
        "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
        violations.len()
    );
}

#[test]
fn test_no_sleep_in_core() {
    report(&find_violations(
        &workspace_dir("splashd/core/src"),
        &[],
        SLEEP_PATTERNS,
    ));
}

#[test]
fn test_no_sleep_in_daemon() {
    report(&find_violations(
        &workspace_dir("splashd/daemon/src"),
        &[],
        SLEEP_PATTERNS,
    ));
}
