//! Integration Test: Single-Threaded Core
//!
//! **Policy**: `splash_core` runs on one thread. It never spawns threads,
//! never takes locks, never depends on an async runtime, and never installs
//! signal handlers: signals arrive as `LoopEvent::Signal` from the loop.

use architectural_enforcement::{find_violations, workspace_dir, SourceLine};

fn check(what: &str, patterns: &[&str]) -> Vec<SourceLine> {
    let violations = find_violations(&workspace_dir("splashd/core/src"), &[], patterns);
    for violation in &violations {
        eprintln!("  ❌ {what}: {violation}");
    }
    violations
}

#[test]
fn test_core_spawns_no_threads() {
    let violations = check("thread", &["thread::spawn", "std::thread::Builder"]);
    assert!(violations.is_empty(), "core must not spawn threads");
}

#[test]
fn test_core_takes_no_locks() {
    let violations = check(
        "lock",
        &["std::sync::Mutex", "std::sync::RwLock", "Arc<Mutex", "parking_lot"],
    );
    assert!(violations.is_empty(), "core state is single-threaded; use Rc/RefCell");
}

#[test]
fn test_core_has_no_runtime() {
    let violations = check("runtime", &["tokio::", "async fn", ".await"]);
    assert!(violations.is_empty(), "core must stay runtime agnostic");
}

#[test]
fn test_core_installs_no_signal_handlers() {
    let violations = check(
        "signal handler",
        &["sigaction(", "signal::signal(", "SigHandler::Handler", "libc::signal("],
    );
    assert!(
        violations.is_empty(),
        "signals reach the core through EventLoop::watch_signal only"
    );
}
