//! Integration Test: Async Core Prohibitions
//!
//! **Policy**: Production code in `gateway/core` and `gateway/daemon` runs on
//! tokio worker threads and MUST NOT block them or panic on recoverable errors.

use architectural_enforcement::{scan, workspace_root, Violation};

fn report(title: &str, violations: &[Violation], remedy: &[&str]) {
    if violations.is_empty() {
        return;
    }

    eprintln!("\n❌ {title}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    eprintln!("\n✅ REQUIRED:");
    for line in remedy {
        eprintln!("  - {line}");
    }

    panic!(
        "\nFound {} violation(s) in production code.\nFix these before merging!",
        violations.len()
    );
}

#[test]
fn test_no_blocking_sleep_in_production_code() {
    let violations = scan(&workspace_root(), &["std::thread::sleep", "thread::sleep("]);
    report(
        "Blocking sleep found in production code!",
        &violations,
        &["tokio::time::sleep(..).await", "tokio::time::interval for periodic work"],
    );
}

#[test]
fn test_no_blocking_http_in_production_code() {
    let violations = scan(&workspace_root(), &["reqwest::blocking"]);
    report(
        "Blocking HTTP client found in production code!",
        &violations,
        &["reqwest::Client with .await"],
    );
}

#[test]
fn test_no_std_mutex_in_production_code() {
    let violations = scan(&workspace_root(), &["std::sync::Mutex"]);
    report(
        "std::sync::Mutex found in production code!",
        &violations,
        &["parking_lot::Mutex / RwLock for short critical sections", "DashMap for shared maps"],
    );
}

#[test]
fn test_no_unwrap_in_production_code() {
    let violations = scan(&workspace_root(), &[".unwrap()", ".expect("]);
    report(
        "unwrap()/expect() found in production code!",
        &violations,
        &["Propagate with ? and a thiserror variant", "anyhow::Context in the daemon binary"],
    );
}
