//! Architectural Enforcement Tests
//!
//! Source scanning helpers for the checks under `tests/`. They walk the
//! gateway crates' production sources and report lines that break the rules
//! the dispatcher depends on:
//!
//! - No `std::thread::sleep` (blocks a runtime worker; use `tokio::time`)
//! - No `reqwest::blocking` (same reason)
//! - No `std::sync::Mutex` (the codebase uses `parking_lot`)
//! - No `.unwrap()` / `.expect(` outside tests (errors propagate)
//!
//! Test modules are excluded: everything from the first top-level
//! `#[cfg(test)]` line to the end of a file is ignored, matching the
//! convention of keeping unit tests at the bottom.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A banned pattern found in production code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: PathBuf,
    pub line: usize,
    pub pattern: &'static str,
    pub text: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: `{}` in `{}`",
            self.path.display(),
            self.line,
            self.pattern,
            self.text.trim()
        )
    }
}

/// Workspace root, two levels above this crate
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// Every `.rs` file under `gateway/*/src`
pub fn production_sources(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root.join("gateway"))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| path.extension().is_some_and(|ext| ext == "rs"))
        .filter(|path| path.components().any(|c| c.as_os_str() == "src"))
        .collect();
    files.sort();
    files
}

/// Lines before the first top-level `#[cfg(test)]`, with their 1-based
/// numbers. Line comments are dropped.
pub fn production_lines(source: &str) -> Vec<(usize, &str)> {
    source
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.starts_with("#[cfg(test)]"))
        .filter(|(_, line)| !line.trim_start().starts_with("//"))
        .map(|(i, line)| (i + 1, line))
        .collect()
}

/// Find every occurrence of `patterns` in production code under `root`
pub fn scan(root: &Path, patterns: &[&'static str]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for path in production_sources(root) {
        let Ok(source) = fs::read_to_string(&path) else {
            continue;
        };
        for (line, text) in production_lines(&source) {
            for pattern in patterns {
                if text.contains(pattern) {
                    violations.push(Violation {
                        path: path.clone(),
                        line,
                        pattern,
                        text: text.to_string(),
                    });
                }
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_are_found() {
        let files = production_sources(&workspace_root());
        assert!(files.iter().any(|p| p.ends_with("dispatcher.rs")));
        assert!(files.iter().any(|p| p.ends_with("main.rs")));
    }

    #[test]
    fn test_modules_and_comments_are_ignored() {
        let source = "fn a() {}\n// thread::sleep here\nfn b() {}\n#[cfg(test)]\nmod tests { x.unwrap(); }\n";
        let lines = production_lines(source);
        assert_eq!(lines, vec![(1, "fn a() {}"), (3, "fn b() {}")]);
    }

    #[test]
    fn nested_test_items_are_still_scanned() {
        let source = "impl A {\n    #[cfg(test)]\n    fn t() {}\n    fn b() { x.unwrap() }\n}\n";
        assert_eq!(production_lines(source).len(), 5);
    }
}
