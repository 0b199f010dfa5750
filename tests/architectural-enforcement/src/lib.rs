//! Architectural Enforcement
//!
//! Source scans that keep the splash core honest:
//! - No sleep() calls in production code
//! - No threads, locks, or runtime types in the single-threaded core
//! - Signals reach the core only through the event loop
//!
//! The helpers here walk a source tree and yield production lines only:
//! comments are stripped and everything from a `#[cfg(test)]` marker to the
//! end of the file is skipped (test modules live at the bottom of each file).

use std::fs;
use std::path::{Path, PathBuf};

/// One line of production code
#[derive(Debug, Clone)]
pub struct SourceLine {
    /// File the line came from
    pub path: PathBuf,
    /// 1-based line number
    pub number: usize,
    /// Code with any trailing `//` comment removed
    pub code: String,
}

impl std::fmt::Display for SourceLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.number, self.code.trim())
    }
}

/// Directory of a workspace member, relative to the workspace root
#[must_use]
pub fn workspace_dir(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join(relative)
}

/// Production lines of every `.rs` file under `dir`
///
/// Files named in `exclude` (by file name) are skipped entirely.
#[must_use]
pub fn production_lines(dir: &Path, exclude: &[&str]) -> Vec<SourceLine> {
    let mut lines = Vec::new();
    if !dir.exists() {
        return lines;
    }

    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("rs") {
            continue;
        }
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
        if exclude.contains(&name) {
            continue;
        }
        let Ok(content) = fs::read_to_string(path) else {
            continue;
        };

        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("#[cfg(test)]") {
                break;
            }
            if trimmed.starts_with("//") {
                continue;
            }
            let code = line.split("//").next().unwrap_or(line);
            lines.push(SourceLine {
                path: path.to_path_buf(),
                number: idx + 1,
                code: code.to_string(),
            });
        }
    }
    lines
}

/// Production lines under `dir` containing any of `patterns`
#[must_use]
pub fn find_violations(dir: &Path, exclude: &[&str], patterns: &[&str]) -> Vec<SourceLine> {
    production_lines(dir, exclude)
        .into_iter()
        .filter(|line| patterns.iter().any(|pattern| line.code.contains(pattern)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scanner_skips_comments_and_test_modules() {
        let dir = std::env::temp_dir().join(format!("arch-scan-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("sample.rs"),
            "fn a() { std::thread::sleep(d); }\n\
             // std::thread::sleep(d);\n\
             fn b() {} // thread::sleep(d)\n\
             #[cfg(test)]\n\
             mod tests { fn c() { std::thread::sleep(d); } }\n",
        )
        .unwrap();

        let found = find_violations(&dir, &[], &["::sleep("]);
        fs::remove_dir_all(&dir).unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].number, 1);
    }

    #[test]
    fn test_workspace_dirs_exist() {
        assert!(workspace_dir("splashd/core/src").is_dir());
        assert!(workspace_dir("splashd/daemon/src").is_dir());
    }
}
