// Script discovery: glob include/exclude patterns plus shebang detection.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use crate::config::ScanSection;
use crate::marker::find_header_marker;
use crate::types::ScriptRecord;

/// Result of scanning a set of roots.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Scripts in scan order (roots in the order given, paths sorted within a root).
    pub scripts: Vec<ScriptRecord>,
    /// Roots that could be walked.
    pub accessible_roots: Vec<PathBuf>,
    /// Roots that do not exist or could not be read.
    pub inaccessible_roots: Vec<PathBuf>,
}

/// Walks scan roots and builds [`ScriptRecord`]s.
#[derive(Debug, Clone)]
pub struct ScriptScanner {
    include_patterns: Vec<String>,
    exclude_patterns: Vec<glob::Pattern>,
    detect_shebang: bool,
}

impl ScriptScanner {
    pub fn new(config: &ScanSection) -> Self {
        let exclude_patterns = config
            .exclude_patterns
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pat) => Some(pat),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Invalid exclude pattern");
                    None
                }
            })
            .collect();

        Self {
            include_patterns: config.include_patterns.clone(),
            exclude_patterns,
            detect_shebang: config.detect_shebang,
        }
    }

    #[instrument(skip_all, name = "scan")]
    pub fn scan(&self, roots: &[PathBuf]) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        let mut seen = std::collections::HashSet::new();

        for root in roots {
            if std::fs::read_dir(root).is_err() {
                warn!(root = %root.display(), "Scan root is not accessible");
                outcome.inaccessible_roots.push(root.clone());
                continue;
            }
            outcome.accessible_roots.push(root.clone());

            for path in self.walk_root(root) {
                if !seen.insert(path.clone()) {
                    continue;
                }
                match read_script(&path, root) {
                    Ok(record) => outcome.scripts.push(record),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable script"),
                }
            }
        }

        info!(
            scripts = outcome.scripts.len(),
            roots = outcome.accessible_roots.len(),
            inaccessible = outcome.inaccessible_roots.len(),
            "Scan complete"
        );
        outcome
    }

    fn walk_root(&self, root: &Path) -> Vec<PathBuf> {
        let mut matched = Vec::new();

        for pattern in &self.include_patterns {
            let full_pattern = root.join(pattern).to_string_lossy().to_string();
            match glob::glob(&full_pattern) {
                Ok(paths) => {
                    matched.extend(
                        paths
                            .flatten()
                            .filter(|p| p.is_file() && !self.is_excluded(p, root)),
                    );
                }
                Err(e) => warn!(pattern = %pattern, error = %e, "Invalid glob pattern"),
            }
        }

        if self.detect_shebang {
            let all = root.join("**/*").to_string_lossy().to_string();
            if let Ok(paths) = glob::glob(&all) {
                matched.extend(paths.flatten().filter(|p| {
                    p.is_file()
                        && p.extension().is_none()
                        && !self.is_excluded(p, root)
                        && has_nu_shebang(p)
                }));
            }
        }

        matched.sort();
        matched.dedup();
        debug!(root = %root.display(), files = matched.len(), "Walked scan root");
        matched
    }

    fn is_excluded(&self, path: &Path, root: &Path) -> bool {
        let relative = path.strip_prefix(root).unwrap_or(path);
        self.exclude_patterns
            .iter()
            .any(|p| p.matches_path(path) || p.matches_path(relative))
    }
}

fn read_script(path: &Path, root: &Path) -> std::io::Result<ScriptRecord> {
    let bytes = std::fs::read(path)?;
    let content = String::from_utf8_lossy(&bytes).into_owned();
    let has_shebang = content.lines().next().is_some_and(is_nu_shebang);
    let header_marker = find_header_marker(&content);

    Ok(ScriptRecord {
        path: path.to_path_buf(),
        root: root.to_path_buf(),
        content_hash: hash_bytes(&bytes),
        content,
        has_shebang,
        header_marker,
        resolution: None,
    })
}

fn has_nu_shebang(path: &Path) -> bool {
    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    let mut first = String::new();
    // Binary files fail UTF-8 decoding and are simply not scripts.
    if BufReader::new(file).read_line(&mut first).is_err() {
        return false;
    }
    is_nu_shebang(&first)
}

/// `#!/usr/bin/env nu`, `#!/usr/local/bin/nu --stdin`, `#! nushell`, ...
pub fn is_nu_shebang(line: &str) -> bool {
    let Some(rest) = line.trim().strip_prefix("#!") else {
        return false;
    };
    rest.split_whitespace().any(|word| {
        let program = word.rsplit('/').next().unwrap_or(word);
        program == "nu" || program == "nushell"
    })
}

pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn shebang_detection() {
        assert!(is_nu_shebang("#!/usr/bin/env nu"));
        assert!(is_nu_shebang("#!/usr/local/bin/nu --stdin"));
        assert!(is_nu_shebang("#! nushell"));
        assert!(!is_nu_shebang("#!/bin/bash"));
        assert!(!is_nu_shebang("#!/usr/bin/env nuke"));
        assert!(!is_nu_shebang("# nu"));
    }

    #[test]
    fn scans_extension_and_shebang_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "a.nu", "ls\n");
        write(root, "sub/b.nu", "# nushell-compatible-with: 0.95.0\nls\n");
        write(root, "bin/tool", "#!/usr/bin/env nu\nls\n");
        write(root, "bin/other", "#!/bin/sh\necho\n");
        write(root, "notes.txt", "#!/usr/bin/env nu\n");
        write(root, ".git/hooks/x.nu", "ls\n");

        let scanner = ScriptScanner::new(&ScanSection::default());
        let outcome = scanner.scan(&[root.to_path_buf()]);

        let names: Vec<_> = outcome
            .scripts
            .iter()
            .map(|s| s.path.strip_prefix(root).unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, ["a.nu", "bin/tool", "sub/b.nu"]);

        let b = &outcome.scripts[2];
        assert_eq!(b.header_marker.as_deref(), Some("0.95.0"));
        assert!(outcome.scripts[1].has_shebang);
        assert!(outcome.scripts.iter().all(|s| s.resolution.is_none()));
    }

    #[test]
    fn missing_root_is_inaccessible() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let scanner = ScriptScanner::new(&ScanSection::default());
        let outcome = scanner.scan(&[missing.clone(), dir.path().to_path_buf()]);
        assert_eq!(outcome.inaccessible_roots, vec![missing]);
        assert_eq!(outcome.accessible_roots.len(), 1);
        assert!(outcome.scripts.is_empty());
    }

    #[test]
    fn overlapping_roots_do_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "sub/a.nu", "ls\n");
        let scanner = ScriptScanner::new(&ScanSection::default());
        let outcome = scanner.scan(&[dir.path().to_path_buf(), dir.path().join("sub")]);
        assert_eq!(outcome.scripts.len(), 1);
    }

    #[test]
    fn hash_is_content_based() {
        assert_eq!(hash_bytes(b"ls"), hash_bytes(b"ls"));
        assert_ne!(hash_bytes(b"ls"), hash_bytes(b"ps"));
    }
}
