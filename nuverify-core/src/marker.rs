// Version markers: inline header comments and per-directory marker files.

use std::path::Path;

use tracing::warn;

/// Key of the inline header marker: `# nushell-compatible-with: 0.95.0`.
pub const MARKER_KEY: &str = "nushell-compatible-with";

/// Name of the directory-level marker file.
pub const DIRECTORY_MARKER_FILE: &str = ".compatible-nushell-version";

/// Only this many leading lines are searched for the inline marker.
const HEADER_SCAN_LINES: usize = 20;

/// Find the inline marker value in the script's leading comment block.
///
/// Blank lines and `#` comments (including a shebang) form the header; the
/// first other line ends it.
pub fn find_header_marker(content: &str) -> Option<String> {
    for line in content.lines().take(HEADER_SCAN_LINES) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !trimmed.starts_with('#') {
            break;
        }
        if let Some(value) = marker_value(trimmed) {
            return Some(value.to_string());
        }
    }
    None
}

/// `# key: value` → `value` (first whitespace-delimited token).
fn marker_value(line: &str) -> Option<&str> {
    let body = line.trim_start().strip_prefix('#')?.trim_start();
    let rest = body.strip_prefix(MARKER_KEY)?.trim_start().strip_prefix(':')?;
    rest.split_whitespace().next()
}

fn is_marker_line(line: &str) -> bool {
    marker_value(line.trim()).is_some()
}

/// Read the directory marker in `dir`, if present and non-empty.
///
/// Unreadable files are logged and treated as absent.
pub fn read_directory_marker(dir: &Path) -> Option<String> {
    let path = dir.join(DIRECTORY_MARKER_FILE);
    if !path.is_file() {
        return None;
    }
    match std::fs::read_to_string(&path) {
        Ok(raw) => {
            let value = raw.trim();
            (!value.is_empty()).then(|| value.to_string())
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable directory marker");
            None
        }
    }
}

/// Rewrite (or insert) the inline marker so it names `version`.
///
/// An existing marker in the header is replaced in place. Otherwise the marker
/// goes on the first line, or right after a shebang, separated from the
/// following code by a blank line. CRLF line endings are preserved.
pub fn stamp_header(content: &str, version: &str) -> String {
    let marker = format!("# {MARKER_KEY}: {version}");
    let eol = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    let existing = lines
        .iter()
        .take(HEADER_SCAN_LINES)
        .take_while(|l| {
            let t = l.trim();
            t.is_empty() || t.starts_with('#')
        })
        .position(|l| is_marker_line(l));

    if let Some(idx) = existing {
        lines[idx] = marker;
    } else {
        let mut at = 0;
        if lines.first().is_some_and(|l| l.trim_start().starts_with("#!")) {
            if !lines.get(1).is_some_and(|l| l.trim().is_empty()) {
                lines.insert(1, String::new());
            }
            at = 2;
        }
        lines.insert(at, marker);
        if lines.get(at + 1).is_some_and(|l| !l.trim().is_empty()) {
            lines.insert(at + 1, String::new());
        }
    }

    let mut out = lines.join(eol);
    if content.ends_with('\n') || content.is_empty() {
        out.push_str(eol);
    }
    out
}
