//! Human-readable and JSON renderings of run reports and cache contents.

use std::fmt::Write as _;
use std::path::Path;

use crate::cache::CacheInfo;
use crate::types::{AnalysisResult, BatchReport, CacheListing, Severity, Verdict};

const RULE: &str = "============================================================";
const THIN_RULE: &str = "------------------------------------------------------------";

/// Plain-text report. Incompatibilities and failed analyses are listed in
/// separate sections; compatible scripts only when `verbose`.
pub fn render_text(report: &BatchReport, verbose: bool) -> String {
    let mut out = String::new();
    let total = report.results.len();
    let compatible = report.count(Verdict::Compatible);
    let incompatible = report.count(Verdict::Incompatible);
    let errored = report.count(Verdict::Error);

    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "NUSHELL COMPATIBILITY REPORT (target {})", report.target);
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "Scripts:        {total}");
    let _ = writeln!(out, "Compatible:     {compatible}");
    let _ = writeln!(out, "Incompatible:   {incompatible}");
    let _ = writeln!(out, "Not analyzed:   {errored}");
    let _ = writeln!(
        out,
        "Instructions:   {} cache hit(s), {} build(s), {} failed build(s)",
        report.cache.hits, report.cache.builds, report.cache.build_failures
    );
    let _ = writeln!(out, "Duration:       {:.1}s", report.duration.as_secs_f64());

    if incompatible > 0 {
        let _ = writeln!(out, "\nINCOMPATIBILITIES FOUND");
        let _ = writeln!(out, "{THIN_RULE}");
        for result in report.incompatible() {
            write_incompatible(&mut out, result);
        }
    }

    if errored > 0 {
        let _ = writeln!(out, "\nCOULD NOT COMPLETE ANALYSIS");
        let _ = writeln!(out, "{THIN_RULE}");
        for result in report.errored() {
            let _ = writeln!(out, "\n{}", display_name(&result.path));
            let _ = writeln!(out, "   Path: {}", result.path.display());
            for issue in &result.issues {
                let _ = writeln!(out, "   Reason: {}", issue.message);
            }
        }
    }

    if verbose && compatible > 0 {
        let _ = writeln!(out, "\nCOMPATIBLE");
        let _ = writeln!(out, "{THIN_RULE}");
        for result in report.compatible() {
            let note = if result.skipped { ", already at target" } else { "" };
            let _ = writeln!(
                out,
                "{} ({}{note})",
                result.path.display(),
                resolution_label(result)
            );
        }
    }

    let _ = writeln!(out, "\n{RULE}");
    if incompatible > 0 {
        let _ = writeln!(out, "{incompatible} script(s) need attention.");
    } else if errored == 0 {
        let _ = writeln!(out, "All scripts are compatible.");
    }
    if errored > 0 {
        let _ = writeln!(out, "{errored} script(s) could not be analyzed; rerun to retry.");
    }
    out
}

fn write_incompatible(out: &mut String, result: &AnalysisResult) {
    let _ = writeln!(out, "\n{}", display_name(&result.path));
    let _ = writeln!(out, "   Path: {}", result.path.display());
    let _ = writeln!(out, "   Last compatible: {}", resolution_label(result));

    for severity in [Severity::Error, Severity::Warning, Severity::Info] {
        let tag = severity.as_str().to_ascii_uppercase();
        for (i, issue) in result
            .issues
            .iter()
            .filter(|issue| issue.severity == severity)
            .enumerate()
        {
            let line = issue.line.map(|l| format!(" (line {l})")).unwrap_or_default();
            let _ = writeln!(out, "   {tag} {}{line}: {}", i + 1, issue.message);
            if let Some(fix) = &issue.suggested_fix {
                let _ = writeln!(out, "      Fix: {fix}");
            }
        }
    }
}

fn resolution_label(result: &AnalysisResult) -> String {
    match &result.resolution {
        Some(r) => format!("{} via {}", r.version, r.source),
        None => "unresolved".to_string(),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |n| n.to_string_lossy().to_string(),
    )
}

pub fn render_json(report: &BatchReport) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(report)
}

/// One row per entry: version, model, creation time, source range.
pub fn render_cache_listing(rows: &[CacheListing]) -> String {
    if rows.is_empty() {
        return "Cache is empty.\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<12} {:<32} {:<20} {:<22} {:>6}",
        "VERSION", "MODEL", "CREATED", "RANGE", "COUNT"
    );
    for row in rows {
        let _ = writeln!(
            out,
            "{:<12} {:<32} {:<20} {:<22} {:>6}",
            row.version.to_string(),
            row.model_id,
            row.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            row.source_range.to_string(),
            row.instruction_count
        );
    }
    out
}

pub fn render_cache_info(info: &CacheInfo) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Directory: {}", info.directory.display());
    let _ = writeln!(out, "Entries:   {}", info.entries);
    let _ = writeln!(out, "Size:      {}", human_bytes(info.total_size_bytes));
    if let (Some(first), Some(last)) = (info.versions.first(), info.versions.last()) {
        let _ = writeln!(out, "Versions:  {first} .. {last}");
    }
    out
}

#[allow(clippy::cast_precision_loss)]
fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CacheStats, CompatibilityIssue, Resolution, RunState, VersionSource};
    use crate::version::{Version, VersionRange};
    use std::path::PathBuf;
    use std::time::Duration;

    fn report() -> BatchReport {
        let resolution = Some(Resolution {
            version: Version::new(0, 94, 0),
            source: VersionSource::Default,
        });
        let mut ok = AnalysisResult::from_issues(PathBuf::from("/s/ok.nu"), vec![]);
        ok.resolution.clone_from(&resolution);
        let mut bad = AnalysisResult::from_issues(
            PathBuf::from("/s/bad.nu"),
            vec![CompatibilityIssue {
                severity: Severity::Error,
                message: "`let-env` removed".into(),
                suggested_fix: Some("$env.X = 1".into()),
                line: Some(3),
            }],
        );
        bad.resolution = resolution;
        let failed = AnalysisResult::failed(PathBuf::from("/s/err.nu"), "analysis timed out after 300s");

        BatchReport {
            target: Version::new(0, 100, 0),
            results: vec![ok, bad, failed],
            cache: CacheStats {
                hits: 1,
                ..CacheStats::default()
            },
            states: vec![RunState::Done],
            duration: Duration::from_millis(1234),
        }
    }

    #[test]
    fn text_separates_incompatible_from_failed() {
        let text = render_text(&report(), false);
        let incompat = text.find("INCOMPATIBILITIES FOUND").unwrap();
        let failed = text.find("COULD NOT COMPLETE ANALYSIS").unwrap();
        assert!(incompat < failed);
        assert!(text.contains("ERROR 1 (line 3): `let-env` removed"));
        assert!(text.contains("Fix: $env.X = 1"));
        assert!(text.contains("Reason: analysis timed out after 300s"));
        assert!(text.contains("Last compatible: 0.94.0 via default"));
        assert!(!text.contains("\nCOMPATIBLE\n"));
        assert!(text.contains("1 script(s) could not be analyzed"));
    }

    #[test]
    fn verbose_lists_compatible() {
        let text = render_text(&report(), true);
        assert!(text.contains("\nCOMPATIBLE\n"));
        assert!(text.contains("/s/ok.nu (0.94.0 via default)"));
    }

    #[test]
    fn json_is_the_report() {
        let json: serde_json::Value = serde_json::from_str(&render_json(&report()).unwrap()).unwrap();
        assert_eq!(json["results"].as_array().unwrap().len(), 3);
        assert_eq!(json["results"][2]["verdict"], "error");
    }

    #[test]
    fn cache_listing_rows() {
        assert_eq!(render_cache_listing(&[]), "Cache is empty.\n");
        let rows = vec![CacheListing {
            version: Version::new(0, 100, 0),
            model_id: "openai/gpt-4".into(),
            created_at: chrono::Utc::now(),
            source_range: VersionRange::new(Version::new(0, 94, 0), Version::new(0, 100, 0)),
            instruction_count: 12,
            size_bytes: 2048,
        }];
        let text = render_cache_listing(&rows);
        assert!(text.lines().nth(1).unwrap().starts_with("0.100.0"));
        assert!(text.contains("(0.94.0, 0.100.0]"));
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
