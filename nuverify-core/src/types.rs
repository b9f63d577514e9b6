use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::{Version, VersionRange};

// ── Scripts ────────────────────────────────────────────────────────

/// Which resolution tier produced a script's last-compatible version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionSource {
    /// Inline `# nushell-compatible-with:` comment in the script header.
    Header,
    /// `.compatible-nushell-version` file in the script's directory or an ancestor.
    Directory,
    /// Computed from the target version.
    Default,
}

impl VersionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Directory => "directory",
            Self::Default => "default",
        }
    }
}

impl std::fmt::Display for VersionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved last-known-compatible version plus the tier it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub version: Version,
    pub source: VersionSource,
}

/// One discovered script.
///
/// Created by the scanner with `resolution: None`; the pipeline fills it
/// exactly once via [`ScriptRecord::with_resolution`] before analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRecord {
    pub path: PathBuf,
    /// Scan root this script was found under; bounds the directory-marker walk.
    pub root: PathBuf,
    #[serde(skip)]
    pub content: String,
    pub content_hash: u64,
    pub has_shebang: bool,
    /// Raw inline marker value, if the header carried one.
    pub header_marker: Option<String>,
    pub resolution: Option<Resolution>,
}

impl ScriptRecord {
    /// File name for display.
    pub fn name(&self) -> String {
        self.path.file_name().map_or_else(
            || self.path.display().to_string(),
            |n| n.to_string_lossy().to_string(),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Resolved version, if resolution already ran.
    pub fn version(&self) -> Option<&Version> {
        self.resolution.as_ref().map(|r| &r.version)
    }
}

// ── Instructions ───────────────────────────────────────────────────

/// One distilled breaking or deprecated behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityInstruction {
    pub description: String,
    pub introduced_in: Version,
    /// How to spot the old pattern in a script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection: Option<String>,
    pub remediation: Option<String>,
}

/// Ordered compatibility instructions for one target version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionSet {
    pub instructions: Vec<CompatibilityInstruction>,
}

impl InstructionSet {
    pub fn new(instructions: Vec<CompatibilityInstruction>) -> Self {
        Self { instructions }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Instructions introduced inside `range`, order preserved.
    pub fn within(&self, range: &VersionRange) -> InstructionSet {
        InstructionSet {
            instructions: self
                .instructions
                .iter()
                .filter(|i| range.contains(&i.introduced_in))
                .cloned()
                .collect(),
        }
    }
}

/// Persisted cache record: an instruction set plus informational metadata.
///
/// `model_id` is recorded but never part of the lookup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub version: Version,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub source_range: VersionRange,
    pub instructions: InstructionSet,
}

/// Row returned by cache introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheListing {
    pub version: Version,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub source_range: VersionRange,
    pub instruction_count: usize,
    pub size_bytes: u64,
}

// ── Analysis results ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    /// Lenient parse of model output; unknown values become warnings.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" | "critical" | "high" => Self::Error,
            "info" | "low" | "note" => Self::Info,
            _ => Self::Warning,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

/// One problem the analyzer found in a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityIssue {
    pub severity: Severity,
    pub message: String,
    pub suggested_fix: Option<String>,
    pub line: Option<u32>,
}

impl CompatibilityIssue {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            suggested_fix: None,
            line: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Compatible,
    Incompatible,
    /// Analysis could not be completed; the issues explain why.
    Error,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compatible => "compatible",
            Self::Incompatible => "incompatible",
            Self::Error => "error",
        }
    }
}

/// Terminal outcome for one script in one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub path: PathBuf,
    pub verdict: Verdict,
    pub issues: Vec<CompatibilityIssue>,
    pub resolution: Option<Resolution>,
    /// True when no boundary call was needed (already at or past the target).
    #[serde(default)]
    pub skipped: bool,
}

impl AnalysisResult {
    /// Verdict derived from the issue list.
    pub fn from_issues(path: PathBuf, issues: Vec<CompatibilityIssue>) -> Self {
        let verdict = if issues.is_empty() {
            Verdict::Compatible
        } else {
            Verdict::Incompatible
        };
        Self {
            path,
            verdict,
            issues,
            resolution: None,
            skipped: false,
        }
    }

    /// Degraded result carrying the failure cause as an issue.
    pub fn failed(path: PathBuf, cause: impl std::fmt::Display) -> Self {
        Self {
            path,
            verdict: Verdict::Error,
            issues: vec![CompatibilityIssue::error(cause.to_string())],
            resolution: None,
            skipped: false,
        }
    }
}

// ── Batch report ───────────────────────────────────────────────────

/// Pipeline lifecycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Scanning,
    ResolvingVersions,
    EnsuringInstructions,
    Analyzing,
    Reporting,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scanning => "scanning",
            Self::ResolvingVersions => "resolving_versions",
            Self::EnsuringInstructions => "ensuring_instructions",
            Self::Analyzing => "analyzing",
            Self::Reporting => "reporting",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Legal successor states. `Failed` is reachable only from setup stages.
    pub fn can_advance_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (Self::Scanning, Self::ResolvingVersions | Self::Failed)
                | (Self::ResolvingVersions, Self::EnsuringInstructions)
                | (
                    Self::EnsuringInstructions,
                    Self::Analyzing | Self::Failed
                )
                | (Self::Analyzing, Self::Reporting)
                | (Self::Reporting, Self::Done)
        )
    }
}

/// Instruction acquisition counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub build_failures: u64,
}

/// Everything a run produced, sorted by scan order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub target: Version,
    pub results: Vec<AnalysisResult>,
    pub cache: CacheStats,
    pub states: Vec<RunState>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl BatchReport {
    pub fn count(&self, verdict: Verdict) -> usize {
        self.results.iter().filter(|r| r.verdict == verdict).count()
    }

    pub fn compatible(&self) -> impl Iterator<Item = &AnalysisResult> {
        self.results
            .iter()
            .filter(|r| r.verdict == Verdict::Compatible)
    }

    pub fn incompatible(&self) -> impl Iterator<Item = &AnalysisResult> {
        self.results
            .iter()
            .filter(|r| r.verdict == Verdict::Incompatible)
    }

    pub fn errored(&self) -> impl Iterator<Item = &AnalysisResult> {
        self.results.iter().filter(|r| r.verdict == Verdict::Error)
    }

    pub fn has_incompatibilities(&self) -> bool {
        self.count(Verdict::Incompatible) > 0
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
