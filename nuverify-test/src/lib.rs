// Fixtures and scripted collaborators for nuverify integration tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nuverify_core::analyzer::ScriptAnalyzer;
use nuverify_core::builder::InstructionBuilder;
use nuverify_core::cache::InstructionCache;
use nuverify_core::config::ScanSection;
use nuverify_core::error::{AnalysisError, BuildError};
use nuverify_core::marker::DIRECTORY_MARKER_FILE;
use nuverify_core::pipeline::{CancellationToken, Pipeline, PipelineOptions};
use nuverify_core::progress::{ProgressEmitter, ProgressEvent, ProgressPhase, ProgressSink};
use nuverify_core::source::ChangeLogBlock;
use nuverify_core::types::{
    AnalysisResult, CompatibilityInstruction, CompatibilityIssue, InstructionSet, ScriptRecord,
    Severity,
};
use nuverify_core::version::{Version, VersionRange};

/// A temporary directory tree of Nushell scripts.
#[derive(Debug)]
pub struct ScriptTree {
    pub dir: tempfile::TempDir,
}

impl ScriptTree {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `content` to `relative`, creating parent directories.
    pub fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(&path, content).expect("write script");
        path
    }

    /// A script whose header pins it to `version`.
    pub fn script_at(&self, relative: &str, version: &str) -> PathBuf {
        self.write(
            relative,
            &format!("# nushell-compatible-with: {version}\nls | where size > 1kb\n"),
        )
    }

    /// A script with no marker at all.
    pub fn plain_script(&self, relative: &str) -> PathBuf {
        self.write(relative, "def main [] { ls | get name }\n")
    }

    /// Drop a directory marker into `relative_dir`.
    pub fn mark_dir(&self, relative_dir: &str, version: &str) {
        let dir = self.path().join(relative_dir);
        std::fs::create_dir_all(&dir).expect("create marked dir");
        std::fs::write(dir.join(DIRECTORY_MARKER_FILE), format!("{version}\n"))
            .expect("write directory marker");
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        vec![self.path().to_path_buf()]
    }
}

impl Default for ScriptTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder that synthesizes one release block and one instruction per minor
/// version in the requested range.
#[derive(Debug, Default)]
pub struct ScriptedBuilder {
    pub fetches: AtomicUsize,
    pub fail: bool,
    pub delay: Duration,
}

impl ScriptedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl InstructionBuilder for ScriptedBuilder {
    async fn fetch_change_log(
        &self,
        range: &VersionRange,
    ) -> Result<Vec<ChangeLogBlock>, BuildError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(BuildError::ChangeLogUnavailable {
                from: range.from.clone(),
                to: range.to.clone(),
                reason: "release feed offline".into(),
            });
        }
        let (major, from_minor, _) = range.from.triple();
        let (_, to_minor, _) = range.to.triple();
        Ok((from_minor + 1..=to_minor)
            .map(|minor| ChangeLogBlock {
                version: Version::new(major, minor, 0),
                text: format!("Release {major}.{minor}.0 renames a command"),
                origin: None,
            })
            .collect())
    }

    async fn distill(&self, blocks: &[ChangeLogBlock]) -> Result<InstructionSet, BuildError> {
        Ok(InstructionSet::new(
            blocks
                .iter()
                .map(|b| CompatibilityInstruction {
                    description: format!("breaking change in {}", b.version),
                    introduced_in: b.version.clone(),
                    detection: None,
                    remediation: Some("use the new command".into()),
                })
                .collect(),
        ))
    }
}

/// Analyzer with scripted behavior keyed by file name.
#[derive(Debug, Default)]
pub struct ScriptedAnalyzer {
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Scripts whose analysis fails.
    pub fail_on: Vec<String>,
    /// Scripts reported incompatible.
    pub flag: Vec<String>,
    pub delay: Duration,
    /// Emit this many streaming events per analysis.
    pub stream_chunks: u64,
    /// Cancel the run once this many analyses have started.
    pub cancel_after: Option<(usize, CancellationToken)>,
    /// Instruction counts seen per script, in call order.
    pub seen: Mutex<Vec<(String, usize)>>,
}

impl ScriptedAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn instructions_seen(&self, name: &str) -> Option<usize> {
        self.seen
            .lock()
            .expect("seen lock")
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, count)| *count)
    }
}

#[async_trait::async_trait]
impl ScriptAnalyzer for ScriptedAnalyzer {
    async fn analyze(
        &self,
        script: &ScriptRecord,
        _target: &Version,
        instructions: &InstructionSet,
        progress: ProgressEmitter,
    ) -> Result<AnalysisResult, AnalysisError> {
        let started = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let name = script.name();
        self.seen
            .lock()
            .expect("seen lock")
            .push((name.clone(), instructions.len()));

        if let Some((after, token)) = &self.cancel_after {
            if started >= *after {
                token.cancel();
            }
        }

        for chunk in 1..=self.stream_chunks {
            progress.emit(ProgressPhase::Streaming, chunk, self.stream_chunks);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_on.contains(&name) {
            return Err(AnalysisError::Model(format!("model refused {name}")));
        }
        let issues = if self.flag.contains(&name) {
            vec![CompatibilityIssue {
                severity: Severity::Error,
                message: "uses a removed command".into(),
                suggested_fix: Some("switch to the replacement".into()),
                line: Some(1),
            }]
        } else {
            Vec::new()
        };
        Ok(AnalysisResult::from_issues(script.path.clone(), issues))
    }
}

/// Sink that keeps every event for later inspection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<ProgressEvent>>,
    pub batches: Mutex<Vec<usize>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("events lock").clone()
    }

    /// Events for one script, in delivery order.
    pub fn for_script(&self, path: &Path) -> Vec<ProgressPhase> {
        let key = path.display().to_string();
        self.events()
            .into_iter()
            .filter(|e| e.script == key)
            .map(|e| e.phase)
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn begin(&self, total: usize) {
        self.batches.lock().expect("batches lock").push(total);
    }

    fn report(&self, event: &ProgressEvent) {
        self.events.lock().expect("events lock").push(event.clone());
    }
}

/// Options scanning only `*.nu` files with a fixed model identity.
pub fn options(model_id: &str, max_concurrent: usize) -> PipelineOptions {
    PipelineOptions {
        scan: ScanSection {
            directories: Vec::new(),
            include_patterns: vec!["**/*.nu".into()],
            exclude_patterns: vec!["**/.git/**".into()],
            detect_shebang: false,
        },
        max_concurrent,
        timeout: Duration::from_secs(30),
        model_id: model_id.to_string(),
        ..PipelineOptions::default()
    }
}

/// Pipeline over scripted collaborators.
pub fn pipeline(
    builder: &Arc<ScriptedBuilder>,
    analyzer: &Arc<ScriptedAnalyzer>,
    cache: Option<Arc<InstructionCache>>,
    options: PipelineOptions,
) -> Pipeline {
    Pipeline::new(
        Arc::clone(builder) as Arc<dyn InstructionBuilder>,
        Arc::clone(analyzer) as Arc<dyn ScriptAnalyzer>,
        cache,
        options,
    )
}

pub fn v(raw: &str) -> Version {
    Version::parse(raw).expect("valid version")
}
