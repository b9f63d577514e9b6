//! Run orchestration: scan, resolve, ensure instructions, analyze, report.
//!
//! ```text
//! Scanning → ResolvingVersions → EnsuringInstructions → Analyzing → Reporting → Done
//!     └──────────────── Failed ◄──────────┘
//! ```
//!
//! Only setup problems end in `Failed`. Build and analysis failures are
//! folded into per-script [`AnalysisResult`]s with verdict `error`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OnceCell, Semaphore, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::analyzer::ScriptAnalyzer;
use crate::builder::{InstructionBuilder, build_instructions};
use crate::cache::InstructionCache;
use crate::config::{ScanSection, VerifierConfig};
use crate::error::{AnalysisError, BuildError, ConfigError, SetupError, VerifierError};
use crate::progress::{ProgressEmitter, ProgressHub, ProgressPhase, estimate_tokens};
use crate::resolve::VersionResolver;
use crate::scan::ScriptScanner;
use crate::types::{
    AnalysisResult, BatchReport, CacheEntry, CacheStats, InstructionSet, RunState, ScriptRecord,
    Verdict,
};
use crate::version::{Version, VersionRange};

/// Run-level cancellation flag, shared between the signal handler and tasks.
///
/// Checked before every boundary call; in-flight calls are never interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Knobs for one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub scan: ScanSection,
    pub max_concurrent: usize,
    pub timeout: Duration,
    pub resolver: VersionResolver,
    /// Recorded in cache entries; never part of a lookup.
    pub model_id: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            scan: ScanSection::default(),
            max_concurrent: 4,
            timeout: Duration::from_secs(300),
            resolver: VersionResolver::default(),
            model_id: "unknown".to_string(),
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &VerifierConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            scan: config.scan.clone(),
            max_concurrent: config.analysis.max_concurrent.max(1) as usize,
            timeout: Duration::from_secs(config.analysis.timeout_secs),
            resolver: VersionResolver::new(
                config.analysis.default_distance,
                config.floor_version()?,
            ),
            model_id: config.model_id(),
        })
    }
}

type BuildOutcome = Result<Arc<InstructionSet>, String>;

/// Coalesces builds: one build per distinct range for the pipeline's lifetime.
#[derive(Debug, Default)]
struct InstructionRegistry {
    slots: Mutex<HashMap<String, Arc<OnceCell<BuildOutcome>>>>,
}

impl InstructionRegistry {
    fn slot(&self, range: &VersionRange) -> Arc<OnceCell<BuildOutcome>> {
        let key = format!("{}..{}", range.from.cache_key(), range.to.cache_key());
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(slots.entry(key).or_default())
    }
}

/// Instructions available to this run and the oldest version they reach.
#[derive(Debug)]
struct Coverage {
    set: Option<Arc<InstructionSet>>,
    /// Scripts at or above this version are covered by `set`.
    from: Version,
    failure: Option<String>,
}

impl Coverage {
    fn none() -> Self {
        Self {
            set: None,
            from: Version::ZERO,
            failure: None,
        }
    }

    fn for_script(&self, version: &Version) -> Result<&Arc<InstructionSet>, String> {
        match &self.set {
            Some(set) if *version >= self.from => Ok(set),
            _ => Err(self
                .failure
                .clone()
                .unwrap_or_else(|| format!("no instructions cover version {version}"))),
        }
    }
}

/// Tracks the run's state trace and rejects illegal transitions.
#[derive(Debug)]
struct StateTrace(Vec<RunState>);

impl StateTrace {
    fn new() -> Self {
        Self(vec![RunState::Scanning])
    }

    fn advance(&mut self, next: RunState) {
        let current = self.current();
        debug_assert!(
            current.can_advance_to(next),
            "illegal transition {current:?} -> {next:?}"
        );
        debug!(from = current.as_str(), to = next.as_str(), "Run state");
        self.0.push(next);
    }

    fn current(&self) -> RunState {
        self.0.last().copied().unwrap_or(RunState::Scanning)
    }
}

/// Top-level coordinator for compatibility runs.
#[derive(Debug)]
pub struct Pipeline {
    builder: Arc<dyn InstructionBuilder>,
    analyzer: Arc<dyn ScriptAnalyzer>,
    cache: Option<Arc<InstructionCache>>,
    options: PipelineOptions,
    registry: InstructionRegistry,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        builder: Arc<dyn InstructionBuilder>,
        analyzer: Arc<dyn ScriptAnalyzer>,
        cache: Option<Arc<InstructionCache>>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            builder,
            analyzer,
            cache,
            options,
            registry: InstructionRegistry::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Check every script under `roots` against `target`.
    ///
    /// Returns `Err` only for setup failures; everything else is reported
    /// per script in the [`BatchReport`].
    #[instrument(skip_all, name = "pipeline_run", fields(target = %target))]
    pub async fn run(
        &self,
        roots: &[PathBuf],
        target: &Version,
        progress: &ProgressHub,
    ) -> Result<BatchReport, SetupError> {
        let started = Instant::now();
        let mut states = StateTrace::new();
        let mut stats = CacheStats::default();

        // Scanning
        let scanner = ScriptScanner::new(&self.options.scan);
        let outcome = scanner.scan(roots);
        if outcome.accessible_roots.is_empty() {
            states.advance(RunState::Failed);
            return Err(SetupError::NoAccessibleRoots(outcome.inaccessible_roots));
        }
        if outcome.scripts.is_empty() {
            states.advance(RunState::Failed);
            return Err(SetupError::NoScripts(outcome.accessible_roots));
        }
        if self.cancel.is_cancelled() {
            states.advance(RunState::Failed);
            return Err(SetupError::Cancelled);
        }

        // ResolvingVersions
        states.advance(RunState::ResolvingVersions);
        let scripts: Vec<ScriptRecord> = outcome
            .scripts
            .into_iter()
            .map(|s| self.options.resolver.resolve_record(s, target))
            .collect();

        // EnsuringInstructions
        states.advance(RunState::EnsuringInstructions);
        let earliest = scripts
            .iter()
            .filter_map(ScriptRecord::version)
            .filter(|v| *v < target)
            .min()
            .cloned();
        let coverage = match earliest {
            Some(earliest) => {
                if self.cancel.is_cancelled() {
                    states.advance(RunState::Failed);
                    return Err(SetupError::Cancelled);
                }
                self.ensure_instructions(&VersionRange::new(earliest, target.clone()), &mut stats)
                    .await
            }
            None => Coverage::none(),
        };

        // Analyzing
        states.advance(RunState::Analyzing);
        let results = self.analyze_all(scripts, target, &coverage, progress).await;

        // Reporting
        states.advance(RunState::Reporting);
        let mut report = BatchReport {
            target: target.clone(),
            results,
            cache: stats,
            states: Vec::new(),
            duration: started.elapsed(),
        };
        info!(
            scripts = report.results.len(),
            compatible = report.count(Verdict::Compatible),
            incompatible = report.count(Verdict::Incompatible),
            errors = report.count(Verdict::Error),
            "Run complete"
        );
        states.advance(RunState::Done);
        report.states = states.0;
        Ok(report)
    }

    /// Cache hit, else one coalesced build for `needed`.
    async fn ensure_instructions(&self, needed: &VersionRange, stats: &mut CacheStats) -> Coverage {
        let cached = self
            .cache
            .as_ref()
            .and_then(|cache| cache.get(&needed.to, &self.options.model_id));

        if let Some(entry) = &cached {
            if entry.source_range.from <= needed.from {
                stats.hits += 1;
                info!(version = %needed.to, model = %entry.model_id, "Using cached instructions");
                return Coverage {
                    set: Some(Arc::new(entry.instructions.clone())),
                    from: needed.from.clone(),
                    failure: None,
                };
            }
            info!(
                cached = %entry.source_range,
                needed = %needed,
                "Cached instructions do not reach back far enough, rebuilding"
            );
        }
        if self.cache.is_some() {
            stats.misses += 1;
        }

        let (outcome, fresh) = self.build_range(needed).await;
        if fresh {
            stats.builds += 1;
        }
        match outcome {
            Ok(set) => Coverage {
                set: Some(set),
                from: needed.from.clone(),
                failure: None,
            },
            Err(reason) => {
                if fresh {
                    stats.build_failures += 1;
                }
                match cached {
                    Some(entry) => {
                        warn!(
                            covered = %entry.source_range,
                            "Build failed, older scripts will be reported as errors"
                        );
                        Coverage {
                            set: Some(Arc::new(entry.instructions)),
                            from: entry.source_range.from,
                            failure: Some(reason),
                        }
                    }
                    None => Coverage {
                        set: None,
                        from: needed.to.clone(),
                        failure: Some(reason),
                    },
                }
            }
        }
    }

    /// Build `range` at most once per pipeline and persist the result.
    ///
    /// The flag is true when this caller performed the build.
    async fn build_range(&self, range: &VersionRange) -> (BuildOutcome, bool) {
        let slot = self.registry.slot(range);
        let fresh = AtomicBool::new(false);
        let outcome = slot
            .get_or_init(|| async {
                fresh.store(true, Ordering::SeqCst);
                if self.cancel.is_cancelled() {
                    return Err(BuildError::Cancelled.to_string());
                }
                match build_instructions(self.builder.as_ref(), range).await {
                    Ok(set) => {
                        if let Some(cache) = &self.cache {
                            if let Err(e) =
                                cache.put(&range.to, &self.options.model_id, range.clone(), set.clone())
                            {
                                warn!(error = %e, "Failed to cache instructions");
                            }
                        }
                        Ok(Arc::new(set))
                    }
                    Err(e) => {
                        warn!(range = %range, error = %e, "Instruction build failed");
                        Err(e.to_string())
                    }
                }
            })
            .await
            .clone();
        (outcome, fresh.load(Ordering::SeqCst))
    }

    async fn analyze_all(
        &self,
        scripts: Vec<ScriptRecord>,
        target: &Version,
        coverage: &Coverage,
        progress: &ProgressHub,
    ) -> Vec<AnalysisResult> {
        let total = scripts.len();
        progress.begin(total);

        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent.max(1)));
        let (result_tx, mut result_rx) = mpsc::channel::<(usize, AnalysisResult)>(total.max(1));
        let mut slots: Vec<Option<AnalysisResult>> = vec![None; total];
        let mut paths = Vec::with_capacity(total);
        let mut handles = Vec::new();

        for (idx, script) in scripts.into_iter().enumerate() {
            paths.push(script.path.clone());
            let emitter = emitter_for(progress, &script.path);
            let resolution = script.resolution.clone();
            let version = script.version().cloned().unwrap_or(Version::ZERO);

            if version >= *target {
                debug!(path = %script.path.display(), %version, "Already at target, skipping");
                let mut result = AnalysisResult::from_issues(script.path.clone(), Vec::new());
                result.resolution = resolution;
                result.skipped = true;
                emitter.emit(ProgressPhase::Skipped, 0, 0);
                slots[idx] = Some(result);
                continue;
            }

            let set = match coverage.for_script(&version) {
                Ok(set) => set.within(&VersionRange::new(version, target.clone())),
                Err(reason) => {
                    let mut result = AnalysisResult::failed(
                        script.path.clone(),
                        AnalysisError::InstructionsUnavailable(reason),
                    );
                    result.resolution = resolution;
                    emitter.emit(ProgressPhase::Finished(Verdict::Error), 0, 0);
                    slots[idx] = Some(result);
                    continue;
                }
            };

            let semaphore = Arc::clone(&semaphore);
            let analyzer = Arc::clone(&self.analyzer);
            let cancel = self.cancel.clone();
            let result_tx = result_tx.clone();
            let target = target.clone();
            let timeout = self.options.timeout;

            let handle = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let path = script.path.clone();

                let mut result = if cancel.is_cancelled() {
                    AnalysisResult::failed(path, AnalysisError::Cancelled)
                } else {
                    let total_tokens = estimate_tokens(&script.content);
                    emitter.emit(ProgressPhase::Started, 0, total_tokens);
                    let call = analyzer.analyze(&script, &target, &set, emitter.clone());
                    match tokio::time::timeout(timeout, call).await {
                        Ok(Ok(mut result)) => {
                            result.path = path;
                            result
                        }
                        Ok(Err(e)) => {
                            warn!(path = %path.display(), error = %e, "Analysis failed");
                            AnalysisResult::failed(path, e)
                        }
                        Err(_) => {
                            warn!(path = %path.display(), "Analysis timed out");
                            AnalysisResult::failed(path, AnalysisError::Timeout(timeout.as_secs()))
                        }
                    }
                };
                result.resolution = script.resolution.clone();
                result.skipped = false;
                emitter.emit(ProgressPhase::Finished(result.verdict), 1, 1);
                result_tx.send((idx, result)).await.ok();
            });
            handles.push((idx, handle));
        }
        drop(result_tx);

        while let Some((idx, result)) = result_rx.recv().await {
            slots[idx] = Some(result);
        }

        for (idx, handle) in handles {
            if let Err(e) = handle.await {
                warn!(path = %paths[idx].display(), error = %e, "Analysis task aborted");
                if slots[idx].is_none() {
                    let emitter = emitter_for(progress, &paths[idx]);
                    emitter.emit(ProgressPhase::Finished(Verdict::Error), 0, 0);
                    slots[idx] = Some(AnalysisResult::failed(
                        paths[idx].clone(),
                        AnalysisError::Aborted(e.to_string()),
                    ));
                }
            }
        }

        slots
            .into_iter()
            .zip(paths)
            .map(|(slot, path)| {
                slot.unwrap_or_else(|| {
                    AnalysisResult::failed(path, AnalysisError::Aborted("no result".into()))
                })
            })
            .collect()
    }

    /// Build and store the instructions for `target` regardless of what the
    /// cache holds.
    ///
    /// The range starts at `from`, or at the default version for `target`.
    #[instrument(skip_all, name = "prepopulate", fields(target = %target))]
    pub async fn prepopulate(
        &self,
        target: &Version,
        from: Option<Version>,
    ) -> Result<CacheEntry, VerifierError> {
        let Some(cache) = &self.cache else {
            return Err(ConfigError::Invalid("the instruction cache is disabled".into()).into());
        };
        let from = from.unwrap_or_else(|| self.options.resolver.default_for(target));
        let range = VersionRange::new(from, target.clone());
        if range.is_empty() {
            return Err(ConfigError::Invalid(format!("empty version range {range}")).into());
        }
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled.into());
        }

        let set = build_instructions(self.builder.as_ref(), &range).await?;
        let entry = cache.put(target, &self.options.model_id, range, set)?;
        Ok(entry)
    }
}

/// Emitter named after `path`; a disabled hub never formats the name.
fn emitter_for(progress: &ProgressHub, path: &Path) -> ProgressEmitter {
    if !progress.is_enabled() {
        return ProgressEmitter::disabled();
    }
    progress.emitter(&path.display().to_string())
}
