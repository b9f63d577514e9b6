//! Progress reporting for concurrent script analyses.
//!
//! Each analysis holds a [`ProgressEmitter`] and pushes [`ProgressEvent`]s
//! into one unbounded channel. A single drain task owned by [`ProgressHub`]
//! forwards them to a [`ProgressSink`], so events from one script reach the
//! sink in the order they were emitted while different scripts interleave.
//!
//! The CLI uses [`IndicatifSink`]; automation uses a disabled hub, whose
//! emitters carry no channel and return immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::Verdict;

/// Where one script's analysis is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    /// The boundary call is about to start; `total` is the token estimate.
    Started,
    /// Streamed output arrived; `current` counts tokens received so far.
    Streaming,
    /// Terminal: the script has a result.
    Finished(Verdict),
    /// Terminal: nothing to analyze.
    Skipped,
}

impl ProgressPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished(_) | Self::Skipped)
    }
}

/// One progress update. Transient: never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub script: String,
    pub phase: ProgressPhase,
    pub current: u64,
    pub total: u64,
    pub timestamp: DateTime<Utc>,
}

/// Receives events from the hub's drain task, one at a time.
pub trait ProgressSink: Send + Sync {
    /// A batch of `total` scripts is about to be analyzed.
    fn begin(&self, _total: usize) {}

    fn report(&self, event: &ProgressEvent);

    /// All events have been delivered.
    fn finish(&self) {}
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn report(&self, _event: &ProgressEvent) {}
}

/// Per-analysis handle for publishing progress.
///
/// Cloning is cheap. A disabled emitter holds no channel, so [`emit`](Self::emit)
/// does nothing and allocates nothing.
#[derive(Debug, Clone)]
pub struct ProgressEmitter {
    script: Arc<str>,
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressEmitter {
    pub fn disabled() -> Self {
        Self {
            script: Arc::from(""),
            tx: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    /// Publish an event. Never blocks; a closed hub drops it silently.
    pub fn emit(&self, phase: ProgressPhase, current: u64, total: u64) {
        let Some(tx) = &self.tx else {
            return;
        };
        let _ = tx.send(ProgressEvent {
            script: self.script.to_string(),
            phase,
            current,
            total,
            timestamp: Utc::now(),
        });
    }
}

/// Owns the event channel and the task that drains it into a sink.
#[derive(Debug)]
pub struct ProgressHub {
    sink: Option<Arc<dyn ProgressSink>>,
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
    drain: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for dyn ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProgressSink")
    }
}

impl ProgressHub {
    /// Start draining into `sink`. Must be called inside a Tokio runtime.
    pub fn start(sink: Arc<dyn ProgressSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let drain_sink = Arc::clone(&sink);
        let drain = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                drain_sink.report(&event);
            }
            drain_sink.finish();
        });
        Self {
            sink: Some(sink),
            tx: Some(tx),
            drain: Some(drain),
        }
    }

    /// A hub whose emitters are all no-ops.
    pub fn disabled() -> Self {
        Self {
            sink: None,
            tx: None,
            drain: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn begin(&self, total: usize) {
        if let Some(sink) = &self.sink {
            sink.begin(total);
        }
    }

    pub fn emitter(&self, script: &str) -> ProgressEmitter {
        match &self.tx {
            Some(tx) => ProgressEmitter {
                script: Arc::from(script),
                tx: Some(tx.clone()),
            },
            None => ProgressEmitter::disabled(),
        }
    }

    /// Close the channel and wait until every queued event has been delivered.
    ///
    /// Emitters still alive elsewhere keep the drain running until they drop.
    pub async fn finish(mut self) {
        self.tx.take();
        if let Some(drain) = self.drain.take() {
            let _ = drain.await;
        }
    }
}

/// Rough token count for a script's analysis response, used as the bar length.
pub fn estimate_tokens(content: &str) -> u64 {
    let len = content.len() as u64;
    (len / 4 + 800 + (len / 8).min(500)).clamp(500, 3000)
}

// ── Terminal display ───────────────────────────────────────────────

/// `indicatif` display: one bar per in-flight script plus a batch bar.
pub struct IndicatifSink {
    multi: MultiProgress,
    batch: ProgressBar,
    bars: Mutex<HashMap<String, ProgressBar>>,
    verbose: bool,
}

impl std::fmt::Debug for IndicatifSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatifSink")
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

impl IndicatifSink {
    pub fn new(verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let batch = multi.add(ProgressBar::new(0));
        batch.set_style(
            ProgressStyle::with_template(
                "{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len} {msg} ({elapsed})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
        );
        batch.set_prefix("Scripts");
        Self {
            multi,
            batch,
            bars: Mutex::new(HashMap::new()),
            verbose,
        }
    }

    fn script_style() -> ProgressStyle {
        ProgressStyle::with_template("  {spinner:.green} {prefix:<28} [{bar:20}] ~{pos}/{len} tok")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ")
    }

    fn print_line(&self, line: &str) {
        if self.multi.println(line).is_err() {
            eprintln!("{line}");
        }
    }

    fn short_name(script: &str) -> &str {
        script.rsplit(['/', '\\']).next().unwrap_or(script)
    }
}

impl ProgressSink for IndicatifSink {
    fn begin(&self, total: usize) {
        self.batch.set_length(total as u64);
        self.batch.set_message("analyzing");
    }

    fn report(&self, event: &ProgressEvent) {
        let mut bars = self
            .bars
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        match event.phase {
            ProgressPhase::Started => {
                let bar = self.multi.add(ProgressBar::new(event.total));
                bar.set_style(Self::script_style());
                bar.set_prefix(Self::short_name(&event.script).to_string());
                bar.enable_steady_tick(std::time::Duration::from_millis(120));
                bars.insert(event.script.clone(), bar);
            }
            ProgressPhase::Streaming => {
                if let Some(bar) = bars.get(&event.script) {
                    // Estimates run short; hold the bar just below full until done.
                    bar.set_position(event.current.min(event.total.saturating_sub(1)));
                }
            }
            ProgressPhase::Finished(verdict) => {
                if let Some(bar) = bars.remove(&event.script) {
                    bar.finish_and_clear();
                    self.multi.remove(&bar);
                }
                self.batch.inc(1);
                if self.verbose || verdict != Verdict::Compatible {
                    let mark = match verdict {
                        Verdict::Compatible => "ok",
                        Verdict::Incompatible => "!!",
                        Verdict::Error => "??",
                    };
                    self.print_line(&format!("  {mark} {} ({})", event.script, verdict.as_str()));
                }
            }
            ProgressPhase::Skipped => {
                self.batch.inc(1);
                if self.verbose {
                    self.print_line(&format!("  -- {} (already at target)", event.script));
                }
            }
        }
    }

    fn finish(&self) {
        let bars = self
            .bars
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for bar in bars.values() {
            bar.finish_and_clear();
        }
        self.batch.finish_and_clear();
    }
}
