use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nuverify_core::cache::{CacheScope, InstructionCache};
use nuverify_core::error::SetupError;
use nuverify_core::pipeline::CancellationToken;
use nuverify_core::progress::{ProgressHub, ProgressPhase};
use nuverify_core::types::{
    AnalysisResult, BatchReport, CompatibilityInstruction, InstructionSet, RunState, Verdict,
    VersionSource,
};
use nuverify_core::version::VersionRange;
use nuverify_test::{
    RecordingSink, ScriptTree, ScriptedAnalyzer, ScriptedBuilder, options, pipeline, v,
};

fn result_for<'a>(report: &'a BatchReport, name: &str) -> &'a AnalysisResult {
    report
        .results
        .iter()
        .find(|r| r.path.file_name().is_some_and(|n| n == name))
        .unwrap_or_else(|| panic!("no result for {name}"))
}

fn names(report: &BatchReport) -> Vec<String> {
    report
        .results
        .iter()
        .map(|r| r.path.file_name().unwrap().to_string_lossy().to_string())
        .collect()
}

fn instruction(version: &str) -> CompatibilityInstruction {
    CompatibilityInstruction {
        description: format!("change in {version}"),
        introduced_in: v(version),
        detection: None,
        remediation: None,
    }
}

fn open_cache(dir: &Path) -> Arc<InstructionCache> {
    Arc::new(InstructionCache::open(dir).unwrap())
}

// ── Cache ────────────────────────────────────────────────────────

#[test]
fn cache_lookup_ignores_model() {
    let dir = tempfile::tempdir().unwrap();
    let cache = InstructionCache::open(dir.path()).unwrap();
    let set = InstructionSet::new(vec![instruction("0.99.0"), instruction("0.100.0")]);

    cache
        .put(
            &v("0.100.0"),
            "openai/gpt-4",
            VersionRange::new(v("0.94.0"), v("0.100.0")),
            set.clone(),
        )
        .unwrap();

    let entry = cache.get(&v("0.100.0"), "anthropic/claude-sonnet").unwrap();
    assert_eq!(entry.instructions, set);
    assert_eq!(entry.model_id, "openai/gpt-4");
    assert!(cache.get(&v("0.99.0"), "openai/gpt-4").is_none());
}

#[test]
fn invalidate_all_empties_listing() {
    let dir = tempfile::tempdir().unwrap();
    let cache = InstructionCache::open(dir.path()).unwrap();
    for version in ["0.98.0", "0.99.0", "0.100.0"] {
        cache
            .put(
                &v(version),
                "m",
                VersionRange::new(v("0.90.0"), v(version)),
                InstructionSet::default(),
            )
            .unwrap();
    }
    assert_eq!(cache.list().len(), 3);

    assert_eq!(cache.invalidate(&CacheScope::All).unwrap(), 3);
    assert!(cache.list().is_empty());
    assert_eq!(cache.invalidate(&CacheScope::All).unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_puts_leave_one_readable_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path());

    let mut handles = Vec::new();
    for i in 0..8 {
        let cache = Arc::clone(&cache);
        handles.push(tokio::task::spawn_blocking(move || {
            let set = InstructionSet::new(vec![instruction("0.100.0"); i + 1]);
            cache
                .put(
                    &v("0.100.0"),
                    &format!("model-{i}"),
                    VersionRange::new(v("0.94.0"), v("0.100.0")),
                    set,
                )
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let entry = cache.get(&v("0.100.0"), "any").unwrap();
    let i: usize = entry.model_id.trim_start_matches("model-").parse().unwrap();
    assert_eq!(entry.instructions.len(), i + 1);
    assert_eq!(cache.list().len(), 1);
}

// ── Resolution ───────────────────────────────────────────────────

#[tokio::test]
async fn resolution_tiers_are_applied() {
    let tree = ScriptTree::new();
    tree.script_at("header.nu", "0.95.0");
    tree.mark_dir("lib", "0.97.0");
    tree.plain_script("lib/helpers.nu");
    tree.mark_dir("lib/deep", "0.98.0");
    tree.plain_script("lib/deep/nested.nu");
    tree.plain_script("plain.nu");
    tree.write("broken.nu", "# nushell-compatible-with: soon\nls\n");

    let builder = Arc::new(ScriptedBuilder::new());
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let pipeline = pipeline(&builder, &analyzer, None, options("m", 2));

    let report = pipeline
        .run(&tree.roots(), &v("0.100.0"), &ProgressHub::disabled())
        .await
        .unwrap();

    let check = |name: &str, version: &str, source: VersionSource| {
        let resolution = result_for(&report, name).resolution.clone().unwrap();
        assert_eq!(resolution.version, v(version), "{name}");
        assert_eq!(resolution.source, source, "{name}");
    };
    check("header.nu", "0.95.0", VersionSource::Header);
    check("helpers.nu", "0.97.0", VersionSource::Directory);
    check("nested.nu", "0.98.0", VersionSource::Directory);
    check("plain.nu", "0.94.0", VersionSource::Default);
    check("broken.nu", "0.94.0", VersionSource::Default);
}

#[tokio::test]
async fn scripts_at_target_are_skipped_without_analysis() {
    let tree = ScriptTree::new();
    tree.script_at("current.nu", "0.100.0");
    tree.script_at("ahead.nu", "0.101.0");

    let builder = Arc::new(ScriptedBuilder::new());
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let pipeline = pipeline(&builder, &analyzer, None, options("m", 2));

    let report = pipeline
        .run(&tree.roots(), &v("0.100.0"), &ProgressHub::disabled())
        .await
        .unwrap();

    assert_eq!(report.results.len(), 2);
    assert!(report.results.iter().all(|r| r.skipped));
    assert_eq!(report.count(Verdict::Compatible), 2);
    assert_eq!(analyzer.call_count(), 0);
    assert_eq!(builder.fetch_count(), 0);
}

// ── Build coalescing ─────────────────────────────────────────────

#[tokio::test]
async fn ten_scripts_share_one_build() {
    let tree = ScriptTree::new();
    for i in 0..10 {
        tree.plain_script(&format!("script_{i:02}.nu"));
    }
    let cache_dir = tempfile::tempdir().unwrap();

    let builder = Arc::new(ScriptedBuilder::new().with_delay(Duration::from_millis(20)));
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let pipeline = pipeline(
        &builder,
        &analyzer,
        Some(open_cache(cache_dir.path())),
        options("m", 4),
    );

    let report = pipeline
        .run(&tree.roots(), &v("0.100.0"), &ProgressHub::disabled())
        .await
        .unwrap();

    assert_eq!(builder.fetch_count(), 1);
    assert_eq!(report.cache.builds, 1);
    assert_eq!(report.cache.misses, 1);
    assert_eq!(report.results.len(), 10);
    assert_eq!(analyzer.call_count(), 10);
    // Default distance 6: (0.94.0, 0.100.0] holds six releases.
    assert_eq!(analyzer.instructions_seen("script_00.nu"), Some(6));
}

#[tokio::test]
async fn mixed_versions_build_once_from_earliest() {
    let tree = ScriptTree::new();
    tree.script_at("old.nu", "0.96.0");
    tree.script_at("newer.nu", "0.99.0");

    let builder = Arc::new(ScriptedBuilder::new());
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let pipeline = pipeline(&builder, &analyzer, None, options("m", 2));

    pipeline
        .run(&tree.roots(), &v("0.100.0"), &ProgressHub::disabled())
        .await
        .unwrap();

    assert_eq!(builder.fetch_count(), 1);
    assert_eq!(analyzer.instructions_seen("old.nu"), Some(4));
    assert_eq!(analyzer.instructions_seen("newer.nu"), Some(1));
}

// ── Failure isolation ────────────────────────────────────────────

#[tokio::test]
async fn one_failing_script_does_not_sink_the_batch() {
    let tree = ScriptTree::new();
    for name in ["a.nu", "b.nu", "c.nu", "d.nu", "e.nu"] {
        tree.plain_script(name);
    }

    let builder = Arc::new(ScriptedBuilder::new());
    let analyzer = Arc::new(ScriptedAnalyzer {
        fail_on: vec!["c.nu".into()],
        flag: vec!["e.nu".into()],
        ..ScriptedAnalyzer::default()
    });
    let pipeline = pipeline(&builder, &analyzer, None, options("m", 3));

    let report = pipeline
        .run(&tree.roots(), &v("0.100.0"), &ProgressHub::disabled())
        .await
        .unwrap();

    assert_eq!(names(&report), vec!["a.nu", "b.nu", "c.nu", "d.nu", "e.nu"]);
    assert_eq!(report.count(Verdict::Error), 1);
    assert_eq!(report.count(Verdict::Compatible), 3);
    assert_eq!(report.count(Verdict::Incompatible), 1);

    let failed = result_for(&report, "c.nu");
    assert_eq!(failed.verdict, Verdict::Error);
    assert!(failed.issues[0].message.contains("model refused c.nu"));
    assert!(failed.resolution.is_some());
}

#[tokio::test]
async fn build_failure_without_cache_reports_errors() {
    let tree = ScriptTree::new();
    tree.plain_script("a.nu");
    tree.script_at("done.nu", "0.100.0");

    let builder = Arc::new(ScriptedBuilder::failing());
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let pipeline = pipeline(&builder, &analyzer, None, options("m", 2));

    let report = pipeline
        .run(&tree.roots(), &v("0.100.0"), &ProgressHub::disabled())
        .await
        .unwrap();

    let a = result_for(&report, "a.nu");
    assert_eq!(a.verdict, Verdict::Error);
    assert!(a.issues[0].message.contains("release feed offline"));
    assert!(result_for(&report, "done.nu").skipped);
    assert_eq!(analyzer.call_count(), 0);
    assert_eq!(report.cache.build_failures, 1);
    assert_eq!(report.states.last(), Some(&RunState::Done));
}

// ── Cache reuse ──────────────────────────────────────────────────

#[tokio::test]
async fn second_run_with_other_model_reuses_cache() {
    let tree = ScriptTree::new();
    tree.plain_script("a.nu");
    tree.plain_script("b.nu");
    let cache_dir = tempfile::tempdir().unwrap();

    let first_builder = Arc::new(ScriptedBuilder::new());
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let first = pipeline(
        &first_builder,
        &analyzer,
        Some(open_cache(cache_dir.path())),
        options("openai/gpt-4", 2),
    );
    let report = first
        .run(&tree.roots(), &v("0.100.0"), &ProgressHub::disabled())
        .await
        .unwrap();
    assert_eq!(report.cache.builds, 1);
    assert_eq!(first_builder.fetch_count(), 1);

    let second_builder = Arc::new(ScriptedBuilder::new());
    let second = pipeline(
        &second_builder,
        &analyzer,
        Some(open_cache(cache_dir.path())),
        options("anthropic/claude-sonnet", 2),
    );
    let report = second
        .run(&tree.roots(), &v("0.100.0"), &ProgressHub::disabled())
        .await
        .unwrap();

    assert_eq!(second_builder.fetch_count(), 0);
    assert_eq!(report.cache.hits, 1);
    assert_eq!(report.cache.builds, 0);
    assert_eq!(report.count(Verdict::Compatible), 2);
}

#[tokio::test]
async fn partial_coverage_falls_back_to_cached_set() {
    let tree = ScriptTree::new();
    tree.script_at("recent.nu", "0.98.0");
    tree.script_at("ancient.nu", "0.90.0");
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = open_cache(cache_dir.path());
    cache
        .put(
            &v("0.100.0"),
            "m",
            VersionRange::new(v("0.97.0"), v("0.100.0")),
            InstructionSet::new(vec![
                instruction("0.98.0"),
                instruction("0.99.0"),
                instruction("0.100.0"),
            ]),
        )
        .unwrap();

    let builder = Arc::new(ScriptedBuilder::failing());
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let pipeline = pipeline(&builder, &analyzer, Some(cache), options("m", 2));

    let report = pipeline
        .run(&tree.roots(), &v("0.100.0"), &ProgressHub::disabled())
        .await
        .unwrap();

    assert_eq!(builder.fetch_count(), 1);
    assert_eq!(report.cache.misses, 1);
    assert_eq!(report.cache.build_failures, 1);

    assert_eq!(result_for(&report, "recent.nu").verdict, Verdict::Compatible);
    assert_eq!(analyzer.instructions_seen("recent.nu"), Some(2));
    assert_eq!(result_for(&report, "ancient.nu").verdict, Verdict::Error);
    assert_eq!(analyzer.instructions_seen("ancient.nu"), None);
}

// ── Cancellation ─────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_before_start_is_a_setup_error() {
    let tree = ScriptTree::new();
    tree.plain_script("a.nu");

    let token = CancellationToken::new();
    token.cancel();
    let builder = Arc::new(ScriptedBuilder::new());
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let pipeline =
        pipeline(&builder, &analyzer, None, options("m", 1)).with_cancellation(token);

    let err = pipeline
        .run(&tree.roots(), &v("0.100.0"), &ProgressHub::disabled())
        .await
        .unwrap_err();

    assert!(matches!(err, SetupError::Cancelled));
    assert_eq!(builder.fetch_count(), 0);
    assert_eq!(analyzer.call_count(), 0);
}

#[tokio::test]
async fn cancellation_mid_run_stops_new_analyses() {
    let tree = ScriptTree::new();
    for name in ["a.nu", "b.nu", "c.nu", "d.nu"] {
        tree.plain_script(name);
    }

    let token = CancellationToken::new();
    let builder = Arc::new(ScriptedBuilder::new());
    let analyzer = Arc::new(ScriptedAnalyzer {
        cancel_after: Some((1, token.clone())),
        delay: Duration::from_millis(10),
        ..ScriptedAnalyzer::default()
    });
    let pipeline =
        pipeline(&builder, &analyzer, None, options("m", 1)).with_cancellation(token);

    let report = pipeline
        .run(&tree.roots(), &v("0.100.0"), &ProgressHub::disabled())
        .await
        .unwrap();

    assert_eq!(analyzer.call_count(), 1);
    assert_eq!(report.results.len(), 4);
    assert_eq!(report.count(Verdict::Compatible), 1);
    assert_eq!(report.count(Verdict::Error), 3);
    assert!(
        report
            .errored()
            .all(|r| r.issues[0].message.contains("cancelled"))
    );
}

// ── Progress and concurrency ─────────────────────────────────────

#[tokio::test]
async fn progress_events_are_ordered_per_script() {
    let tree = ScriptTree::new();
    let analyzed: Vec<_> = ["a.nu", "b.nu", "c.nu"]
        .iter()
        .map(|n| tree.plain_script(n))
        .collect();
    let skipped = tree.script_at("current.nu", "0.100.0");

    let sink = Arc::new(RecordingSink::default());
    let hub = ProgressHub::start(sink.clone());
    let builder = Arc::new(ScriptedBuilder::new());
    let analyzer = Arc::new(ScriptedAnalyzer {
        stream_chunks: 3,
        ..ScriptedAnalyzer::default()
    });
    let pipeline = pipeline(&builder, &analyzer, None, options("m", 2));

    pipeline
        .run(&tree.roots(), &v("0.100.0"), &hub)
        .await
        .unwrap();
    hub.finish().await;

    assert_eq!(*sink.batches.lock().unwrap(), vec![4]);
    for path in &analyzed {
        let phases = sink.for_script(path);
        assert_eq!(phases.len(), 5, "{}: {phases:?}", path.display());
        assert_eq!(phases[0], ProgressPhase::Started);
        assert!(phases[1..4].iter().all(|p| *p == ProgressPhase::Streaming));
        assert_eq!(phases[4], ProgressPhase::Finished(Verdict::Compatible));
    }
    assert_eq!(sink.for_script(&skipped), vec![ProgressPhase::Skipped]);
}

#[tokio::test]
async fn concurrency_stays_within_limit() {
    let tree = ScriptTree::new();
    for i in 0..8 {
        tree.plain_script(&format!("s{i}.nu"));
    }

    let builder = Arc::new(ScriptedBuilder::new());
    let analyzer = Arc::new(ScriptedAnalyzer {
        delay: Duration::from_millis(15),
        ..ScriptedAnalyzer::default()
    });
    let pipeline = pipeline(&builder, &analyzer, None, options("m", 2));

    let report = pipeline
        .run(&tree.roots(), &v("0.100.0"), &ProgressHub::disabled())
        .await
        .unwrap();

    assert_eq!(report.results.len(), 8);
    assert!(analyzer.peak_concurrency() <= 2);
    assert!(analyzer.peak_concurrency() >= 1);
}

// ── Setup failures and lifecycle ─────────────────────────────────

#[tokio::test]
async fn setup_failures_abort_the_run() {
    let builder = Arc::new(ScriptedBuilder::new());
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let pipeline = pipeline(&builder, &analyzer, None, options("m", 1));

    let missing = tempfile::tempdir().unwrap().path().join("gone");
    let err = pipeline
        .run(&[missing], &v("0.100.0"), &ProgressHub::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, SetupError::NoAccessibleRoots(_)));

    let empty = ScriptTree::new();
    empty.write("notes.txt", "not a script\n");
    let err = pipeline
        .run(&empty.roots(), &v("0.100.0"), &ProgressHub::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, SetupError::NoScripts(_)));
}

#[tokio::test]
async fn successful_run_walks_every_state() {
    let tree = ScriptTree::new();
    tree.plain_script("a.nu");

    let builder = Arc::new(ScriptedBuilder::new());
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let pipeline = pipeline(&builder, &analyzer, None, options("m", 1));

    let report = pipeline
        .run(&tree.roots(), &v("0.100.0"), &ProgressHub::disabled())
        .await
        .unwrap();

    assert_eq!(
        report.states,
        vec![
            RunState::Scanning,
            RunState::ResolvingVersions,
            RunState::EnsuringInstructions,
            RunState::Analyzing,
            RunState::Reporting,
            RunState::Done,
        ]
    );
}

#[tokio::test]
async fn prepopulate_writes_entry_for_later_runs() {
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = open_cache(cache_dir.path());
    let builder = Arc::new(ScriptedBuilder::new());
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let warm = pipeline(&builder, &analyzer, Some(Arc::clone(&cache)), options("m", 1));

    let entry = warm.prepopulate(&v("0.100.0"), Some(v("0.90.0"))).await.unwrap();
    assert_eq!(entry.source_range, VersionRange::new(v("0.90.0"), v("0.100.0")));
    assert_eq!(entry.instructions.len(), 10);
    assert_eq!(cache.list().len(), 1);

    let no_cache = pipeline(&builder, &analyzer, None, options("m", 1));
    assert!(no_cache.prepopulate(&v("0.100.0"), None).await.is_err());
}
