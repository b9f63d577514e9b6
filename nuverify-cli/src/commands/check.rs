use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use nuverify_core::marker::stamp_header;
use nuverify_core::pipeline::{CancellationToken, Pipeline, PipelineOptions};
use nuverify_core::progress::{IndicatifSink, ProgressHub};
use nuverify_core::render::{render_json, render_text};
use nuverify_core::types::{BatchReport, VersionSource};
use nuverify_core::version::Version;
use tracing::{info, warn};

use super::{GlobalOpts, collaborators, load_config, open_cache};

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Target Nushell version (default: latest release)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Directories to scan (repeatable; overrides scan.directories)
    #[arg(short = 'd', long = "dir")]
    pub dirs: Vec<PathBuf>,

    /// Neither read nor write the instruction cache
    #[arg(long)]
    pub no_cache: bool,

    /// Disable progress bars
    #[arg(long)]
    pub no_progress: bool,

    /// Maximum concurrent script analyses
    #[arg(long)]
    pub concurrency: Option<u32>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Exit with code 10 when any script is incompatible
    #[arg(long)]
    pub strict: bool,

    /// Record the target version in compatible scripts' headers
    #[arg(long)]
    pub stamp: bool,
}

/// Raised after reporting when `--strict` is set and scripts need changes.
#[derive(Debug, thiserror::Error)]
#[error("{0} script(s) are incompatible with the target version")]
pub struct IncompatibilitiesFound(pub usize);

pub async fn run(args: CheckArgs, global: &GlobalOpts) -> anyhow::Result<()> {
    let mut config = load_config(global.config.as_deref())?;
    if let Some(n) = args.concurrency {
        config.analysis.max_concurrent = n;
    }
    if args.no_cache {
        config.cache.enabled = false;
    }
    config.validate().context("Invalid config")?;

    let roots = if args.dirs.is_empty() {
        config.scan_roots()
    } else {
        args.dirs.clone()
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing in-flight analyses");
                cancel.cancel();
            }
        });
    }

    let parts = collaborators(&config, &cancel)?;
    let target = match &args.target {
        Some(raw) => Version::parse(raw)?,
        None => {
            let latest = parts
                .source
                .latest_version()
                .await
                .context("Cannot determine the latest Nushell release")?;
            info!(%latest, "Using latest release as target");
            latest
        }
    };

    let cache = if config.cache.enabled {
        Some(Arc::new(open_cache(&config)?))
    } else {
        None
    };

    let pipeline = Pipeline::new(
        parts.builder,
        parts.analyzer,
        cache.clone(),
        PipelineOptions::from_config(&config)?,
    )
    .with_cancellation(cancel);

    let show_progress = !(args.no_progress || args.json || global.quiet);
    let hub = if show_progress {
        ProgressHub::start(Arc::new(IndicatifSink::new(global.verbose > 0)))
    } else {
        ProgressHub::disabled()
    };

    let outcome = pipeline.run(&roots, &target, &hub).await;
    hub.finish().await;
    drop(pipeline);
    if let Some(cache) = cache.and_then(|c| Arc::try_unwrap(c).ok()) {
        cache.close();
    }
    let report = outcome.context("Cannot start the compatibility run")?;

    if args.json {
        println!("{}", render_json(&report)?);
    } else if !global.quiet {
        print!("{}", render_text(&report, global.verbose > 0));
    }

    if args.stamp {
        let stamped = stamp_compatible(&report);
        if !args.json && !global.quiet {
            println!("Stamped {stamped} script(s) with {}", report.target);
        }
    }

    let incompatible = report.incompatible().count();
    if incompatible > 0 && (args.strict || config.analysis.fail_on_issues) {
        return Err(IncompatibilitiesFound(incompatible).into());
    }
    Ok(())
}

/// Rewrite the inline marker of every analyzed compatible script whose version
/// did not come from a directory marker. Returns the number of files changed.
fn stamp_compatible(report: &BatchReport) -> usize {
    let version = report.target.to_string();
    let mut stamped = 0;
    for result in report.compatible().filter(|r| !r.skipped) {
        if result
            .resolution
            .as_ref()
            .is_some_and(|r| r.source == VersionSource::Directory)
        {
            continue;
        }
        let content = match std::fs::read_to_string(&result.path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %result.path.display(), error = %e, "Cannot read script for stamping");
                continue;
            }
        };
        let updated = stamp_header(&content, &version);
        if updated == content {
            continue;
        }
        match std::fs::write(&result.path, updated) {
            Ok(()) => stamped += 1,
            Err(e) => warn!(path = %result.path.display(), error = %e, "Cannot stamp script"),
        }
    }
    stamped
}

#[cfg(test)]
mod tests {
    use super::*;
    use nuverify_core::types::{AnalysisResult, CacheStats, Resolution};
    use std::time::Duration;

    fn result(path: PathBuf, source: VersionSource, skipped: bool) -> AnalysisResult {
        let mut r = AnalysisResult::from_issues(path, vec![]);
        r.resolution = Some(Resolution {
            version: Version::new(0, 94, 0),
            source,
        });
        r.skipped = skipped;
        r
    }

    #[test]
    fn stamps_only_eligible_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let header = dir.path().join("header.nu");
        let default = dir.path().join("default.nu");
        let directory = dir.path().join("directory.nu");
        let skipped = dir.path().join("skipped.nu");
        std::fs::write(&header, "# nushell-compatible-with: 0.94.0\nls\n").unwrap();
        std::fs::write(&default, "#!/usr/bin/env nu\nls\n").unwrap();
        std::fs::write(&directory, "ls\n").unwrap();
        std::fs::write(&skipped, "ls\n").unwrap();

        let report = BatchReport {
            target: Version::new(0, 100, 0),
            results: vec![
                result(header.clone(), VersionSource::Header, false),
                result(default.clone(), VersionSource::Default, false),
                result(directory.clone(), VersionSource::Directory, false),
                result(skipped.clone(), VersionSource::Default, true),
            ],
            cache: CacheStats::default(),
            states: vec![],
            duration: Duration::ZERO,
        };

        assert_eq!(stamp_compatible(&report), 2);
        assert_eq!(
            std::fs::read_to_string(&header).unwrap(),
            "# nushell-compatible-with: 0.100.0\nls\n"
        );
        assert!(std::fs::read_to_string(&default)
            .unwrap()
            .contains("# nushell-compatible-with: 0.100.0"));
        assert_eq!(std::fs::read_to_string(&directory).unwrap(), "ls\n");
        assert_eq!(std::fs::read_to_string(&skipped).unwrap(), "ls\n");
    }
}
