use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Subcommand};
use nuverify_core::cache::CacheScope;
use nuverify_core::pipeline::{CancellationToken, Pipeline, PipelineOptions};
use nuverify_core::render::{render_cache_info, render_cache_listing};
use nuverify_core::version::Version;

use super::{GlobalOpts, collaborators, load_config, open_cache};

#[derive(Args, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub action: CacheAction,
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cached instruction sets, oldest version first
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show cache location and size
    Info,
    /// Remove cached instruction sets (all when no version is given)
    Clear {
        /// Versions to remove
        versions: Vec<String>,
    },
    /// Build and cache instructions for a version ahead of a run
    Warm {
        /// Target version
        version: String,

        /// Oldest script version to cover (default: target minus the default distance)
        #[arg(long)]
        from: Option<String>,
    },
}

pub async fn run(args: CacheArgs, global: &GlobalOpts) -> anyhow::Result<()> {
    let config = load_config(global.config.as_deref())?;

    match args.action {
        CacheAction::List { json } => {
            let cache = open_cache(&config)?;
            let rows = cache.list();
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print!("{}", render_cache_listing(&rows));
            }
            cache.close();
        }
        CacheAction::Info => {
            let cache = open_cache(&config)?;
            let info = cache.info();
            print!("{}", render_cache_info(&info));
            cache.close();
        }
        CacheAction::Clear { versions } => {
            let cache = open_cache(&config)?;
            let scope = if versions.is_empty() {
                CacheScope::All
            } else {
                CacheScope::Versions(
                    versions
                        .iter()
                        .map(|v| Version::parse(v))
                        .collect::<Result<Vec<_>, _>>()?,
                )
            };
            let removed = cache.invalidate(&scope).context("Cannot clear cache")?;
            if !global.quiet {
                println!("Removed {removed} cache entr{}", if removed == 1 { "y" } else { "ies" });
            }
            cache.close();
        }
        CacheAction::Warm { version, from } => {
            let target = Version::parse(&version)?;
            let from = from.as_deref().map(Version::parse).transpose()?;
            let cache = Arc::new(open_cache(&config)?);
            let cancel = CancellationToken::new();
            let parts = collaborators(&config, &cancel)?;
            let pipeline = Pipeline::new(
                parts.builder,
                parts.analyzer,
                Some(Arc::clone(&cache)),
                PipelineOptions::from_config(&config)?,
            )
            .with_cancellation(cancel);

            let entry = pipeline
                .prepopulate(&target, from)
                .await
                .with_context(|| format!("Cannot build instructions for {target}"))?;
            if !global.quiet {
                println!(
                    "Cached {} instruction(s) for {} covering {}",
                    entry.instructions.len(),
                    entry.version,
                    entry.source_range
                );
            }
            drop(pipeline);
            if let Ok(cache) = Arc::try_unwrap(cache) {
                cache.close();
            }
        }
    }
    Ok(())
}
