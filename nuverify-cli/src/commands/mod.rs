pub mod cache;
pub mod check;
pub mod init;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use nuverify_core::analyzer::{LlmScriptAnalyzer, ScriptAnalyzer};
use nuverify_core::builder::{InstructionBuilder, LlmInstructionBuilder};
use nuverify_core::cache::InstructionCache;
use nuverify_core::config::VerifierConfig;
use nuverify_core::llm::LlmProvider;
use nuverify_core::llm::providers::create_provider;
use nuverify_core::pipeline::CancellationToken;
use nuverify_core::source::ChangeLogSource;
use nuverify_core::source::github::GitHubReleaseSource;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check scripts against a Nushell version
    Check(check::CheckArgs),
    /// Inspect or manage the instruction cache
    Cache(cache::CacheArgs),
    /// Write a default config file
    Init(init::InitArgs),
}

/// Options shared by every subcommand.
#[derive(Debug, Clone)]
pub struct GlobalOpts {
    pub config: Option<PathBuf>,
    pub verbose: u8,
    pub quiet: bool,
}

pub async fn run(cmd: Command, global: &GlobalOpts) -> anyhow::Result<()> {
    match cmd {
        Command::Check(args) => check::run(args, global).await,
        Command::Cache(args) => cache::run(args, global).await,
        Command::Init(args) => init::run(&args, global),
    }
}

pub(crate) fn load_config(path: Option<&Path>) -> anyhow::Result<VerifierConfig> {
    VerifierConfig::load(path).context("Cannot load config")
}

pub(crate) fn open_cache(config: &VerifierConfig) -> anyhow::Result<InstructionCache> {
    let dir = config.cache_dir()?;
    Ok(InstructionCache::open(&dir)?)
}

/// The model-backed collaborators a run needs.
pub(crate) struct Collaborators {
    pub source: Arc<dyn ChangeLogSource>,
    pub builder: Arc<dyn InstructionBuilder>,
    pub analyzer: Arc<dyn ScriptAnalyzer>,
}

/// Wire collaborators for one run; `cancel` stops further model calls during builds.
pub(crate) fn collaborators(
    config: &VerifierConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<Collaborators> {
    let llm: Arc<dyn LlmProvider> = Arc::from(create_provider(&config.llm)?);
    let source: Arc<dyn ChangeLogSource> =
        Arc::new(GitHubReleaseSource::from_config(&config.github));
    Ok(Collaborators {
        builder: Arc::new(
            LlmInstructionBuilder::new(Arc::clone(&source), Arc::clone(&llm))
                .with_cancellation(cancel.clone()),
        ),
        analyzer: Arc::new(LlmScriptAnalyzer::new(llm)),
        source,
    })
}
