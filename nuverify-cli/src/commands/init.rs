use anyhow::Context;
use clap::Args;
use nuverify_core::config::{DEFAULT_CONFIG_TOML, default_config_path};

use super::GlobalOpts;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config file
    #[arg(long)]
    pub force: bool,
}

pub fn run(args: &InitArgs, global: &GlobalOpts) -> anyhow::Result<()> {
    let path = match &global.config {
        Some(p) => p.clone(),
        None => default_config_path()?,
    };

    if path.exists() && !args.force {
        if !global.quiet {
            println!("Config already exists at {} (use --force to overwrite)", path.display());
        }
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create config directory {}", parent.display()))?;
    }
    std::fs::write(&path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("Cannot write config file {}", path.display()))?;

    if !global.quiet {
        println!("Wrote {}", path.display());
    }
    Ok(())
}
