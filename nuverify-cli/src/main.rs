use std::path::PathBuf;

use clap::Parser;
use nuverify_core::error::VerifierError;

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "nuverify",
    version,
    about = "Check Nushell scripts for compatibility with a newer Nushell release"
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    /// Config file (default: ~/.config/nuverify/config.toml)
    #[arg(short, long, global = true, env = "NUVERIFY_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

/// Map an error to the process exit code.
///
///   0  success
///   1  general/unknown error
///   2  configuration error
///   3  setup error (no scan roots, no scripts, unwritable cache)
///   5  GitHub API error
///   6  LLM API error
///   10 incompatibilities found with `--strict`
fn classify_exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause
            .downcast_ref::<commands::check::IncompatibilitiesFound>()
            .is_some()
        {
            return 10;
        }
        if cause
            .downcast_ref::<nuverify_core::error::SetupError>()
            .is_some()
        {
            return 3;
        }
        if cause
            .downcast_ref::<nuverify_core::error::ConfigError>()
            .is_some()
        {
            return 2;
        }
        if let Some(e) = cause.downcast_ref::<VerifierError>() {
            return match e {
                VerifierError::Setup(_) => 3,
                VerifierError::Config(_) => 2,
                VerifierError::Source(_) => 5,
                VerifierError::Llm(_) => 6,
                VerifierError::Build(_) | VerifierError::Analysis(_) | VerifierError::Cache(_) => {
                    classify_message(&format!("{err:#}"))
                }
            };
        }
    }
    classify_message(&format!("{err:#}"))
}

fn classify_message(msg: &str) -> i32 {
    let lower = msg.to_lowercase();

    if lower.contains("no scripts found") || lower.contains("no accessible scan roots") {
        3
    } else if lower.contains("config") {
        2
    } else if lower.contains("github api") || lower.contains("rate limit") {
        5
    } else if lower.contains("llm") || lower.contains("api key") || lower.contains("model call") {
        6
    } else {
        1
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (_, 0) => "warn",
        (_, 1) => "info",
        (_, 2) => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    nuverify_core::install_crypto_provider();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: Failed to create runtime: {e}");
            std::process::exit(1);
        }
    };

    let global = commands::GlobalOpts {
        config: cli.config,
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    match runtime.block_on(commands::run(cli.command, &global)) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(classify_exit_code(&e));
        }
    }
}
