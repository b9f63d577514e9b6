use std::path::PathBuf;

use crate::version::Version;

/// Top-level nuverify error type.
///
/// All fallible operations in `nuverify-core` return [`Result<T, VerifierError>`](Result).
/// Each variant wraps a domain-specific error enum, allowing callers to
/// match on the error source without losing type information.
///
/// Only [`SetupError`] ever escapes the pipeline as an `Err`; build and
/// analysis failures are captured into per-script results.
#[derive(thiserror::Error, Debug)]
pub enum VerifierError {
    /// Fatal problem with the run's environment (roots, cache storage).
    #[error("Setup error: {0}")]
    Setup(#[from] SetupError),

    /// Error reading or writing the instruction cache.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Error turning change-log text into compatibility instructions.
    #[error("Instruction build error: {0}")]
    Build(#[from] BuildError),

    /// Error analyzing a single script.
    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    /// Error in configuration parsing or validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Error fetching release metadata or change-log text.
    #[error("Change-log source error: {0}")]
    Source(#[from] SourceError),

    /// Error communicating with an LLM provider.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Fatal setup problems. These abort the run before any script is analyzed.
#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    /// None of the configured scan roots exist or can be read.
    #[error("no accessible scan roots: {}", display_paths(.0))]
    NoAccessibleRoots(Vec<PathBuf>),

    /// Scan roots were readable but contained no scripts.
    #[error("no scripts found under: {}", display_paths(.0))]
    NoScripts(Vec<PathBuf>),

    /// The cache directory cannot be created or written to.
    #[error("cache storage unwritable at {path}: {source}")]
    CacheUnwritable {
        /// Cache directory that failed the write probe.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },

    /// The run was cancelled before analysis began.
    #[error("run cancelled")]
    Cancelled,
}

/// Errors from the on-disk instruction cache.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// Filesystem I/O failed for a cache entry.
    #[error("IO error on {path}: {source}")]
    Io {
        /// Entry or directory being accessed.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },

    /// An entry could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors while building an instruction set for a version range.
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    /// The change-log source could not supply text for the range.
    #[error("change log for ({from}, {to}] unavailable: {reason}")]
    ChangeLogUnavailable {
        /// Exclusive lower bound of the range.
        from: Version,
        /// Inclusive upper bound of the range.
        to: Version,
        /// Description of the failure.
        reason: String,
    },

    /// The model call that distills change-log text failed.
    #[error("distillation failed for {version}: {reason}")]
    Distill {
        /// Release whose text was being distilled.
        version: Version,
        /// Description of the failure.
        reason: String,
    },

    /// The run was cancelled while the build was in progress.
    #[error("build cancelled")]
    Cancelled,
}

/// Errors while analyzing one script.
#[derive(thiserror::Error, Debug)]
pub enum AnalysisError {
    /// The model call failed.
    #[error("model call failed: {0}")]
    Model(String),

    /// The analysis did not finish within the configured time.
    #[error("analysis timed out after {0}s")]
    Timeout(u64),

    /// The run was cancelled before this script was analyzed.
    #[error("analysis cancelled before it started")]
    Cancelled,

    /// The analysis task ended without producing a result.
    #[error("analysis task aborted: {0}")]
    Aborted(String),

    /// Instructions needed by this script could not be built.
    #[error("instructions unavailable: {0}")]
    InstructionsUnavailable(String),
}

/// Errors in nuverify configuration parsing and validation.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration file does not exist at the expected path.
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Configuration values are present but semantically invalid.
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Configuration file syntax could not be parsed (TOML error).
    #[error("Parse error: {0}")]
    Parse(String),

    /// A version string could not be parsed.
    #[error("Invalid version: {0:?}")]
    Version(String),
}

/// Errors from the release/change-log source (GitHub).
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    /// Network-level failure talking to the API.
    #[error("GitHub API network error: {0}")]
    Network(String),

    /// The API returned a non-success HTTP status.
    #[error("GitHub API {status}: {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// A response body could not be decoded.
    #[error("GitHub API parse error: {0}")]
    Parse(String),

    /// The repository has no usable releases.
    #[error("no releases found in {0}")]
    NoReleases(String),
}

/// Errors from LLM provider interactions.
#[derive(thiserror::Error, Debug)]
pub enum LlmError {
    /// Network-level failure connecting to the LLM provider.
    #[error("Network error: {0}")]
    Network(String),

    /// LLM API returned a non-success HTTP status.
    #[error("API error (HTTP {status}): {body}")]
    ApiError {
        /// HTTP status code from the provider.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// LLM response could not be parsed into the expected format.
    #[error("Response parse error: {0}")]
    Parse(String),

    /// LLM configuration is missing or invalid (API key, model, etc.).
    #[error("Configuration error: {0}")]
    Config(String),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convenience alias for `Result<T, VerifierError>`.
pub type Result<T> = std::result::Result<T, VerifierError>;
