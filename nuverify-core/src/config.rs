use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::version::Version;

const APP_DIR: &str = "nuverify";

/// Top-level nuverify configuration, matching `~/.config/nuverify/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifierConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub scan: ScanSection,
    #[serde(default)]
    pub analysis: AnalysisSection,
    #[serde(default)]
    pub cache: CacheSection,
}

impl VerifierConfig {
    /// Load from an explicit path, or the XDG location when `path` is `None`.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (default_config_path()?, false),
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigError::NotFound(path.display().to_string()));
            }
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.analysis.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "analysis.max_concurrent must be at least 1".into(),
            ));
        }
        if self.analysis.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "analysis.timeout_secs must be at least 1".into(),
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Invalid("llm.model must not be empty".into()));
        }
        Version::parse(&self.analysis.floor_version)?;
        Ok(())
    }

    /// Parsed `analysis.floor_version`.
    pub fn floor_version(&self) -> Result<Version, ConfigError> {
        Version::parse(&self.analysis.floor_version)
    }

    /// Scan roots with `~` expanded.
    pub fn scan_roots(&self) -> Vec<PathBuf> {
        self.scan.directories.iter().map(|d| expand_tilde(d)).collect()
    }

    /// Cache directory: explicit setting, else the XDG cache location.
    pub fn cache_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.cache.directory {
            Some(dir) => Ok(expand_tilde(dir)),
            None => default_cache_dir(),
        }
    }

    /// Model identity recorded in cache entries, e.g. `openai/gpt-4`.
    pub fn model_id(&self) -> String {
        format!("{}/{}", self.llm.provider, self.llm.model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// `openai`, `anthropic`, or `custom` (OpenAI-compatible endpoint).
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4".to_string(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            temperature: 0.1,
            max_tokens: 32_000,
        }
    }
}

impl LlmSection {
    /// Explicit key, else the configured environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubSection {
    pub token: Option<String>,
    pub token_env: String,
    /// Fall back to `gh auth token` when no token is configured.
    pub use_gh_cli: bool,
    pub release_repo: String,
    pub blog_repo: String,
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            token: None,
            token_env: "GITHUB_TOKEN".to_string(),
            use_gh_cli: true,
            release_repo: "nushell/nushell".to_string(),
            blog_repo: "nushell/nushell.github.io".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSection {
    pub directories: Vec<String>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    /// Also accept extensionless files with a `nu` shebang.
    pub detect_shebang: bool,
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            directories: vec!["~/dots/bin".into(), "~/dots/config/nushell".into()],
            include_patterns: vec!["**/*.nu".into()],
            exclude_patterns: vec!["**/.git/**".into(), "**/node_modules/**".into()],
            detect_shebang: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSection {
    pub max_concurrent: u32,
    /// Minor versions subtracted from the target for scripts without markers.
    pub default_distance: u64,
    pub floor_version: String,
    pub timeout_secs: u64,
    /// Exit non-zero when any script is incompatible.
    pub fail_on_issues: bool,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            default_distance: 6,
            floor_version: "0.0.0".to_string(),
            timeout_secs: 300,
            fail_on_issues: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub directory: Option<String>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
        }
    }
}

/// `$XDG_CONFIG_HOME/nuverify/config.toml`, else `~/.config/nuverify/config.toml`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(xdg_dir("XDG_CONFIG_HOME", ".config")?.join("config.toml"))
}

/// `$XDG_CACHE_HOME/nuverify`, else `~/.cache/nuverify`.
pub fn default_cache_dir() -> Result<PathBuf, ConfigError> {
    xdg_dir("XDG_CACHE_HOME", ".cache")
}

fn xdg_dir(env_var: &str, home_fallback: &str) -> Result<PathBuf, ConfigError> {
    if let Some(base) = std::env::var_os(env_var).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(base).join(APP_DIR));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| ConfigError::Invalid("cannot determine home directory".into()))?;
    Ok(home.join(home_fallback).join(APP_DIR))
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Commented default configuration written by `nuverify init`.
pub const DEFAULT_CONFIG_TOML: &str = r#"# nuverify configuration

[llm]
# openai, anthropic, or custom (OpenAI-compatible endpoint; set base_url)
provider = "openai"
model = "gpt-4"
# api_key = ""
api_key_env = "OPENAI_API_KEY"
temperature = 0.1
max_tokens = 32000

[github]
# token = ""
token_env = "GITHUB_TOKEN"
use_gh_cli = true
release_repo = "nushell/nushell"
blog_repo = "nushell/nushell.github.io"

[scan]
directories = ["~/dots/bin", "~/dots/config/nushell"]
include_patterns = ["**/*.nu"]
exclude_patterns = ["**/.git/**", "**/node_modules/**"]
detect_shebang = true

[analysis]
max_concurrent = 4
default_distance = 6
floor_version = "0.0.0"
timeout_secs = 300
fail_on_issues = false

[cache]
enabled = true
# directory = "~/.cache/nuverify"
"#;
