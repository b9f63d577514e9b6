// GitHub change-log source: release list from the interpreter repo, release
// notes from the blog repo.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::config::GitHubSection;
use crate::error::{SourceError, VerifierError};
use crate::version::{Version, VersionRange};

use super::{ChangeLogBlock, ChangeLogSource};

/// Maximum retry attempts for rate-limited requests.
const MAX_RETRIES: u32 = 5;
/// Pause and wait for reset when remaining drops below this threshold.
const RATE_LIMIT_PAUSE_THRESHOLD: u32 = 5;
const PER_PAGE: usize = 100;
const MAX_PAGES: u32 = 10;
const BLOG_URL_PREFIX: &str = "https://www.nushell.sh/blog/";
const USER_AGENT: &str = concat!("nuverify/", env!("CARGO_PKG_VERSION"));

fn source_err(e: SourceError) -> VerifierError {
    VerifierError::Source(e)
}

/// GitHub REST API change-log source.
#[derive(Debug)]
pub struct GitHubReleaseSource {
    release_repo: String,
    blog_repo: String,
    token: Option<String>,
    client: Client,
    api_base: String,
    /// Remaining API calls before rate limit resets.
    rate_remaining: AtomicU32,
    /// Unix timestamp when the rate limit window resets.
    rate_reset: AtomicU64,
}

impl GitHubReleaseSource {
    pub fn new(release_repo: String, blog_repo: String, token: Option<String>) -> Self {
        Self {
            release_repo,
            blog_repo,
            token,
            client: crate::http_client(),
            api_base: "https://api.github.com".to_string(),
            rate_remaining: AtomicU32::new(u32::MAX),
            rate_reset: AtomicU64::new(0),
        }
    }

    /// Build from the `[github]` section, resolving the token.
    pub fn from_config(config: &GitHubSection) -> Self {
        let token = resolve_token(config);
        if token.is_none() {
            debug!("No GitHub token configured, using unauthenticated requests");
        }
        Self::new(config.release_repo.clone(), config.blog_repo.clone(), token)
    }

    #[must_use]
    pub fn with_api_base(mut self, url: String) -> Self {
        self.api_base = url;
        self
    }

    // ── Releases ────────────────────────────────────────────────────

    /// Stable releases, newest first, stopping once `stop_at` is passed.
    async fn releases(&self, stop_at: Option<&Version>) -> crate::error::Result<Vec<Release>> {
        let mut out = Vec::new();
        for page in 1..=MAX_PAGES {
            let path = format!(
                "/repos/{}/releases?per_page={PER_PAGE}&page={page}",
                self.release_repo
            );
            let batch: Vec<GhRelease> = self.api_get(&path).await?;
            let exhausted = batch.len() < PER_PAGE;

            let mut passed_stop = false;
            for raw in batch {
                if raw.draft || raw.prerelease {
                    continue;
                }
                let Ok(version) = Version::parse(&raw.tag_name) else {
                    debug!(tag = %raw.tag_name, "Skipping non-version tag");
                    continue;
                };
                if stop_at.is_some_and(|stop| version <= *stop) {
                    passed_stop = true;
                }
                out.push(Release {
                    version,
                    blog_url: raw.body.as_deref().and_then(extract_blog_url),
                    body: raw.body.unwrap_or_default(),
                    html_url: raw.html_url,
                });
            }

            if exhausted || passed_stop {
                break;
            }
        }
        Ok(out)
    }

    async fn release_text(&self, release: &Release) -> (String, Option<String>) {
        if let Some(path) = release.blog_url.as_deref().and_then(blog_path) {
            let api_path = format!("/repos/{}/contents/{path}", self.blog_repo);
            match self.api_get_raw(&api_path).await {
                Ok(text) if !text.trim().is_empty() => {
                    return (text, release.blog_url.clone());
                }
                Ok(_) => warn!(version = %release.version, "Empty blog post, using release notes"),
                Err(e) => {
                    warn!(version = %release.version, error = %e, "Blog post unavailable, using release notes");
                }
            }
        }
        (release.body.clone(), release.html_url.clone())
    }

    // ── HTTP Client ─────────────────────────────────────────────────

    async fn api_get<T: serde::de::DeserializeOwned>(&self, path: &str) -> crate::error::Result<T> {
        let resp = self.request(path, "application/vnd.github+json").await?;
        resp.json()
            .await
            .map_err(|e| source_err(SourceError::Parse(e.to_string())))
    }

    /// Fetch file contents undecoded (`application/vnd.github.raw`).
    async fn api_get_raw(&self, path: &str) -> crate::error::Result<String> {
        let resp = self.request(path, "application/vnd.github.raw").await?;
        resp.text()
            .await
            .map_err(|e| source_err(SourceError::Parse(e.to_string())))
    }

    async fn request(&self, path: &str, accept: &str) -> crate::error::Result<Response> {
        let url = format!("{}{path}", self.api_base);

        // Pre-check: if remaining is low, wait for reset
        self.wait_for_rate_reset().await;

        let mut delay = Duration::from_secs(1);

        for attempt in 0..=MAX_RETRIES {
            let mut req = self
                .client
                .get(&url)
                .header("Accept", accept)
                .header("User-Agent", USER_AGENT);

            if let Some(token) = &self.token {
                req = req.header("Authorization", format!("Bearer {token}"));
            }

            debug!(url = %url, attempt, "GitHub API request");

            let resp = req
                .send()
                .await
                .map_err(|e| source_err(SourceError::Network(e.to_string())))?;

            self.update_rate_limit(&resp);

            if resp.status().is_success() {
                return Ok(resp);
            }

            let status = resp.status().as_u16();
            if (status == 403 || status == 429) && attempt < MAX_RETRIES {
                let wait = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map_or(delay, Duration::from_secs);
                warn!(
                    attempt,
                    status,
                    wait_secs = wait.as_secs(),
                    "Rate limited, backing off"
                );
                tokio::time::sleep(wait).await;
                delay = (delay * 2).min(Duration::from_secs(60));
                continue;
            }

            let body = resp.text().await.unwrap_or_default();
            return Err(source_err(SourceError::Api { status, body }));
        }

        Err(source_err(SourceError::Network(format!(
            "max retries exceeded for {url}"
        ))))
    }

    fn update_rate_limit(&self, resp: &Response) {
        if let Some(remaining) = header_num::<u32>(resp, "x-ratelimit-remaining") {
            self.rate_remaining.store(remaining, Ordering::Relaxed);
            if remaining < 10 {
                warn!(remaining, "GitHub API rate limit low");
            }
        }
        if let Some(reset) = header_num::<u64>(resp, "x-ratelimit-reset") {
            self.rate_reset.store(reset, Ordering::Relaxed);
        }
    }

    async fn wait_for_rate_reset(&self) {
        let remaining = self.rate_remaining.load(Ordering::Relaxed);
        if remaining > RATE_LIMIT_PAUSE_THRESHOLD {
            return;
        }
        let reset_at = self.rate_reset.load(Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if reset_at > now {
            let wait = reset_at - now + 1;
            warn!(remaining, wait_secs = wait, "Rate limit low, waiting for reset");
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }
    }
}

#[async_trait::async_trait]
impl ChangeLogSource for GitHubReleaseSource {
    #[instrument(skip_all, name = "github_latest")]
    async fn latest_version(&self) -> crate::error::Result<Version> {
        let path = format!("/repos/{}/releases/latest", self.release_repo);
        let latest: GhRelease = self.api_get(&path).await?;
        Version::parse(&latest.tag_name).map_err(|_| {
            source_err(SourceError::Parse(format!(
                "latest release tag {:?} is not a version",
                latest.tag_name
            )))
        })
    }

    #[instrument(skip_all, name = "github_change_log", fields(range = %range))]
    async fn change_log(&self, range: &VersionRange) -> crate::error::Result<Vec<ChangeLogBlock>> {
        let all = self.releases(Some(&range.from)).await?;
        if all.is_empty() {
            return Err(source_err(SourceError::NoReleases(self.release_repo.clone())));
        }

        let mut wanted: Vec<Release> = all
            .into_iter()
            .filter(|r| range.contains(&r.version) && !r.version.is_patch_release())
            .collect();
        wanted.sort_by(|a, b| a.version.cmp(&b.version));
        wanted.dedup_by(|a, b| a.version == b.version);

        let mut blocks = Vec::with_capacity(wanted.len());
        for release in &wanted {
            let (text, origin) = self.release_text(release).await;
            if text.trim().is_empty() {
                warn!(version = %release.version, "Release has no notes");
                continue;
            }
            blocks.push(ChangeLogBlock {
                version: release.version.clone(),
                text,
                origin,
            });
        }

        info!(releases = blocks.len(), "Fetched change log");
        Ok(blocks)
    }
}

// ── GitHub API Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GhRelease {
    tag_name: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
}

#[derive(Debug, Clone)]
struct Release {
    version: Version,
    body: String,
    html_url: Option<String>,
    blog_url: Option<String>,
}

// ── Helpers ─────────────────────────────────────────────────────────

fn header_num<T: std::str::FromStr>(resp: &Response, name: &str) -> Option<T> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<T>().ok())
}

fn is_slug_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '/')
}

/// First `https://www.nushell.sh/blog/<slug>.html` link in a release body.
pub fn extract_blog_url(body: &str) -> Option<String> {
    let mut rest = body;
    while let Some(start) = rest.find(BLOG_URL_PREFIX) {
        let after = &rest[start + BLOG_URL_PREFIX.len()..];
        let slug_len = after.find(|c: char| !is_slug_char(c)).unwrap_or(after.len());
        if slug_len > 0 && after[slug_len..].starts_with(".html") {
            let end = start + BLOG_URL_PREFIX.len() + slug_len + ".html".len();
            return Some(rest[start..end].to_string());
        }
        rest = after;
    }
    None
}

/// `https://www.nushell.sh/blog/<slug>.html` → `blog/<slug>.md`.
pub fn blog_path(url: &str) -> Option<String> {
    let slug = url.strip_prefix(BLOG_URL_PREFIX)?.strip_suffix(".html")?;
    (!slug.is_empty()).then(|| format!("blog/{slug}.md"))
}

/// Configured token, else the token environment variable, else `gh auth token`.
pub fn resolve_token(config: &GitHubSection) -> Option<String> {
    if let Some(token) = config.token.as_ref().filter(|t| !t.trim().is_empty()) {
        return Some(token.clone());
    }
    if let Some(token) = std::env::var(&config.token_env)
        .ok()
        .filter(|t| !t.trim().is_empty())
    {
        return Some(token);
    }
    if config.use_gh_cli {
        return gh_cli_token();
    }
    None
}

fn gh_cli_token() -> Option<String> {
    let output = std::process::Command::new("gh")
        .args(["auth", "token"])
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!token.is_empty()).then_some(token)
}
