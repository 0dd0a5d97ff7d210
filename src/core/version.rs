//! Version resolution: turning a user constraint into a concrete version.
//!
//! Constraints: empty or `latest`, an exact version, a semver requirement
//! (`^1.2`, `>=1, <2`), or a prefix (`1.2` picks the newest `1.2.x`).

use super::error::{Error, Result};
use super::types::Recipe;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A concrete version and the upstream tag it was published under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: String,
    pub tag: String,
}

impl VersionInfo {
    pub fn new(version: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            tag: tag.into(),
        }
    }

    /// Placeholder for recipes that cannot resolve a version.
    pub fn dev() -> Self {
        Self::new("dev", "dev")
    }
}

#[async_trait]
pub trait VersionProvider: Send + Sync {
    /// Every known version.
    async fn list_versions(&self, cancel: &CancellationToken) -> Result<Vec<VersionInfo>>;

    fn tool(&self) -> &str;

    async fn resolve(&self, constraint: &str, cancel: &CancellationToken) -> Result<VersionInfo> {
        let candidates = self.list_versions(cancel).await?;
        select_version(self.tool(), &candidates, constraint)
    }
}

// ============================================================================
// Selection
// ============================================================================

/// Parse leniently: leading `v`, and missing minor/patch components.
fn parse_lenient(version: &str) -> Option<semver::Version> {
    let v = version.trim().trim_start_matches('v');
    if let Ok(parsed) = semver::Version::parse(v) {
        return Some(parsed);
    }
    let parts: Vec<&str> = v.split('.').collect();
    let padded = match parts.len() {
        1 => format!("{}.0.0", v),
        2 => format!("{}.0", v),
        _ => return None,
    };
    semver::Version::parse(&padded).ok()
}

/// Pre-release markers as whole tokens: `2.0.0-rc.1` and `1.0rc2` are
/// unstable, `1.0.0+source` is not.
static UNSTABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[^a-z])(?:preview|alpha|beta|rc|dev|snapshot|nightly)(?:[^a-z]|$)")
        .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
});

fn is_stable(version: &str) -> bool {
    !UNSTABLE.is_match(version)
}

fn looks_like_requirement(constraint: &str) -> bool {
    constraint.starts_with(['^', '~', '>', '<', '=', '*']) || constraint.contains(',')
}

fn newest<'a>(candidates: impl Iterator<Item = &'a VersionInfo>) -> Option<&'a VersionInfo> {
    candidates
        .filter_map(|c| parse_lenient(&c.version).map(|v| (v, c)))
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, c)| c)
}

/// Pick the version `constraint` asks for from `candidates`.
pub fn select_version(tool: &str, candidates: &[VersionInfo], constraint: &str) -> Result<VersionInfo> {
    let constraint = constraint.trim();
    let fail = |message: String| Error::VersionResolution {
        tool: tool.to_string(),
        message,
    };
    if candidates.is_empty() {
        return Err(fail("no versions available".to_string()));
    }

    if constraint.is_empty() || constraint == "latest" {
        let stable = newest(candidates.iter().filter(|c| is_stable(&c.version)));
        return stable
            .or_else(|| newest(candidates.iter()))
            .or_else(|| candidates.first())
            .cloned()
            .ok_or_else(|| fail("no versions available".to_string()));
    }

    let bare = constraint.trim_start_matches('v');
    if let Some(exact) = candidates
        .iter()
        .find(|c| c.version == constraint || c.version == bare)
    {
        return Ok(exact.clone());
    }

    if looks_like_requirement(constraint) {
        let req = semver::VersionReq::parse(constraint)
            .map_err(|e| fail(format!("invalid version requirement '{}': {}", constraint, e)))?;
        return newest(
            candidates
                .iter()
                .filter(|c| parse_lenient(&c.version).is_some_and(|v| req.matches(&v))),
        )
        .cloned()
        .ok_or_else(|| fail(format!("no version matches '{}'", constraint)));
    }

    // Prefix: newest stable match, pre-releases only if nothing else fits
    let prefix = format!("{}.", bare);
    let matching = || candidates.iter().filter(|c| c.version.starts_with(&prefix));
    newest(matching().filter(|c| is_stable(&c.version)))
        .or_else(|| newest(matching()))
        .cloned()
        .ok_or_else(|| fail(format!("no version matches '{}'", constraint)))
}

// ============================================================================
// Providers
// ============================================================================

/// Versions listed in the recipe itself.
#[derive(Debug, Clone)]
pub struct StaticVersionProvider {
    tool: String,
    versions: Vec<String>,
    tag_prefix: String,
}

impl StaticVersionProvider {
    pub fn new(tool: &str, versions: Vec<String>, tag_prefix: Option<&str>) -> Self {
        Self {
            tool: tool.to_string(),
            versions,
            tag_prefix: tag_prefix.unwrap_or_default().to_string(),
        }
    }
}

#[async_trait]
impl VersionProvider for StaticVersionProvider {
    async fn list_versions(&self, _cancel: &CancellationToken) -> Result<Vec<VersionInfo>> {
        Ok(self
            .versions
            .iter()
            .map(|v| VersionInfo::new(v, format!("{}{}", self.tag_prefix, v)))
            .collect())
    }

    fn tool(&self) -> &str {
        &self.tool
    }
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
}

/// Published, non-draft, non-prerelease GitHub releases.
#[derive(Debug, Clone)]
pub struct GitHubReleasesProvider {
    tool: String,
    repo: String,
    tag_prefix: Option<String>,
    api_base: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl GitHubReleasesProvider {
    pub fn new(
        client: reqwest::Client,
        api_base: &str,
        token: Option<String>,
        tool: &str,
        repo: &str,
        tag_prefix: Option<&str>,
    ) -> Self {
        Self {
            tool: tool.to_string(),
            repo: repo.to_string(),
            tag_prefix: tag_prefix.map(str::to_string),
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            client,
        }
    }

    /// Version for a tag, or `None` when the tag lacks the required prefix.
    fn version_of(&self, tag: &str) -> Option<String> {
        match self.tag_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => tag.strip_prefix(prefix).map(str::to_string),
            _ => Some(tag.trim_start_matches('v').to_string()),
        }
    }

    async fn fetch(&self) -> Result<Vec<Release>> {
        let url = format!("{}/repos/{}/releases?per_page=100", self.api_base, self.repo);
        let mut request = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.error(format!("request to {} failed: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(self.error(format!("{} returned {}", url, response.status())));
        }
        response
            .json::<Vec<Release>>()
            .await
            .map_err(|e| self.error(format!("invalid releases response: {}", e)))
    }

    fn error(&self, message: String) -> Error {
        Error::VersionResolution {
            tool: self.tool.clone(),
            message,
        }
    }
}

#[async_trait]
impl VersionProvider for GitHubReleasesProvider {
    async fn list_versions(&self, cancel: &CancellationToken) -> Result<Vec<VersionInfo>> {
        let releases = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = self.fetch() => r?,
        };
        Ok(releases
            .into_iter()
            .filter(|r| !r.draft && !r.prerelease)
            .filter_map(|r| {
                self.version_of(&r.tag_name)
                    .map(|version| VersionInfo::new(version, r.tag_name))
            })
            .collect())
    }

    fn tool(&self) -> &str {
        &self.tool
    }
}

// ============================================================================
// Recipe-level resolution
// ============================================================================

/// Resolves a recipe's version from whatever source it declares.
#[async_trait]
pub trait VersionResolver: Send + Sync {
    async fn resolve(
        &self,
        recipe: &Recipe,
        constraint: &str,
        cancel: &CancellationToken,
    ) -> Result<VersionInfo>;
}

/// Picks a provider from the recipe's `[version]` section.
#[derive(Debug, Clone)]
pub struct RecipeVersionResolver {
    client: reqwest::Client,
    github_api: String,
    github_token: Option<String>,
}

impl RecipeVersionResolver {
    pub fn new(github_api: &str, github_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("kura/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            github_api: github_api.to_string(),
            github_token,
        })
    }

    pub fn provider_for(&self, recipe: &Recipe) -> Result<Box<dyn VersionProvider>> {
        let section = &recipe.version;
        let tool = recipe.name();
        let source = match section.source.as_deref() {
            Some(s) => s,
            None if section.github_repo.is_some() => "github_releases",
            None if !section.versions.is_empty() => "static",
            None => {
                return Err(Error::VersionResolution {
                    tool: tool.to_string(),
                    message: "recipe declares no version source".to_string(),
                })
            }
        };
        match source {
            "static" => Ok(Box::new(StaticVersionProvider::new(
                tool,
                section.versions.clone(),
                section.tag_prefix.as_deref(),
            ))),
            "github_releases" => {
                let repo = section.github_repo.as_deref().ok_or_else(|| Error::VersionResolution {
                    tool: tool.to_string(),
                    message: "github_releases source needs github_repo".to_string(),
                })?;
                Ok(Box::new(GitHubReleasesProvider::new(
                    self.client.clone(),
                    &self.github_api,
                    self.github_token.clone(),
                    tool,
                    repo,
                    section.tag_prefix.as_deref(),
                )))
            }
            other => Err(Error::VersionResolution {
                tool: tool.to_string(),
                message: format!("unknown version source '{}'", other),
            }),
        }
    }
}

#[async_trait]
impl VersionResolver for RecipeVersionResolver {
    async fn resolve(
        &self,
        recipe: &Recipe,
        constraint: &str,
        cancel: &CancellationToken,
    ) -> Result<VersionInfo> {
        self.provider_for(recipe)?.resolve(constraint, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::core::types::VersionSection;

    fn candidates(versions: &[&str]) -> Vec<VersionInfo> {
        versions
            .iter()
            .map(|v| VersionInfo::new(*v, format!("v{}", v)))
            .collect()
    }

    #[test]
    fn test_latest_prefers_stable() {
        let c = candidates(&["1.2.0", "1.10.0", "2.0.0-rc.1", "1.9.9"]);
        assert_eq!(select_version("t", &c, "").unwrap().version, "1.10.0");
        assert_eq!(select_version("t", &c, "latest").unwrap().tag, "v1.10.0");
    }

    #[test]
    fn test_exact_and_v_prefixed() {
        let c = candidates(&["1.2.0", "1.3.0"]);
        assert_eq!(select_version("t", &c, "1.2.0").unwrap().version, "1.2.0");
        assert_eq!(select_version("t", &c, "v1.2.0").unwrap().version, "1.2.0");
    }

    #[test]
    fn test_prefix_picks_newest_patch() {
        let c = candidates(&["1.2.0", "1.2.7", "1.20.0", "1.3.0"]);
        assert_eq!(select_version("t", &c, "1.2").unwrap().version, "1.2.7");
        assert_eq!(select_version("t", &c, "1").unwrap().version, "1.20.0");
    }

    #[test]
    fn test_semver_requirement() {
        let c = candidates(&["1.2.0", "1.9.0", "2.1.0"]);
        assert_eq!(select_version("t", &c, "^1.2").unwrap().version, "1.9.0");
        assert_eq!(select_version("t", &c, ">=1.5, <3").unwrap().version, "2.1.0");
        let err = select_version("t", &c, "^3").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionResolution);
    }

    #[test]
    fn test_no_match() {
        let c = candidates(&["1.0.0"]);
        assert!(select_version("t", &c, "2.0").is_err());
        assert!(select_version("t", &[], "").is_err());
    }

    #[tokio::test]
    async fn test_static_provider_tags() {
        let p = StaticVersionProvider::new("node", vec!["20.1.0".into(), "22.0.0".into()], Some("v"));
        let info = p.resolve("20", &CancellationToken::new()).await.unwrap();
        assert_eq!(info, VersionInfo::new("20.1.0", "v20.1.0"));
    }

    #[test]
    fn test_github_tag_prefix() {
        let client = reqwest::Client::new();
        let p = GitHubReleasesProvider::new(client.clone(), "https://api.github.com", None, "jq", "jqlang/jq", Some("jq-"));
        assert_eq!(p.version_of("jq-1.7.1").as_deref(), Some("1.7.1"));
        assert_eq!(p.version_of("v1.7.1"), None);
        let p = GitHubReleasesProvider::new(client, "https://api.github.com/", None, "rg", "BurntSushi/ripgrep", None);
        assert_eq!(p.version_of("v14.1.0").as_deref(), Some("14.1.0"));
        assert_eq!(p.api_base, "https://api.github.com");
    }

    #[test]
    fn test_provider_inference() {
        let resolver = RecipeVersionResolver::new("https://api.github.com", None).unwrap();
        let mut recipe = Recipe::default();
        recipe.metadata.name = "x".into();
        assert!(resolver.provider_for(&recipe).is_err());

        recipe.version = VersionSection {
            versions: vec!["1.0.0".into()],
            ..VersionSection::default()
        };
        assert!(resolver.provider_for(&recipe).is_ok());

        recipe.version.source = Some("pypi".into());
        let err = resolver.provider_for(&recipe).err().unwrap();
        assert!(err.to_string().contains("unknown version source"));
    }

    #[tokio::test]
    async fn test_github_cancelled() {
        let p = GitHubReleasesProvider::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            None,
            "t",
            "o/r",
            None,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = p.list_versions(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_unstable_markers_are_whole_tokens() {
        assert!(!is_stable("2.0.0-rc.1"));
        assert!(!is_stable("1.0rc2"));
        assert!(!is_stable("3.1.0-BETA"));
        assert!(!is_stable("dev"));
        assert!(is_stable("1.0.0+source"));
        assert!(is_stable("1.2.3"));
    }
}
