use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "wikiupload.toml";
pub const DEFAULT_USER_AGENT: &str = "wikiupload/0.2";
pub const DEFAULT_SUMMARY: &str = "Automated upload";
pub const DEFAULT_LOGIN_CONFIRMED_SUFFIX: &str = "Login_Confirmed";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RATE_LIMIT_WRITE_MS: u64 = 1_000;
pub const DEFAULT_MAX_RETRIES: usize = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_WORKERS: usize = 1;
/// Files at or above this size are sent through the stashed chunk protocol.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// A string that never shows up in `Debug` output.
#[derive(Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct UploadConfig {
    #[serde(default, alias = "igem")]
    pub upload: UploadSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct UploadSection {
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub team: Option<String>,
    pub prefix: Option<String>,
    #[serde(default)]
    pub strip: bool,
    #[serde(default)]
    pub strip_markers: Vec<String>,
    #[serde(default)]
    pub no_index: bool,
    pub year: Option<u32>,
    pub url: Option<String>,
    pub api_url: Option<String>,
    pub login_url: Option<String>,
    pub login_confirmed_suffix: Option<String>,
    pub build_root: Option<PathBuf>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub check_unchanged: bool,
    pub max_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub workers: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub rate_limit_write_ms: Option<u64>,
    pub chunk_size: Option<usize>,
    pub user_agent: Option<String>,
    pub summary: Option<String>,
}

/// Account used for the whole run. Loaded once, never logged.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    password: Secret,
    pub team: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>, team: Option<String>) -> Self {
        Self {
            username: username.into(),
            password: Secret::new(password),
            team,
        }
    }

    pub fn password(&self) -> &str {
        self.password.expose()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password)
            .field("team", &self.team)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiEndpoints {
    /// Base used for page URLs and raw fetches, without a trailing slash.
    pub url: String,
    pub api_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginFlow {
    /// MediaWiki `action=login` with a login token.
    Api,
    /// Account-portal form post that redirects to a confirmation page on success.
    Form { url: String, confirmed_suffix: String },
}

impl UploadConfig {
    /// Apply process environment overrides: env > config.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let section = &mut self.upload;
        if let Some(username) = value("WIKI_BOT_USER") {
            section.username = Some(username);
        }
        if let Some(password) = value("WIKI_BOT_PASS") {
            section.password = Some(Secret::new(password));
        }
        if let Some(team) = value("WIKI_TEAM") {
            section.team = Some(team);
        }
        if let Some(url) = value("WIKI_URL") {
            section.url = Some(url);
        }
        if let Some(api_url) = value("WIKI_API_URL") {
            section.api_url = Some(api_url);
        }
        if let Some(user_agent) = value("WIKI_USER_AGENT") {
            section.user_agent = Some(user_agent);
        }
        if let Some(timeout) = value("WIKI_HTTP_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            section.timeout_ms = Some(timeout);
        }
        if let Some(rate) = value("WIKI_RATE_LIMIT_WRITE").and_then(|v| v.parse().ok()) {
            section.rate_limit_write_ms = Some(rate);
        }
        if let Some(retries) = value("WIKI_HTTP_RETRIES").and_then(|v| v.parse().ok()) {
            section.max_retries = Some(retries);
        }
        if let Some(delay) = value("WIKI_HTTP_RETRY_DELAY_MS").and_then(|v| v.parse().ok()) {
            section.retry_delay_ms = Some(delay);
        }
    }

    /// Credentials for a run that talks to the remote. Missing fields abort the run.
    pub fn credentials(&self) -> Result<Credentials> {
        let username = self
            .upload
            .username
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow::anyhow!("`username` is required (config, --username or WIKI_BOT_USER)"))?;
        let password = match &self.upload.password {
            Some(secret) if !secret.is_empty() => secret.expose().to_string(),
            _ => bail!("`password` is required (config, --password or WIKI_BOT_PASS)"),
        };
        Ok(Credentials::new(username, password, self.team()))
    }

    pub fn team(&self) -> Option<String> {
        self.upload
            .team
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    }

    /// Resolve wiki and API URLs: explicit keys > derived from each other > year edition.
    pub fn endpoints(&self) -> Result<WikiEndpoints> {
        let url = non_empty(self.upload.url.as_deref());
        let api_url = non_empty(self.upload.api_url.as_deref());
        let (url, api_url) = match (url, api_url) {
            (Some(url), Some(api_url)) => (url, api_url),
            (Some(url), None) => {
                let api_url = format!("{}/api.php", url.trim_end_matches('/'));
                (url, api_url)
            }
            (None, Some(api_url)) => match derive_wiki_url(&api_url) {
                Some(url) => (url, api_url),
                None => bail!("cannot derive wiki URL from api_url {api_url}"),
            },
            (None, None) => match self.upload.year {
                Some(year) => {
                    let url = format!("https://{year}.igem.org");
                    let api_url = format!("{url}/wiki/api.php");
                    (url, api_url)
                }
                None => bail!("no wiki configured: set `url`, `api_url` or `year`"),
            },
        };
        Ok(WikiEndpoints {
            url: url.trim_end_matches('/').to_string(),
            api_url,
        })
    }

    pub fn login_flow(&self) -> LoginFlow {
        match non_empty(self.upload.login_url.as_deref()) {
            Some(url) => LoginFlow::Form {
                url,
                confirmed_suffix: non_empty(self.upload.login_confirmed_suffix.as_deref())
                    .unwrap_or_else(|| DEFAULT_LOGIN_CONFIRMED_SUFFIX.to_string()),
            },
            None => LoginFlow::Api,
        }
    }

    pub fn user_agent(&self) -> String {
        non_empty(self.upload.user_agent.as_deref())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn summary(&self) -> String {
        non_empty(self.upload.summary.as_deref()).unwrap_or_else(|| DEFAULT_SUMMARY.to_string())
    }

    pub fn workers(&self) -> usize {
        self.upload.workers.unwrap_or(DEFAULT_WORKERS).max(1)
    }

    pub fn max_retries(&self) -> usize {
        self.upload.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn retry_delay_ms(&self) -> u64 {
        self.upload.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.upload.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    pub fn rate_limit_write_ms(&self) -> u64 {
        self.upload
            .rate_limit_write_ms
            .unwrap_or(DEFAULT_RATE_LIMIT_WRITE_MS)
    }

    pub fn chunk_size(&self) -> usize {
        self.upload.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1)
    }
}

/// Load and parse an UploadConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<UploadConfig> {
    if !config_path.exists() {
        return Ok(UploadConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: UploadConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Derive wiki base URL from an API URL by stripping `/api.php` or `/w/api.php`.
pub fn derive_wiki_url(api_url: &str) -> Option<String> {
    let trimmed = api_url.trim();
    let stripped = trimmed
        .strip_suffix("/w/api.php")
        .or_else(|| trimmed.strip_suffix("/wiki/api.php"))
        .or_else(|| trimmed.strip_suffix("/api.php"))
        .unwrap_or(trimmed);
    let result = stripped.trim_end_matches('/').to_string();
    if result.is_empty() {
        None
    } else {
        Some(result)
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
