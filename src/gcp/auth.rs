//! GCP Authentication
//!
//! Access tokens come from a [`TokenSource`]: Application Default Credentials
//! through `gcp_auth` in normal runs, a fixed token for tests or when
//! `GOOGLE_OAUTH_ACCESS_TOKEN` is set.

use anyhow::{Context, Result};
use async_trait::async_trait;
use gcp_auth::TokenProvider;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Default scopes for GCP API access
pub const DEFAULT_SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-platform"];

/// Refresh tokens this much before they expire
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// Assumed token lifetime when the expiry is unknown
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

/// Supplies bearer tokens for API calls
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// A fixed token
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// `GOOGLE_OAUTH_ACCESS_TOKEN`, if set
    pub fn from_env() -> Option<Self> {
        std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .map(Self)
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Application Default Credentials with token caching
#[derive(Clone)]
pub struct GcpCredentials {
    provider: Arc<dyn TokenProvider>,
    token_cache: Arc<RwLock<Option<CachedToken>>>,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

impl GcpCredentials {
    pub async fn new() -> Result<Self> {
        let provider = gcp_auth::provider().await.context(
            "Failed to initialize GCP authentication. Run 'gcloud auth application-default login'",
        )?;

        Ok(Self {
            provider,
            token_cache: Arc::new(RwLock::new(None)),
        })
    }
}

#[async_trait]
impl TokenSource for GcpCredentials {
    async fn token(&self) -> Result<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some(cached) = cache.as_ref().filter(|c| c.is_valid()) {
                return Ok(cached.token.clone());
            }
        }

        let token = self
            .provider
            .token(DEFAULT_SCOPES)
            .await
            .context("Failed to get access token")?;
        let token = token.as_str().to_string();

        *self.token_cache.write().await = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + DEFAULT_TOKEN_TTL - TOKEN_EXPIRY_BUFFER,
        });
        tracing::debug!(
            "New token cached, expires in ~{} minutes",
            (DEFAULT_TOKEN_TTL - TOKEN_EXPIRY_BUFFER).as_secs() / 60
        );
        Ok(token)
    }
}

/// Get the gcloud configuration directory
fn get_gcloud_config_dir() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CLOUDSDK_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|p| p.join("gcloud"))
}

/// Project IDs are 6-30 characters of lowercase letters, digits and hyphens,
/// start with a letter and do not end with a hyphen
pub fn validate_project_id(project: &str) -> bool {
    if project.len() < 6 || project.len() > 30 || project.ends_with('-') {
        return false;
    }
    if !project.starts_with(|c: char| c.is_ascii_lowercase()) {
        return false;
    }
    project.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// `project = ...` from an ini-style gcloud file, restricted to `section` when given
fn project_from_ini(content: &str, section: Option<&str>) -> Option<String> {
    let mut in_section = section.is_none();
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            in_section = section.map_or(true, |s| line == s);
            continue;
        }
        if in_section && line.starts_with("project") {
            if let Some((_, value)) = line.split_once('=') {
                let project = value.trim();
                if validate_project_id(project) {
                    return Some(project.to_string());
                }
            }
        }
    }
    None
}

/// Default project from the environment or the active gcloud configuration
pub fn get_default_project() -> Option<String> {
    for var in ["CLOUDSDK_CORE_PROJECT", "GOOGLE_CLOUD_PROJECT", "GCLOUD_PROJECT"] {
        if let Ok(project) = std::env::var(var) {
            if validate_project_id(&project) {
                return Some(project);
            }
            tracing::warn!("Invalid project ID format in {}", var);
        }
    }

    let config_dir = get_gcloud_config_dir()?;
    if let Ok(content) = std::fs::read_to_string(config_dir.join("properties")) {
        if let Some(project) = project_from_ini(&content, None) {
            return Some(project);
        }
    }

    let active = std::fs::read_to_string(config_dir.join("active_config")).ok()?;
    let name = active.trim();
    // Path traversal guard
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        tracing::warn!("Invalid characters in active_config name");
        return None;
    }
    let content = std::fs::read_to_string(
        config_dir.join("configurations").join(format!("config_{}", name)),
    )
    .ok()?;
    project_from_ini(&content, Some("[core]"))
}
