//! Run Configuration
//!
//! Settings for one engine invocation: which scopes to run against, dry-run,
//! concurrency, retry and rate limits, cache and output locations.
//!
//! Precedence: CLI flags > environment > config file > defaults. The config
//! file is YAML or JSON, read from `--config` or from
//! `<config_dir>/custodian/config.{yaml,yml,json}`.

use crate::actions::RateLimit;
use crate::cache::{CacheLayer, FileCacheStore};
use crate::provider::Scope;
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// One account (AWS account id, GCP project) to run against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    /// Provider of this account; defaults to the run's provider
    #[serde(default)]
    pub provider: Option<String>,
    /// Regions for this account; defaults to the run's regions
    #[serde(default)]
    pub regions: Vec<String>,
}

/// Retry settings for provider calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub call_timeout_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            call_timeout_secs: policy.call_timeout.as_secs(),
        }
    }
}

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Provider assumed for accounts that name none
    pub provider: String,
    pub accounts: Vec<AccountConfig>,
    pub regions: Vec<String>,
    pub dryrun: bool,
    /// Minutes a persisted cache entry stays valid; 0 keeps the cache in-run only
    pub cache_period: u64,
    pub cache_dir: Option<PathBuf>,
    /// Root of the JSON result sink; results are only logged when unset
    pub output_dir: Option<PathBuf>,
    /// (policy, scope) runs in flight
    pub max_workers: usize,
    /// Resources evaluated concurrently per run
    pub filter_concurrency: usize,
    /// Action batches in flight per action
    pub action_concurrency: usize,
    pub retry: RetrySettings,
    pub rate_limit: RateLimit,
    /// Push mode ignores events that carry an error code
    pub skip_error_events: bool,
    /// Cancel the run after this many seconds
    pub run_timeout_secs: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            provider: crate::resource::DEFAULT_PROVIDER.to_string(),
            accounts: Vec::new(),
            regions: Vec::new(),
            dryrun: false,
            cache_period: 0,
            cache_dir: None,
            output_dir: None,
            max_workers: 4,
            filter_concurrency: 16,
            action_concurrency: 4,
            retry: RetrySettings::default(),
            rate_limit: RateLimit::default(),
            skip_error_events: true,
            run_timeout_secs: None,
        }
    }
}

impl RunConfig {
    /// Default config file, if one exists
    fn default_path() -> Option<PathBuf> {
        let dir = dirs::config_dir()?.join("custodian");
        ["config.yaml", "config.yml", "config.json"]
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.exists())
    }

    /// Load from an explicit path (must exist) or the default location
    /// (optional), then apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_path(path)?,
            None => match Self::default_path() {
                Some(path) => Self::from_path(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
        let config = if is_json {
            serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))?
        } else {
            serde_yaml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))?
        };
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply `CUSTODIAN_REGIONS`, `AWS_DEFAULT_REGION` and `CUSTODIAN_DRYRUN`
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(regions) = var("CUSTODIAN_REGIONS") {
            let regions: Vec<String> = regions
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(String::from)
                .collect();
            if !regions.is_empty() {
                self.regions = regions;
            }
        }
        if self.regions.is_empty() {
            if let Some(region) = var("AWS_DEFAULT_REGION").filter(|r| !r.is_empty()) {
                self.regions = vec![region];
            }
        }
        if let Some(flag) = var("CUSTODIAN_DRYRUN") {
            self.dryrun = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    fn default_region(provider: &str) -> &'static str {
        match provider {
            "gcp" => "us-central1",
            _ => "us-east-1",
        }
    }

    /// Every (provider, account, region) combination to run against
    pub fn scopes(&self) -> Vec<Scope> {
        let accounts = if self.accounts.is_empty() {
            vec![AccountConfig {
                id: "default".to_string(),
                provider: None,
                regions: Vec::new(),
            }]
        } else {
            self.accounts.clone()
        };

        let mut scopes = Vec::new();
        for account in &accounts {
            let provider = account.provider.as_deref().unwrap_or(&self.provider);
            let regions = if !account.regions.is_empty() {
                account.regions.clone()
            } else if !self.regions.is_empty() {
                self.regions.clone()
            } else {
                vec![Self::default_region(provider).to_string()]
            };
            for region in regions {
                let scope = Scope::new(provider, &account.id, &region);
                if !scopes.contains(&scope) {
                    scopes.push(scope);
                }
            }
        }
        scopes
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.attempts.max(1),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            call_timeout: Duration::from_secs(self.retry.call_timeout_secs.max(1)),
        }
    }

    /// Cache layer for one engine invocation, persisted when `cache_period` > 0
    pub fn cache_layer(&self) -> CacheLayer {
        let cache = CacheLayer::new();
        if self.cache_period == 0 {
            return cache;
        }
        let period = Duration::from_secs(self.cache_period * 60);
        match self.cache_dir.clone().or_else(FileCacheStore::default_dir) {
            Some(dir) => cache
                .with_ttl(period)
                .with_store(Arc::new(FileCacheStore::new(dir, period))),
            None => {
                tracing::warn!("No cache directory available, cache is kept in memory only");
                cache.with_ttl(period)
            },
        }
    }
}
