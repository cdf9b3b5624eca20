//! Provider capability interface
//!
//! The engine never talks to a cloud SDK directly. Every provider adapter
//! exposes the same `list` / `describe` / `mutate` contract and classifies
//! its failures as transient or permanent, so the resolver and executor can
//! treat all clouds uniformly.
//!
//! # Module Structure
//!
//! - [`dryrun`] - Interceptor that suppresses mutating calls
//! - [`memory`] - In-memory provider backed by fixtures (tests, offline runs)

pub mod dryrun;
pub mod memory;

use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub use dryrun::DryRunClient;
pub use memory::MemoryProvider;

/// The (provider, account, region) triple a run executes against
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Scope {
    pub provider: String,
    pub account: String,
    pub region: String,
}

impl Scope {
    pub fn new(provider: &str, account: &str, region: &str) -> Self {
        Self {
            provider: provider.to_string(),
            account: account.to_string(),
            region: region.to_string(),
        }
    }

    /// Same provider and account, different region
    pub fn with_region(&self, region: &str) -> Self {
        Self {
            region: region.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.provider, self.account, self.region)
    }
}

/// Parameters for one page of a listing
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Resource ids to push down to the provider API
    pub ids: Option<Vec<String>>,
    pub page_token: Option<String>,
}

/// One page of raw provider records
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Value>,
    pub next_token: Option<String>,
}

impl Page {
    pub fn last(items: Vec<Value>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}

/// A mutating call against a set of targets
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationRequest {
    /// Provider operation, e.g. `stop`, `tag`, `invoke`
    pub operation: String,
    pub resource_type: String,
    pub scope: Scope,
    pub targets: Vec<String>,
    #[serde(default)]
    pub params: Value,
}

/// Per-target result of a mutating call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TargetOutcome {
    pub fn ok(id: &str) -> Self {
        Self {
            id: id.to_string(),
            error: None,
        }
    }

    pub fn failed(id: &str, error: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Uniform provider contract
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider name, e.g. `aws` or `gcp`
    fn name(&self) -> &str;

    /// List one page of raw records
    async fn list(
        &self,
        resource_type: &str,
        scope: &Scope,
        query: &ListQuery,
    ) -> Result<Page, ProviderError>;

    /// Fetch a single raw record; `Ok(None)` when it does not exist
    async fn describe(
        &self,
        resource_type: &str,
        scope: &Scope,
        id: &str,
    ) -> Result<Option<Value>, ProviderError>;

    /// Apply an operation to a batch of targets.
    ///
    /// `Err` means the whole batch failed; per-target failures are reported
    /// through [`TargetOutcome::error`].
    async fn mutate(&self, request: &MutationRequest) -> Result<Vec<TargetOutcome>, ProviderError>;
}

/// Provider clients by provider name
#[derive(Clone, Default)]
pub struct ProviderSet {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.insert(client);
        self
    }

    pub fn insert(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.name().to_string(), client);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(provider).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.clients.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_display() {
        let scope = Scope::new("aws", "123456789012", "us-east-1");
        assert_eq!(scope.to_string(), "aws:123456789012/us-east-1");
        assert_eq!(scope.with_region("eu-west-1").region, "eu-west-1");
    }

    #[test]
    fn test_provider_set_lookup() {
        let set = ProviderSet::new().with(Arc::new(MemoryProvider::new("aws")));
        assert!(set.get("aws").is_some());
        assert!(set.get("gcp").is_none());
    }
}
