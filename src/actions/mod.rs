//! Action Executor
//!
//! Actions operate on the full set of resources that survived the filter
//! stage, in batches. Every mutating call goes through [`ActionContext::mutate`],
//! which is where dry-run interception and the per-account submission gate
//! live; outbound messages go through [`ActionContext::post_json`], which
//! sends nothing in dry-run. Actions never hold a client of their own.
//!
//! # Module Structure
//!
//! - [`executor`] - Batching, fallback, ordering, non-continuable handling
//! - [`gate`] - Rate-limit aware submission gate per (provider, account)
//! - [`registry`] - Action type name to constructor
//! - [`operations`] - Provider operations declared by resource types, `invoke`
//! - [`tags`] - `tag`, `remove-tag`, `mark-for-op`
//! - [`notify`] - Webhook notifications

pub mod executor;
pub mod gate;
pub mod notify;
pub mod operations;
pub mod registry;
pub mod tags;

use crate::cache::CacheLayer;
use crate::error::{ActionError, ProviderError};
use crate::provider::{MutationRequest, ProviderClient, Scope, TargetOutcome};
use crate::resource::model::Resource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

pub use executor::{ActionExecutor, ExecutionTarget};
pub use gate::{RateLimit, SubmissionGate};
pub use registry::{standard_registry, ActionRegistry};

/// Decision taken for one resource before any call is made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Apply,
    /// Nothing to do for this resource (pre-condition not met, already done)
    Skip(String),
}

/// A registered action implementation
#[async_trait]
pub trait Action: Send + Sync + fmt::Debug {
    /// Type name as written in policies
    fn type_name(&self) -> &str;

    /// Preferred number of resources per provider call
    fn batch_size(&self) -> usize {
        1
    }

    /// False for terminal actions (terminate, delete): later actions skip the
    /// resources this one handled.
    fn continuable(&self) -> bool {
        true
    }

    /// Pre-condition check. Runs in dry-run too.
    fn plan(&self, _resource: &Resource, _ctx: &ActionContext) -> Plan {
        Plan::Apply
    }

    /// Apply the action to one batch.
    ///
    /// `Err` fails the whole batch; the executor then retries the resources
    /// one by one.
    async fn process(
        &self,
        batch: &[Arc<Resource>],
        ctx: &ActionContext,
    ) -> Result<Vec<TargetOutcome>, ProviderError>;
}

/// What happened to one resource under one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Outcome {
    Succeeded,
    SkippedDryRun,
    Skipped { reason: String },
    Failed { reason: String },
}

impl Outcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// The action took effect (or would have, in dry-run)
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Succeeded | Self::SkippedDryRun)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::SkippedDryRun => write!(f, "skipped (dry-run)"),
            Self::Skipped { reason } => write!(f, "skipped: {}", reason),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Outcome of one resource under one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceOutcome {
    pub resource_id: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Result of applying one action to the matched set, in match order
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub action: String,
    pub outcomes: Vec<ResourceOutcome>,
}

impl ActionResult {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            outcomes: Vec::new(),
        }
    }

    pub fn outcome(&self, resource_id: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|o| o.resource_id == resource_id)
            .map(|o| &o.outcome)
    }

    pub fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.outcome)).count()
    }

    /// Failed resources as errors, for the run report
    pub fn errors(&self) -> Vec<ActionError> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.outcome {
                Outcome::Failed { reason } => Some(ActionError {
                    action: self.action.clone(),
                    resource_id: Some(o.resource_id.clone()),
                    message: reason.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Everything an action may touch while processing a batch.
///
/// Built by the executor: in dry-run the client is a [`crate::provider::DryRunClient`].
pub struct ActionContext {
    pub policy: String,
    pub scope: Scope,
    pub resource_type: String,
    pub dry_run: bool,
    /// Reference time of the run
    pub now: DateTime<Utc>,
    http: reqwest::Client,
    client: Arc<dyn ProviderClient>,
    gate: Arc<SubmissionGate>,
    cache: Arc<CacheLayer>,
}

impl ActionContext {
    /// Issue a mutating provider call through the submission gate
    pub async fn mutate(&self, request: MutationRequest) -> Result<Vec<TargetOutcome>, ProviderError> {
        let _permit = self.gate.acquire().await?;
        tracing::debug!(
            "mutate {} {} on {} target(s) in {}",
            request.resource_type,
            request.operation,
            request.targets.len(),
            request.scope
        );
        self.client.mutate(&request).await
    }

    /// POST a JSON message to an outbound endpoint. In dry-run nothing is
    /// sent and `None` is returned.
    pub async fn post_json(
        &self,
        url: &url::Url,
        body: &serde_json::Value,
    ) -> Result<Option<reqwest::Response>, ProviderError> {
        if self.dry_run {
            tracing::info!("[dry-run] suppressed POST {}", url);
            return Ok(None);
        }
        tracing::debug!("POST {}", url);
        self.http
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map(Some)
            .map_err(|e| ProviderError::Transient(format!("request to {} failed: {}", url, e)))
    }

    /// Request for `operation` on the resources of a batch
    pub fn request(&self, operation: &str, batch: &[Arc<Resource>], params: serde_json::Value) -> MutationRequest {
        MutationRequest {
            operation: operation.to_string(),
            resource_type: self.resource_type.clone(),
            scope: batch
                .first()
                .map(|r| r.scope.clone())
                .unwrap_or_else(|| self.scope.clone()),
            targets: batch.iter().map(|r| r.id.clone()).collect(),
            params,
        }
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }
}
