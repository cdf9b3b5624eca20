//! Action execution
//!
//! For each action, in declared order:
//!
//! 1. `plan` every resource (pre-conditions run in dry-run too)
//! 2. split the resources to apply into batches of the action's batch size
//! 3. submit batches concurrently, each with retry
//! 4. when a batch fails as a whole, retry its resources one by one
//!
//! Resources handled by a non-continuable action are skipped by every later
//! action. Outcomes are reported in match order regardless of batch
//! completion order.

use super::gate::{GateRegistry, RateLimit};
use super::{Action, ActionContext, ActionResult, Outcome, Plan, ResourceOutcome};
use crate::cache::CacheLayer;
use crate::cancel::CancelSignal;
use crate::error::{CancellationError, ProviderError};
use crate::provider::{DryRunClient, ProviderClient, Scope, TargetOutcome};
use crate::resource::model::Resource;
use crate::retry::{with_retry, RetryError, RetryPolicy};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Shared by every policy and scope of one engine invocation
pub struct ActionExecutor {
    retry: RetryPolicy,
    gates: GateRegistry,
    concurrency: usize,
    http: reqwest::Client,
}

/// Inputs for one (policy, scope) execution
pub struct ExecutionTarget<'a> {
    pub policy: &'a str,
    pub scope: &'a Scope,
    pub resource_type: &'a str,
    pub client: Arc<dyn ProviderClient>,
    pub cache: Arc<CacheLayer>,
    pub cancel: &'a CancelSignal,
    pub dry_run: bool,
    pub now: DateTime<Utc>,
}

enum BatchError {
    Cancelled,
    Failed(String),
}

impl ActionExecutor {
    pub fn new(retry: RetryPolicy, rate_limit: RateLimit, concurrency: usize) -> Self {
        Self {
            retry,
            gates: GateRegistry::new(rate_limit),
            concurrency: concurrency.max(1),
            http: reqwest::Client::new(),
        }
    }

    /// Context handed to actions; the only route to a mutating call
    pub fn context(&self, target: &ExecutionTarget<'_>) -> Arc<ActionContext> {
        let client: Arc<dyn ProviderClient> = if target.dry_run {
            Arc::new(DryRunClient::new(target.client.clone()))
        } else {
            target.client.clone()
        };
        Arc::new(ActionContext {
            policy: target.policy.to_string(),
            scope: target.scope.clone(),
            resource_type: target.resource_type.to_string(),
            dry_run: target.dry_run,
            now: target.now,
            http: self.http.clone(),
            client,
            gate: self.gates.gate(&target.scope.provider, &target.scope.account),
            cache: target.cache.clone(),
        })
    }

    /// Apply every action in order to the matched set
    pub async fn run(
        &self,
        actions: &[Arc<dyn Action>],
        resources: &[Arc<Resource>],
        target: &ExecutionTarget<'_>,
    ) -> Result<Vec<ActionResult>, CancellationError> {
        let ctx = self.context(target);
        let mut removed: HashMap<String, String> = HashMap::new();
        let mut results = Vec::with_capacity(actions.len());

        for action in actions {
            if target.cancel.is_cancelled() {
                return Err(CancellationError::during("acting"));
            }
            let (live, gone): (Vec<Arc<Resource>>, Vec<Arc<Resource>>) = resources
                .iter()
                .cloned()
                .partition(|r| !removed.contains_key(&r.id));

            let mut result = self.apply(action, &live, &ctx, target.cancel).await?;
            if !gone.is_empty() {
                let mut by_id: HashMap<String, Outcome> = result
                    .outcomes
                    .drain(..)
                    .map(|o| (o.resource_id, o.outcome))
                    .collect();
                for r in &gone {
                    let by = removed.get(&r.id).map(String::as_str).unwrap_or_default();
                    by_id.insert(r.id.clone(), Outcome::skipped(format!("already handled by {}", by)));
                }
                result.outcomes = in_order(resources, by_id);
            }

            if !action.continuable() {
                for o in result.outcomes.iter().filter(|o| o.outcome.is_handled()) {
                    removed
                        .entry(o.resource_id.clone())
                        .or_insert_with(|| action.type_name().to_string());
                }
            }
            results.push(result);
        }
        Ok(results)
    }

    /// Apply one action to a set of resources
    pub async fn apply(
        &self,
        action: &Arc<dyn Action>,
        resources: &[Arc<Resource>],
        ctx: &Arc<ActionContext>,
        cancel: &CancelSignal,
    ) -> Result<ActionResult, CancellationError> {
        let mut outcomes: HashMap<String, Outcome> = HashMap::new();
        let mut to_apply = Vec::new();
        for resource in resources {
            match action.plan(resource, ctx) {
                Plan::Apply => to_apply.push(resource.clone()),
                Plan::Skip(reason) => {
                    tracing::debug!("{} skips {}: {}", action.type_name(), resource.id, reason);
                    outcomes.insert(resource.id.clone(), Outcome::skipped(reason));
                },
            }
        }

        let batch_size = action.batch_size().max(1);
        let batches: Vec<Vec<Arc<Resource>>> = to_apply.chunks(batch_size).map(|c| c.to_vec()).collect();
        let submitted = batches.len();

        let mut completed = stream::iter(batches)
            .map(|batch| self.submit(action, batch, ctx, cancel))
            .buffer_unordered(self.concurrency);
        while let Some(batch_outcomes) = completed.next().await {
            outcomes.extend(batch_outcomes?);
        }
        drop(completed);

        let result = ActionResult {
            action: action.type_name().to_string(),
            outcomes: in_order(resources, outcomes),
        };

        let succeeded = result.count(|o| *o == Outcome::Succeeded);
        if succeeded > 0 {
            // mutated resources must be re-read by later policies
            let scope = resources.first().map(|r| &r.scope).unwrap_or(&ctx.scope);
            ctx.cache().invalidate_resource_type(scope, &ctx.resource_type);
        }
        tracing::info!(
            policy = %ctx.policy,
            scope = %ctx.scope,
            "{}: {} batch(es), {} succeeded, {} dry-run, {} skipped, {} failed",
            action.type_name(),
            submitted,
            succeeded,
            result.count(|o| *o == Outcome::SkippedDryRun),
            result.count(|o| matches!(o, Outcome::Skipped { .. })),
            result.count(Outcome::is_failed)
        );
        Ok(result)
    }

    /// One batch with retry, falling back to per-resource calls
    async fn submit(
        &self,
        action: &Arc<dyn Action>,
        batch: Vec<Arc<Resource>>,
        ctx: &Arc<ActionContext>,
        cancel: &CancelSignal,
    ) -> Result<Vec<(String, Outcome)>, CancellationError> {
        match self.call(action, batch.clone(), ctx, cancel).await {
            Ok(outcomes) => Ok(settle(&batch, outcomes, ctx.dry_run)),
            Err(BatchError::Cancelled) => Err(CancellationError::during("acting")),
            Err(BatchError::Failed(reason)) if batch.len() == 1 => {
                tracing::warn!("{} failed on {}: {}", action.type_name(), batch[0].id, reason);
                Ok(vec![(batch[0].id.clone(), Outcome::failed(reason))])
            },
            Err(BatchError::Failed(reason)) => {
                tracing::warn!(
                    "{} batch of {} failed ({}), retrying resources individually",
                    action.type_name(),
                    batch.len(),
                    reason
                );
                let mut out = Vec::with_capacity(batch.len());
                for resource in &batch {
                    let single = vec![resource.clone()];
                    match self.call(action, single.clone(), ctx, cancel).await {
                        Ok(outcomes) => out.extend(settle(&single, outcomes, ctx.dry_run)),
                        Err(BatchError::Cancelled) => return Err(CancellationError::during("acting")),
                        Err(BatchError::Failed(reason)) => {
                            tracing::warn!("{} failed on {}: {}", action.type_name(), resource.id, reason);
                            out.push((resource.id.clone(), Outcome::failed(reason)));
                        },
                    }
                }
                Ok(out)
            },
        }
    }

    async fn call(
        &self,
        action: &Arc<dyn Action>,
        batch: Vec<Arc<Resource>>,
        ctx: &Arc<ActionContext>,
        cancel: &CancelSignal,
    ) -> Result<Vec<TargetOutcome>, BatchError> {
        let operation = format!("{} on {} resource(s)", action.type_name(), batch.len());
        let batch = Arc::new(batch);
        let result = with_retry(&self.retry, cancel, &operation, || {
            let action = action.clone();
            let ctx = ctx.clone();
            let batch = batch.clone();
            async move { action.process(&batch, &ctx).await }
        })
        .await;

        result.map_err(|e| match e {
            RetryError::Cancelled => BatchError::Cancelled,
            other => BatchError::Failed(
                other
                    .provider_error()
                    .map(ProviderError::to_string)
                    .unwrap_or_else(|| other.to_string()),
            ),
        })
    }
}

/// Map provider per-target outcomes onto the batch
fn settle(batch: &[Arc<Resource>], outcomes: Vec<TargetOutcome>, dry_run: bool) -> Vec<(String, Outcome)> {
    let mut by_id: HashMap<String, Option<String>> =
        outcomes.into_iter().map(|o| (o.id, o.error)).collect();
    batch
        .iter()
        .map(|r| {
            let outcome = match by_id.remove(&r.id) {
                Some(None) if dry_run => Outcome::SkippedDryRun,
                Some(None) => Outcome::Succeeded,
                Some(Some(error)) => Outcome::failed(error),
                None => Outcome::failed("provider reported no outcome"),
            };
            (r.id.clone(), outcome)
        })
        .collect()
}

fn in_order(resources: &[Arc<Resource>], mut by_id: HashMap<String, Outcome>) -> Vec<ResourceOutcome> {
    let mut seen = HashSet::new();
    resources
        .iter()
        .filter(|r| seen.insert(r.id.as_str()))
        .filter_map(|r| {
            by_id.remove(&r.id).map(|outcome| ResourceOutcome {
                resource_id: r.id.clone(),
                outcome,
            })
        })
        .collect()
}
