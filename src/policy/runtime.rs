//! Policy run state machine
//!
//! One run covers one policy in one scope:
//!
//! ```text
//! INIT → RESOLVING → FILTERING → ACTING → REPORTING → DONE
//!   └────────┴───────────┴──────────┴──────────→ FAILED
//! ```
//!
//! INIT binds variables and prepares filters (external data loads), so a bad
//! `value_from` fails the run there. RESOLVING fails on resolution errors.
//! ACTING never fails as a whole: per-resource failures land in the report.
//! Cancellation fails the run from any stage.

use super::{ExecutionMode, Policy};
use crate::actions::{ActionExecutor, ActionResult, ExecutionTarget, Outcome};
use crate::cache::CacheLayer;
use crate::cancel::CancelSignal;
use crate::error::{ActionError, CancellationError, CustodianError, FilterEvaluationError, Result};
use crate::filters::{ExternalDataSource, FilterContext};
use crate::provider::{ProviderClient, Scope};
use crate::resource::model::Resource;
use crate::resource::resolver::normalize;
use crate::resource::{effective_scope, Resolver};
use crate::retry::RetryPolicy;
use crate::sink::ResultSink;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// States and report
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Init,
    Resolving,
    Filtering,
    Acting,
    Reporting,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Resolving => "RESOLVING",
            Self::Filtering => "FILTERING",
            Self::Acting => "ACTING",
            Self::Reporting => "REPORTING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// What a run starts from
#[derive(Debug, Clone)]
pub enum RunInput {
    /// List the policy's resource type in the scope
    Pull,
    /// Only what a trigger event references
    Push {
        /// Raw records carried by the event
        records: Vec<Value>,
        ids: Vec<String>,
        event: Arc<Value>,
    },
}

impl RunInput {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push { .. } => "push",
        }
    }
}

/// Outcome of one (policy, scope) run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub execution_id: Uuid,
    pub policy: String,
    pub resource_type: String,
    pub scope: Scope,
    /// `pull` or `push`
    pub mode: &'static str,
    pub state: RunState,
    /// Every state entered, in order
    pub transitions: Vec<RunState>,
    pub dry_run: bool,
    /// Resources resolved before filtering
    pub resource_count: usize,
    /// Resources that passed the filters, in resolution order
    pub matched: Vec<Arc<Resource>>,
    pub actions: Vec<ActionResult>,
    pub filter_errors: Vec<FilterEvaluationError>,
    /// Set when the match set was over the policy's limit and actions were skipped
    pub limit_exceeded: Option<String>,
    /// Fatal error that sent the run to FAILED
    pub error: Option<CustodianError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-action counters in [`RunMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActionCounts {
    pub succeeded: usize,
    pub skipped_dry_run: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Summary numbers of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    pub execution_id: Uuid,
    pub policy: String,
    pub resource_type: String,
    pub scope: Scope,
    pub mode: &'static str,
    pub state: RunState,
    pub dry_run: bool,
    pub resource_count: usize,
    pub matched: usize,
    pub filter_errors: usize,
    pub action_failures: usize,
    pub actions: BTreeMap<String, ActionCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_exceeded: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: i64,
}

impl RunReport {
    fn new(policy: &Policy, scope: &Scope, mode: &'static str, dry_run: bool, now: DateTime<Utc>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            policy: policy.name.clone(),
            resource_type: policy.resource_type().to_string(),
            scope: scope.clone(),
            mode,
            state: RunState::Init,
            transitions: vec![RunState::Init],
            dry_run,
            resource_count: 0,
            matched: Vec::new(),
            actions: Vec::new(),
            filter_errors: Vec::new(),
            limit_exceeded: None,
            error: None,
            started_at: now,
            finished_at: None,
        }
    }

    /// Report of a run that could not start
    pub(crate) fn rejected(policy: &Policy, scope: &Scope, mode: &'static str, error: CustodianError) -> Self {
        let now = Utc::now();
        let mut report = Self::new(policy, scope, mode, policy.options.dry_run, now);
        tracing::error!(policy = %policy.name, scope = %scope, "Run failed: {}", error);
        report.error = Some(error);
        report.enter(RunState::Failed);
        report.finished_at = Some(now);
        report
    }

    fn enter(&mut self, state: RunState) {
        tracing::info!(
            policy = %self.policy,
            scope = %self.scope,
            "{} -> {}",
            self.state,
            state
        );
        self.state = state;
        self.transitions.push(state);
    }

    pub fn is_done(&self) -> bool {
        self.state == RunState::Done
    }

    pub fn matched_ids(&self) -> Vec<&str> {
        self.matched.iter().map(|r| r.id.as_str()).collect()
    }

    /// Action named `name`, if it ran
    pub fn action(&self, name: &str) -> Option<&ActionResult> {
        self.actions.iter().find(|a| a.action == name)
    }

    /// Every resource-level action failure
    pub fn action_errors(&self) -> Vec<ActionError> {
        self.actions.iter().flat_map(|a| a.errors()).collect()
    }

    pub fn metrics(&self) -> RunMetrics {
        let mut actions: BTreeMap<String, ActionCounts> = BTreeMap::new();
        for result in &self.actions {
            let counts = actions.entry(result.action.clone()).or_default();
            for o in &result.outcomes {
                match o.outcome {
                    Outcome::Succeeded => counts.succeeded += 1,
                    Outcome::SkippedDryRun => counts.skipped_dry_run += 1,
                    Outcome::Skipped { .. } => counts.skipped += 1,
                    Outcome::Failed { .. } => counts.failed += 1,
                }
            }
        }
        let finished = self.finished_at.unwrap_or_else(Utc::now);
        RunMetrics {
            execution_id: self.execution_id,
            policy: self.policy.clone(),
            resource_type: self.resource_type.clone(),
            scope: self.scope.clone(),
            mode: self.mode,
            state: self.state,
            dry_run: self.dry_run,
            resource_count: self.resource_count,
            matched: self.matched.len(),
            filter_errors: self.filter_errors.len(),
            action_failures: self.action_errors().len(),
            actions,
            limit_exceeded: self.limit_exceeded.clone(),
            error: self.error.as_ref().map(|e| e.to_string()),
            duration_ms: (finished - self.started_at).num_milliseconds(),
        }
    }

    /// One record per matched resource with every action's outcome on it
    pub fn resource_records(&self) -> Vec<Value> {
        let timestamp = self.finished_at.unwrap_or_else(Utc::now).to_rfc3339();
        self.matched
            .iter()
            .map(|resource| {
                let outcomes: Vec<Value> = self
                    .actions
                    .iter()
                    .filter_map(|a| {
                        a.outcome(&resource.id).map(|o| {
                            let mut entry = serde_json::to_value(o).unwrap_or(Value::Null);
                            if let Value::Object(map) = &mut entry {
                                map.insert("action".to_string(), Value::String(a.action.clone()));
                            }
                            entry
                        })
                    })
                    .collect();
                json!({
                    "policy": self.policy,
                    "scope": self.scope,
                    "resource_type": self.resource_type,
                    "resource_id": resource.id,
                    "resource": resource.data,
                    "actions": outcomes,
                    "timestamp": timestamp,
                })
            })
            .collect()
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Everything a run needs besides the policy and scope
pub struct PolicyRunner {
    pub client: Arc<dyn ProviderClient>,
    pub cache: Arc<CacheLayer>,
    pub executor: Arc<ActionExecutor>,
    pub data_source: Arc<dyn ExternalDataSource>,
    pub sink: Arc<dyn ResultSink>,
    pub retry: RetryPolicy,
    pub cancel: CancelSignal,
    pub filter_concurrency: usize,
    pub dry_run: bool,
}

impl PolicyRunner {
    /// Drive one run to DONE or FAILED. Never returns an error: fatal errors
    /// are recorded on the report.
    pub async fn run(&self, policy: &Policy, scope: &Scope, input: RunInput) -> RunReport {
        let now = Utc::now();
        let dry_run = self.dry_run || policy.options.dry_run;
        let mut report = RunReport::new(policy, scope, input.mode(), dry_run, now);

        if let Err(error) = self.execute(policy, scope, input, now, &mut report).await {
            tracing::error!(policy = %policy.name, scope = %scope, "Run failed: {}", error);
            report.error = Some(error);
            report.enter(RunState::Failed);
            report.finished_at = Some(Utc::now());
            self.report(&report);
            return report;
        }
        report
    }

    async fn execute(
        &self,
        policy: &Policy,
        scope: &Scope,
        input: RunInput,
        now: DateTime<Utc>,
        report: &mut RunReport,
    ) -> Result<()> {
        // INIT
        self.check_cancelled("init")?;
        let policy = policy.bind(scope, now)?;
        let def = policy.resource;
        let scope = effective_scope(def, scope);
        let resolver = Resolver::new(
            self.client.clone(),
            self.cache.clone(),
            self.retry.clone(),
            self.cancel.clone(),
        );
        let event = match &input {
            RunInput::Push { event, .. } => Some(event.clone()),
            RunInput::Pull => None,
        };
        let ctx = FilterContext::new(&policy.name, scope.clone(), resolver.clone(), self.data_source.clone())
            .with_event(event)
            .with_now(now);
        if let Some(filters) = &policy.filters {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CancellationError::during("init").into()),
                prepared = filters.prepare(&ctx) => prepared?,
            }
        }

        // RESOLVING
        report.enter(RunState::Resolving);
        let resources = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CancellationError::during("resolving").into()),
            resolved = self.resolve(&policy, &scope, &resolver, input) => resolved?,
        };
        report.resource_count = resources.len();

        // FILTERING
        report.enter(RunState::Filtering);
        let matched = match &policy.filters {
            None => resources,
            Some(filters) => {
                let evaluation = stream::iter(resources.iter())
                    .map(|r| filters.evaluate(r.as_ref(), &ctx))
                    .buffered(self.filter_concurrency.max(1))
                    .collect::<Vec<bool>>();
                let verdicts = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(CancellationError::during("filtering").into()),
                    verdicts = evaluation => verdicts,
                };
                resources
                    .iter()
                    .zip(verdicts)
                    .filter_map(|(r, keep)| keep.then(|| r.clone()))
                    .collect()
            },
        };
        report.filter_errors = ctx.errors();
        report.matched = matched;
        tracing::info!(
            policy = %policy.name,
            scope = %scope,
            "{} of {} {} matched",
            report.matched.len(),
            report.resource_count,
            def.key
        );

        // ACTING
        match policy.options.limit_exceeded(report.matched.len(), report.resource_count) {
            Some(reason) => {
                tracing::warn!(policy = %policy.name, scope = %scope, "Skipping actions: {}", reason);
                report.limit_exceeded = Some(reason);
            },
            None => {
                report.enter(RunState::Acting);
                let target = ExecutionTarget {
                    policy: &policy.name,
                    scope: &scope,
                    resource_type: &def.key,
                    client: self.client.clone(),
                    cache: self.cache.clone(),
                    cancel: &self.cancel,
                    dry_run: report.dry_run,
                    now,
                };
                report.actions = self
                    .executor
                    .run(&policy.actions, &report.matched, &target)
                    .await?;
            },
        }

        // REPORTING
        report.enter(RunState::Reporting);
        report.finished_at = Some(Utc::now());
        self.report(report);
        report.enter(RunState::Done);
        Ok(())
    }

    async fn resolve(
        &self,
        policy: &Policy,
        scope: &Scope,
        resolver: &Resolver,
        input: RunInput,
    ) -> Result<Vec<Arc<Resource>>> {
        let rtype = policy.resource_type();
        match input {
            RunInput::Pull => Ok(resolver.resolve(rtype, scope).await?.resources().to_vec()),
            RunInput::Push { records, .. } if !records.is_empty() => Ok(records
                .into_iter()
                .filter_map(|raw| normalize(policy.resource, scope, raw))
                .map(Arc::new)
                .collect()),
            RunInput::Push { ids, .. } => match ids.as_slice() {
                [] => {
                    tracing::warn!(policy = %policy.name, "Event references no {} resources", rtype);
                    Ok(Vec::new())
                },
                [id] => Ok(resolver.describe(rtype, scope, id).await?.into_iter().collect()),
                ids => Ok(resolver.resolve_ids(rtype, scope, ids).await?.resources().to_vec()),
            },
        }
    }

    fn check_cancelled(&self, stage: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CancellationError::during(stage).into());
        }
        Ok(())
    }

    fn report(&self, report: &RunReport) {
        if let Err(e) = self.sink.record(report) {
            tracing::error!(policy = %report.policy, scope = %report.scope, "Failed to record results: {:#}", e);
        }
    }
}

/// Input for a push-mode run of `mode` from an event
pub fn push_input(mode: &ExecutionMode, event: &crate::event::TriggerEvent) -> RunInput {
    RunInput::Push {
        records: event.resources.clone(),
        ids: event.resource_ids_for(mode),
        event: Arc::new(event.payload().clone()),
    }
}
