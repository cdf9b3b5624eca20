//! Engine
//!
//! Entry points for one invocation. Pull mode runs every pull/periodic
//! policy in every matching scope on a pool of `max_workers` runs; push mode
//! runs the event policies a trigger event concerns. Both share one cache
//! layer, one action executor (and so one submission gate per account) and
//! one cancellation signal.

use super::runtime::{push_input, PolicyRunner, RunInput, RunReport};
use super::{Policy, PolicyCollection};
use crate::actions::ActionExecutor;
use crate::cache::CacheLayer;
use crate::cancel::CancelSignal;
use crate::config::RunConfig;
use crate::error::ConfigurationError;
use crate::event::TriggerEvent;
use crate::filters::{DefaultDataSource, ExternalDataSource};
use crate::provider::{ProviderClient, ProviderSet, Scope};
use crate::resource::effective_scope;
use crate::sink::{FanoutSink, JsonDirSink, LogSink, ResultSink};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub struct Engine {
    config: RunConfig,
    providers: ProviderSet,
    sink: Arc<dyn ResultSink>,
    data_source: Arc<dyn ExternalDataSource>,
    cancel: CancelSignal,
    cache: Arc<CacheLayer>,
    executor: Arc<ActionExecutor>,
}

/// One scheduled run
struct Job<'a> {
    policy: &'a Policy,
    scope: Scope,
    client: Option<Arc<dyn ProviderClient>>,
    input: RunInput,
}

impl Engine {
    /// Engine logging every report, and writing JSON results when
    /// `output_dir` is set
    pub fn new(config: RunConfig, providers: ProviderSet) -> Self {
        let mut sink = FanoutSink::new().with(Arc::new(LogSink));
        if let Some(dir) = &config.output_dir {
            sink = sink.with(Arc::new(JsonDirSink::new(dir.clone())));
        }
        let executor = ActionExecutor::new(
            config.retry_policy(),
            config.rate_limit,
            config.action_concurrency,
        );
        Self {
            cache: Arc::new(config.cache_layer()),
            executor: Arc::new(executor),
            sink: Arc::new(sink),
            data_source: Arc::new(DefaultDataSource::new()),
            cancel: CancelSignal::new(),
            providers,
            config,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_data_source(mut self, data_source: Arc<dyn ExternalDataSource>) -> Self {
        self.data_source = data_source;
        self
    }

    pub fn with_cache(mut self, cache: Arc<CacheLayer>) -> Self {
        self.cache = cache;
        self
    }

    /// Signal that aborts every run of this engine
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run pull-mode policies over the configured scopes
    pub async fn run_configured(&self, policies: &PolicyCollection) -> Vec<RunReport> {
        let scopes = self.config.scopes();
        self.run_pull(policies, &scopes).await
    }

    /// Run every pull/periodic policy in every scope of its provider.
    ///
    /// Global resource types run once per account, not once per region.
    pub async fn run_pull(&self, policies: &PolicyCollection, scopes: &[Scope]) -> Vec<RunReport> {
        let mut seen: HashSet<(String, Scope)> = HashSet::new();
        let mut jobs = Vec::new();
        for policy in policies {
            if policy.mode.is_push() {
                tracing::debug!("Skipping {}: {} mode runs from events", policy.name, policy.mode.name());
                continue;
            }
            for scope in scopes.iter().filter(|s| s.provider == policy.provider()) {
                let scope = effective_scope(policy.resource, scope);
                if !seen.insert((policy.name.clone(), scope.clone())) {
                    continue;
                }
                jobs.push(Job {
                    policy,
                    client: self.providers.get(&scope.provider),
                    scope,
                    input: RunInput::Pull,
                });
            }
        }
        tracing::info!("Running {} policy run(s) over {} scope(s)", jobs.len(), scopes.len());
        self.execute(jobs).await
    }

    /// Run the event-mode policies a trigger event concerns
    pub async fn run_push(&self, policies: &PolicyCollection, event: &TriggerEvent) -> Vec<RunReport> {
        if event.is_error() && self.config.skip_error_events {
            tracing::info!(
                "Ignoring event {} with error code {}",
                event.name.as_deref().unwrap_or("(unnamed)"),
                event.error_code.as_deref().unwrap_or_default()
            );
            return Vec::new();
        }

        let jobs: Vec<Job<'_>> = policies
            .iter()
            .filter(|p| p.mode.accepts_event(event.name.as_deref()))
            .filter(|p| event.concerns(p.resource))
            .map(|policy| {
                let scope = event.scope(policy.provider());
                Job {
                    policy,
                    client: self.providers.get(&scope.provider),
                    input: push_input(&policy.mode, event),
                    scope,
                }
            })
            .collect();
        if jobs.is_empty() {
            tracing::info!("No policy reacts to event {}", event.name.as_deref().unwrap_or("(unnamed)"));
        }
        self.execute(jobs).await
    }

    async fn execute(&self, jobs: Vec<Job<'_>>) -> Vec<RunReport> {
        let timer = self
            .config
            .run_timeout_secs
            .map(|secs| self.cancel.cancel_after(Duration::from_secs(secs)));

        let reports: Vec<RunReport> = stream::iter(jobs)
            .map(|job| self.run_job(job))
            .buffered(self.config.max_workers.max(1))
            .collect()
            .await;

        if let Some(timer) = timer {
            timer.abort();
        }
        let stats = self.cache.stats();
        tracing::debug!(
            "Cache: {} fill(s), {} hit(s), {} store hit(s)",
            stats.fills,
            stats.hits,
            stats.store_hits
        );
        self.cache.clear();
        reports
    }

    async fn run_job(&self, job: Job<'_>) -> RunReport {
        let Some(client) = job.client else {
            let error = ConfigurationError::single(
                "provider",
                format!("no client for provider '{}'", job.scope.provider),
            );
            let report = RunReport::rejected(job.policy, &job.scope, job.input.mode(), error.into());
            if let Err(e) = self.sink.record(&report) {
                tracing::error!("Failed to record results: {:#}", e);
            }
            return report;
        };
        let runner = PolicyRunner {
            client,
            cache: self.cache.clone(),
            executor: self.executor.clone(),
            data_source: self.data_source.clone(),
            sink: self.sink.clone(),
            retry: self.config.retry_policy(),
            cancel: self.cancel.clone(),
            filter_concurrency: self.config.filter_concurrency,
            dry_run: self.config.dryrun,
        };
        runner.run(job.policy, &job.scope, job.input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{parse_document, RunState};
    use crate::provider::MemoryProvider;
    use crate::sink::MemorySink;
    use serde_json::json;

    fn engine(provider: Arc<MemoryProvider>, sink: Arc<MemorySink>) -> Engine {
        let config = RunConfig {
            max_workers: 2,
            ..RunConfig::default()
        };
        Engine::new(config, ProviderSet::new().with(provider)).with_sink(sink)
    }

    #[tokio::test]
    async fn test_pull_fans_out_over_scopes() {
        let provider = Arc::new(MemoryProvider::new("aws"));
        provider.insert("ec2", json!({"InstanceId": "i-1"}));
        provider.insert("cloudtrail", json!({"Name": "main"}));
        let sink = Arc::new(MemorySink::new());
        let engine = engine(provider.clone(), sink.clone());
        let policies = parse_document(
            "policies:\n  - name: instances\n    resource: ec2\n  - name: trails\n    resource: cloudtrail\n  - name: buckets\n    resource: gcp.bucket\n",
        )
        .unwrap();
        let scopes = vec![
            Scope::new("aws", "1", "us-east-1"),
            Scope::new("aws", "1", "eu-west-1"),
        ];

        let reports = engine.run_pull(&policies, &scopes).await;
        // ec2 in both regions, cloudtrail once (global), nothing for gcp
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.state == RunState::Done));
        assert_eq!(provider.list_calls("cloudtrail"), 1);
        assert_eq!(sink.reports().len(), 3);
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn test_missing_client_fails_the_run() {
        let sink = Arc::new(MemorySink::new());
        let engine = engine(Arc::new(MemoryProvider::new("aws")), sink);
        let policies = parse_document("policies:\n  - name: buckets\n    resource: gcp.bucket\n").unwrap();

        let reports = engine.run_pull(&policies, &[Scope::new("gcp", "proj", "us-central1")]).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].state, RunState::Failed);
    }

    #[tokio::test]
    async fn test_push_skips_error_events() {
        let provider = Arc::new(MemoryProvider::new("aws"));
        let engine = engine(provider, Arc::new(MemorySink::new()));
        let policies = parse_document("policies:\n  - name: p\n    resource: ec2\n    mode: event\n").unwrap();
        let event = TriggerEvent::from_value(json!({
            "account": "1", "region": "us-east-1", "error_code": "AccessDenied", "resource_ids": ["i-1"]
        }))
        .unwrap();
        assert!(engine.run_push(&policies, &event).await.is_empty());
    }
}
