//! End-to-end policy runs against the in-memory provider
//!
//! Each test drives the engine the way the CLI does: parse a policy
//! document, run it over configured scopes, and inspect the run reports,
//! the provider's recorded calls and the sink output.

use custodian::actions::Outcome;
use custodian::config::{AccountConfig, RetrySettings};
use custodian::error::{CustodianError, ProviderError};
use custodian::event::TriggerEvent;
use custodian::policy::parse_document;
use custodian::provider::{MemoryProvider, ProviderSet, Scope};
use custodian::sink::MemorySink;
use custodian::{Engine, RunConfig, RunState};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn config(regions: &[&str]) -> RunConfig {
    RunConfig {
        accounts: vec![AccountConfig {
            id: "123456789012".to_string(),
            provider: None,
            regions: Vec::new(),
        }],
        regions: regions.iter().map(|r| r.to_string()).collect(),
        max_workers: 1,
        retry: RetrySettings {
            attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            call_timeout_secs: 5,
        },
        ..RunConfig::default()
    }
}

fn engine(config: RunConfig, provider: &Arc<MemoryProvider>) -> (Engine, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(config, ProviderSet::new().with(provider.clone())).with_sink(sink.clone());
    (engine, sink)
}

fn instance(id: &str, state: &str, tags: Value) -> Value {
    json!({
        "InstanceId": id,
        "State": {"Name": state},
        "LaunchTime": "2024-01-01T00:00:00Z",
        "Tags": tags
    })
}

/// Five instances, two of them running without an Owner tag
fn fleet() -> Arc<MemoryProvider> {
    let provider = MemoryProvider::new("aws");
    provider.insert("ec2", instance("i-1", "running", json!([])));
    provider.insert("ec2", instance("i-2", "running", json!([{"Key": "Owner", "Value": "alice"}])));
    provider.insert("ec2", instance("i-3", "stopped", json!([])));
    provider.insert("ec2", instance("i-4", "running", json!([{"Key": "Environment", "Value": "dev"}])));
    provider.insert("ec2", instance("i-5", "terminated", json!([])));
    Arc::new(provider)
}

const UNOWNED: &str = r#"
policies:
  - name: unowned-running
    resource: ec2
    filters:
      - State.Name: running
      - "tag:Owner": absent
    actions:
      - stop
"#;

#[tokio::test]
async fn test_filters_select_matching_resources_and_act_on_them() {
    let provider = fleet();
    let (engine, sink) = engine(config(&["us-east-1"]), &provider);
    let policies = parse_document(UNOWNED).unwrap();

    let reports = engine.run_configured(&policies).await;
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.resource_count, 5);
    assert_eq!(report.matched_ids(), vec!["i-1", "i-4"]);

    let stop = report.action("stop").expect("stop ran");
    assert_eq!(stop.outcome("i-1"), Some(&Outcome::Succeeded));
    assert_eq!(stop.outcome("i-4"), Some(&Outcome::Succeeded));
    assert_eq!(provider.mutation_count(), 1);
    assert_eq!(provider.mutations()[0].targets, vec!["i-1", "i-4"]);
    assert_eq!(sink.reports().len(), 1);
}

#[tokio::test]
async fn test_dry_run_never_mutates() {
    let provider = fleet();
    let mut config = config(&["us-east-1"]);
    config.dryrun = true;
    let (engine, _) = engine(config, &provider);

    let reports = engine.run_configured(&parse_document(UNOWNED).unwrap()).await;
    let report = &reports[0];
    assert!(report.dry_run);
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.action("stop").unwrap().count(|o| *o == Outcome::SkippedDryRun), 2);
    assert_eq!(report.metrics().actions["stop"].skipped_dry_run, 2);
    assert_eq!(provider.mutation_count(), 0);
}

#[tokio::test]
async fn test_failed_batch_falls_back_to_single_resources() {
    let provider = MemoryProvider::new("aws");
    for i in 0..10 {
        provider.insert("ec2", instance(&format!("i-{}", i), "running", json!([])));
    }
    provider.fail_target("i-5");
    let provider = Arc::new(provider);
    let (engine, _) = engine(config(&["us-east-1"]), &provider);
    let policies = parse_document("policies:\n  - name: stop-all\n    resource: ec2\n    actions: [stop]\n").unwrap();

    let reports = engine.run_configured(&policies).await;
    let report = &reports[0];
    assert_eq!(report.state, RunState::Done);
    let metrics = report.metrics();
    assert_eq!(metrics.actions["stop"].succeeded, 9);
    assert_eq!(metrics.actions["stop"].failed, 1);
    assert!(report.action("stop").unwrap().outcome("i-5").unwrap().is_failed());
    assert_eq!(report.action_errors().len(), 1);
    // one batch call, then one call per resource
    assert_eq!(provider.mutation_count(), 11);
}

#[tokio::test]
async fn test_mark_for_op_is_idempotent_across_runs() {
    let provider = fleet();
    let (engine, _) = engine(config(&["us-east-1"]), &provider);
    let policies = parse_document(
        r#"
policies:
  - name: mark-unowned
    resource: ec2
    filters:
      - "tag:Owner": absent
      - State.Name: running
    actions:
      - type: mark-for-op
        op: stop
        days: 4
"#,
    )
    .unwrap();

    let first = engine.run_configured(&policies).await;
    let marked = first[0].action("mark-for-op").unwrap();
    assert_eq!(marked.count(|o| *o == Outcome::Succeeded), 2);
    let mutations = provider.mutation_count();

    let second = engine.run_configured(&policies).await;
    let again = second[0].action("mark-for-op").unwrap();
    assert_eq!(again.count(|o| matches!(o, Outcome::Skipped { .. })), 2);
    assert_eq!(provider.mutation_count(), mutations);
}

#[tokio::test]
async fn test_non_continuable_action_stops_later_actions() {
    let provider = fleet();
    let (engine, _) = engine(config(&["us-east-1"]), &provider);
    let policies = parse_document(
        r#"
policies:
  - name: terminate-then-tag
    resource: ec2
    filters:
      - State.Name: stopped
    actions:
      - terminate
      - type: tag
        key: Reaped
        value: "yes"
"#,
    )
    .unwrap();

    let reports = engine.run_configured(&policies).await;
    let report = &reports[0];
    assert_eq!(report.action("terminate").unwrap().outcome("i-3"), Some(&Outcome::Succeeded));
    assert!(matches!(
        report.action("tag").unwrap().outcome("i-3"),
        Some(Outcome::Skipped { .. })
    ));
}

#[tokio::test]
async fn test_transient_listing_failures_are_retried() {
    let provider = fleet();
    provider.fail_next_lists(
        "ec2",
        vec![
            ProviderError::Transient("Throttling".into()),
            ProviderError::Transient("Throttling".into()),
        ],
    );
    let (engine, _) = engine(config(&["us-east-1"]), &provider);

    let reports = engine.run_configured(&parse_document(UNOWNED).unwrap()).await;
    assert_eq!(reports[0].state, RunState::Done);
    assert_eq!(reports[0].resource_count, 5);
}

#[tokio::test]
async fn test_resolution_failure_is_scoped_to_one_region() {
    let provider = MemoryProvider::new("aws");
    let east = Scope::new("aws", "123456789012", "us-east-1");
    let west = Scope::new("aws", "123456789012", "us-west-2");
    provider.insert_scoped("ec2", &east, instance("i-east", "running", json!([])));
    provider.insert_scoped("ec2", &west, instance("i-west", "running", json!([])));
    // The first listing (us-east-1, max_workers = 1) fails for good
    provider.fail_next_lists("ec2", vec![ProviderError::Permanent("UnauthorizedOperation".into())]);
    let provider = Arc::new(provider);
    let (engine, sink) = engine(config(&["us-east-1", "us-west-2"]), &provider);

    let reports = engine.run_configured(&parse_document(UNOWNED).unwrap()).await;
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].scope, east);
    assert_eq!(reports[0].state, RunState::Failed);
    assert!(matches!(reports[0].error, Some(CustodianError::Resolution(_))));
    assert_eq!(reports[1].scope, west);
    assert_eq!(reports[1].state, RunState::Done);
    assert_eq!(reports[1].matched_ids(), vec!["i-west"]);
    assert_eq!(sink.reports().len(), 2);
}

#[tokio::test]
async fn test_cancellation_fails_in_flight_runs() {
    let provider = MemoryProvider::new("aws").with_list_delay(Duration::from_millis(500));
    provider.insert("ec2", instance("i-1", "running", json!([])));
    let provider = Arc::new(provider);
    let (engine, _) = engine(config(&["us-east-1"]), &provider);

    let _timer = engine.cancel_signal().cancel_after(Duration::from_millis(20));
    let reports = engine.run_configured(&parse_document(UNOWNED).unwrap()).await;
    assert_eq!(reports[0].state, RunState::Failed);
    assert!(matches!(reports[0].error, Some(CustodianError::Cancelled(_))));
    assert!(reports[0].actions.is_empty());
    assert_eq!(provider.mutation_count(), 0);
}

#[test]
fn test_invalid_document_reports_every_issue() {
    let err = parse_document(
        r#"
policies:
  - name: bad-filters
    resource: ec2
    filters:
      - type: value
        key: State.Name
        op: roughly
        value: running
    actions:
      - explode
  - name: bad-resource
    resource: ec3
  - resource: ec2
    colour: blue
"#,
    )
    .unwrap_err();

    let locations: Vec<&str> = err.issues.iter().map(|i| i.location.as_str()).collect();
    assert!(locations.contains(&"policies[0].filters[0].op"), "{:?}", locations);
    assert!(locations.contains(&"policies[0].actions[0]"), "{:?}", locations);
    assert!(locations.contains(&"policies[1].resource"), "{:?}", locations);
    assert!(locations.contains(&"policies[2].colour"), "{:?}", locations);
    assert!(locations.contains(&"policies[2].name"), "{:?}", locations);
}

#[tokio::test]
async fn test_unloadable_external_data_fails_the_run() {
    let provider = fleet();
    let (engine, _) = engine(config(&["us-east-1"]), &provider);
    let policies = parse_document(
        r#"
policies:
  - name: allow-listed
    resource: ec2
    filters:
      - type: value
        key: InstanceId
        op: in
        value_from:
          url: file:///nonexistent/custodian/allowed.json
          format: json
"#,
    )
    .unwrap();

    let reports = engine.run_configured(&policies).await;
    assert_eq!(reports[0].state, RunState::Failed);
    assert!(matches!(reports[0].error, Some(CustodianError::Configuration(_))));
    assert!(!reports[0].transitions.contains(&RunState::Filtering));
}

#[tokio::test]
async fn test_max_resources_percent_skips_actions() {
    let provider = fleet();
    let (engine, _) = engine(config(&["us-east-1"]), &provider);
    let policies = parse_document(
        "policies:\n  - name: capped\n    resource: ec2\n    filters:\n      - State.Name: running\n    actions: [stop]\n    max-resources-percent: 10\n",
    )
    .unwrap();

    let reports = engine.run_configured(&policies).await;
    let report = &reports[0];
    assert_eq!(report.state, RunState::Done);
    assert!(report.limit_exceeded.is_some());
    assert!(report.actions.is_empty());
    assert_eq!(provider.mutation_count(), 0);
}

#[tokio::test]
async fn test_push_runs_event_policies_on_event_resources() {
    let provider = fleet();
    let (engine, _) = engine(config(&["us-east-1"]), &provider);
    let policies = parse_document(
        r#"
policies:
  - name: on-launch
    resource: ec2
    mode:
      type: event
      events: [RunInstances]
    filters:
      - "tag:Owner": absent
    actions: [stop]
  - name: nightly
    resource: ec2
    actions: [stop]
"#,
    )
    .unwrap();
    let event = TriggerEvent::from_value(json!({
        "account": "123456789012",
        "region": "us-east-1",
        "name": "RunInstances",
        "resource_ids": ["i-1", "i-2"]
    }))
    .unwrap();

    let reports = engine.run_push(&policies, &event).await;
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.policy, "on-launch");
    assert_eq!(report.mode, "push");
    assert_eq!(report.matched_ids(), vec!["i-1"]);
    assert_eq!(provider.mutations()[0].targets, vec!["i-1"]);
}

#[tokio::test]
async fn test_json_sink_layout() {
    let provider = fleet();
    let output = tempfile::tempdir().unwrap();
    let mut config = config(&["us-east-1"]);
    config.output_dir = Some(output.path().to_path_buf());
    let engine = Engine::new(config, ProviderSet::new().with(provider.clone()));

    let reports = engine.run_configured(&parse_document(UNOWNED).unwrap()).await;
    assert_eq!(reports[0].state, RunState::Done);

    let dir = output.path().join("unowned-running").join("123456789012").join("us-east-1");
    let resources: Value =
        serde_json::from_str(&std::fs::read_to_string(dir.join("resources.json")).unwrap()).unwrap();
    let metrics: Value = serde_json::from_str(&std::fs::read_to_string(dir.join("metrics.json")).unwrap()).unwrap();

    let records = resources.as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["resource_id"], "i-1");
    assert_eq!(records[0]["policy"], "unowned-running");
    assert_eq!(metrics["matched"], 2);
    assert_eq!(metrics["resource_count"], 5);
    assert_eq!(metrics["state"], "DONE");
}
