//! Webhook notifications
//!
//! Posts one JSON message per batch of matched resources:
//!
//! ```yaml
//! - type: notify
//!   url: https://hooks.example.com/custodian
//!   subject: "{policy_name}: {count} resource(s) in {account_id}/{region}"
//! ```
//!
//! Messages are sent through [`ActionContext::post_json`], so dry-run
//! suppresses them along with provider mutations.

use super::{Action, ActionContext};
use crate::error::{ConfigIssue, ProviderError};
use crate::provider::TargetOutcome;
use crate::resource::model::Resource;
use crate::resource::registry::ResourceDef;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

const DEFAULT_SUBJECT: &str = "{policy_name}: {count} resource(s) in {account_id}/{region}";
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug)]
pub struct NotifyAction {
    url: url::Url,
    subject: String,
    batch_size: usize,
}

impl NotifyAction {
    pub fn from_options(
        options: &Map<String, Value>,
        location: &str,
        _resource: &ResourceDef,
    ) -> Result<Self, Vec<ConfigIssue>> {
        let url = match options.get("url").and_then(|v| v.as_str()) {
            None => {
                return Err(vec![ConfigIssue::new(
                    format!("{}.url", location),
                    "missing required field",
                )])
            },
            Some(raw) => url::Url::parse(raw).map_err(|e| {
                vec![ConfigIssue::new(
                    format!("{}.url", location),
                    format!("invalid url '{}': {}", raw, e),
                )]
            })?,
        };
        if !matches!(url.scheme(), "http" | "https") {
            return Err(vec![ConfigIssue::new(
                format!("{}.url", location),
                format!("unsupported scheme '{}'", url.scheme()),
            )]);
        }
        Ok(Self {
            url,
            subject: options
                .get("subject")
                .and_then(|v| v.as_str())
                .unwrap_or(DEFAULT_SUBJECT)
                .to_string(),
            batch_size: options
                .get("batch_size")
                .and_then(|v| v.as_u64())
                .filter(|n| *n > 0)
                .map_or(500, |n| n as usize),
        })
    }

    fn subject(&self, ctx: &ActionContext, count: usize) -> String {
        self.subject
            .replace("{policy_name}", &ctx.policy)
            .replace("{account_id}", &ctx.scope.account)
            .replace("{region}", &ctx.scope.region)
            .replace("{count}", &count.to_string())
    }
}

#[async_trait]
impl Action for NotifyAction {
    fn type_name(&self) -> &str {
        "notify"
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn process(
        &self,
        batch: &[Arc<Resource>],
        ctx: &ActionContext,
    ) -> Result<Vec<TargetOutcome>, ProviderError> {
        let ids: Vec<&str> = batch.iter().map(|r| r.id.as_str()).collect();
        let ok = || -> Vec<TargetOutcome> { batch.iter().map(|r| TargetOutcome::ok(&r.id)).collect() };

        let message = json!({
            "subject": self.subject(ctx, ids.len()),
            "policy": ctx.policy,
            "provider": ctx.scope.provider,
            "account": ctx.scope.account,
            "region": ctx.scope.region,
            "resource_type": ctx.resource_type,
            "resources": ids,
            "timestamp": ctx.now.to_rfc3339(),
        });

        let Some(response) = ctx.post_json(&self.url, &message).await? else {
            return Ok(ok());
        };

        let status = response.status();
        if status.is_success() {
            return Ok(ok());
        }
        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(MAX_ERROR_BODY).collect();
        let message = format!("webhook returned {}: {}", status, body);
        if status.as_u16() == 429 || status.is_server_error() {
            Err(ProviderError::Transient(message))
        } else {
            Err(ProviderError::Permanent(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::executor::{ActionExecutor, ExecutionTarget};
    use crate::actions::{Outcome, RateLimit};
    use crate::cache::CacheLayer;
    use crate::cancel::CancelSignal;
    use crate::provider::{MemoryProvider, Scope};
    use crate::resource::get_resource;
    use crate::retry::RetryPolicy;
    use chrono::Utc;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Posts without looking at the dry-run flag itself
    #[derive(Debug)]
    struct RawPost(url::Url);

    #[async_trait]
    impl Action for RawPost {
        fn type_name(&self) -> &str {
            "raw-post"
        }

        async fn process(
            &self,
            batch: &[Arc<Resource>],
            ctx: &ActionContext,
        ) -> Result<Vec<TargetOutcome>, ProviderError> {
            ctx.post_json(&self.0, &json!({"count": batch.len()})).await?;
            Ok(batch.iter().map(|r| TargetOutcome::ok(&r.id)).collect())
        }
    }

    async fn notify(url: &str, dry_run: bool) -> Vec<Outcome> {
        let ec2 = get_resource("ec2").unwrap();
        let options = json!({"url": url, "subject": "{policy_name} found {count}"});
        let action: Arc<dyn Action> =
            Arc::new(NotifyAction::from_options(options.as_object().unwrap(), "a", ec2).unwrap());
        run_action(action, dry_run).await
    }

    async fn run_action(action: Arc<dyn Action>, dry_run: bool) -> Vec<Outcome> {
        let scope = Scope::new("aws", "123", "us-east-1");
        let resources: Vec<Arc<Resource>> = ["i-1", "i-2"]
            .iter()
            .map(|id| Arc::new(Resource::new(id, "aws.ec2", scope.clone(), json!({"InstanceId": id}))))
            .collect();
        let cancel = CancelSignal::new();
        let target = ExecutionTarget {
            policy: "idle-instances",
            scope: &scope,
            resource_type: "aws.ec2",
            client: Arc::new(MemoryProvider::new("aws")),
            cache: Arc::new(CacheLayer::new()),
            cancel: &cancel,
            dry_run,
            now: Utc::now(),
        };
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            call_timeout: Duration::from_secs(5),
        };
        let executor = ActionExecutor::new(retry, RateLimit::default(), 1);
        let results = executor.run(&[action], &resources, &target).await.unwrap();
        results[0].outcomes.iter().map(|o| o.outcome.clone()).collect()
    }

    #[tokio::test]
    async fn test_posts_one_message_per_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(json!({
                "subject": "idle-instances found 2",
                "resources": ["i-1", "i-2"]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let outcomes = notify(&format!("{}/hook", server.uri()), false).await;
        assert_eq!(outcomes, vec![Outcome::Succeeded, Outcome::Succeeded]);
    }

    #[tokio::test]
    async fn test_dry_run_suppresses_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let outcomes = notify(&format!("{}/hook", server.uri()), true).await;
        assert_eq!(outcomes, vec![Outcome::SkippedDryRun, Outcome::SkippedDryRun]);
    }

    #[tokio::test]
    async fn test_context_suppresses_outbound_posts_in_dry_run() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/raw"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = url::Url::parse(&format!("{}/raw", server.uri())).unwrap();
        let outcomes = run_action(Arc::new(RawPost(url.clone())), true).await;
        assert_eq!(outcomes, vec![Outcome::SkippedDryRun, Outcome::SkippedDryRun]);

        // the single expected request comes from the live run
        let outcomes = run_action(Arc::new(RawPost(url)), false).await;
        assert_eq!(outcomes, vec![Outcome::Succeeded, Outcome::Succeeded]);
    }

    #[tokio::test]
    async fn test_rejected_webhook_fails_resources() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let outcomes = notify(&format!("{}/hook", server.uri()), false).await;
        assert!(outcomes.iter().all(Outcome::is_failed));
    }

    #[test]
    fn test_url_is_validated() {
        let ec2 = get_resource("ec2").unwrap();
        let opts = |v: Value| v.as_object().cloned().unwrap_or_default();
        assert!(NotifyAction::from_options(&opts(json!({"url": "https://h/x"})), "a", ec2).is_ok());
        let err = NotifyAction::from_options(&opts(json!({"url": "ftp://h/x"})), "a", ec2).unwrap_err();
        assert_eq!(err[0].location, "a.url");
        assert!(NotifyAction::from_options(&opts(json!({})), "a", ec2).is_err());
    }
}
