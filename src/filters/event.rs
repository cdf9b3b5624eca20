//! Event filter
//!
//! Tests the payload of the event that triggered a push-mode run rather than
//! the resource:
//!
//! ```yaml
//! - type: event
//!   key: detail.userIdentity.type
//!   value: Root
//! ```
//!
//! Pull-mode runs carry no event; the filter then passes every resource.

use super::value::{MatchEnv, ValueMatcher};
use super::{Filter, FilterContext};
use crate::error::{ConfigIssue, FilterEvaluationError};
use crate::resource::model::Resource;
use async_trait::async_trait;
use serde_json::{Map, Value};

#[derive(Debug)]
pub struct EventFilter {
    matcher: ValueMatcher,
}

impl EventFilter {
    pub fn from_options(options: &Map<String, Value>, location: &str) -> Result<Self, Vec<ConfigIssue>> {
        let matcher = ValueMatcher::from_options(options, location, true, false)?;
        if matcher.value_from.is_some() {
            return Err(vec![ConfigIssue::new(
                format!("{}.value_from", location),
                "event filters compare against literal values only",
            )]);
        }
        Ok(Self { matcher })
    }
}

#[async_trait]
impl Filter for EventFilter {
    fn type_name(&self) -> &str {
        "event"
    }

    async fn matches(&self, resource: &Resource, ctx: &FilterContext) -> Result<bool, FilterEvaluationError> {
        let Some(event) = &ctx.event else {
            return Ok(true);
        };
        let env = MatchEnv {
            now: ctx.now,
            external: None,
        };
        self.matcher
            .matches_document(event, &env)
            .map_err(|message| FilterEvaluationError {
                filter: format!("event {}", self.matcher.key),
                resource_id: resource.id.clone(),
                message,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLayer;
    use crate::cancel::CancelSignal;
    use crate::filters::DefaultDataSource;
    use crate::provider::{MemoryProvider, Scope};
    use crate::resource::Resolver;
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx(event: Option<Value>) -> FilterContext {
        let resolver = Resolver::new(
            Arc::new(MemoryProvider::new("aws")),
            Arc::new(CacheLayer::new()),
            RetryPolicy::default(),
            CancelSignal::new(),
        );
        FilterContext::new(
            "p",
            Scope::new("aws", "1", "r"),
            resolver,
            Arc::new(DefaultDataSource::new()),
        )
        .with_event(event.map(Arc::new))
    }

    #[tokio::test]
    async fn test_event_payload_is_tested() {
        let options = json!({"key": "detail.userIdentity.type", "value": "Root"});
        let filter = EventFilter::from_options(options.as_object().unwrap(), "f").unwrap();
        let r = Resource::new("i-1", "aws.ec2", Scope::new("aws", "1", "r"), json!({}));

        let root = json!({"detail": {"userIdentity": {"type": "Root"}}});
        let user = json!({"detail": {"userIdentity": {"type": "IAMUser"}}});
        assert!(filter.matches(&r, &ctx(Some(root))).await.unwrap());
        assert!(!filter.matches(&r, &ctx(Some(user))).await.unwrap());
        assert!(filter.matches(&r, &ctx(None)).await.unwrap());
    }
}
