//! `missing` filter
//!
//! Matches when an embedded policy finds nothing in the run's scope, e.g. an
//! account without a default security group:
//!
//! ```yaml
//! - type: missing
//!   policy:
//!     resource: security-group
//!     filters:
//!       - GroupName: default
//! ```
//!
//! The embedded policy takes a resource type and filters only. Its listing
//! comes from the run's resolver and its verdict is computed once per scope.

use super::registry::standard_registry;
use super::{BuildContext, Filter, FilterContext, FilterNode};
use crate::error::{ConfigIssue, FilterEvaluationError, Result};
use crate::provider::Scope;
use crate::resource::get_resource;
use crate::resource::model::Resource;
use crate::resource::registry::{qualify_for, ResourceDef};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug)]
pub struct MissingFilter {
    resource: &'static ResourceDef,
    filters: Option<FilterNode>,
    verdicts: Mutex<HashMap<Scope, bool>>,
}

impl MissingFilter {
    pub fn from_options(
        options: &Map<String, Value>,
        location: &str,
        outer: &ResourceDef,
    ) -> std::result::Result<Self, Vec<ConfigIssue>> {
        let location = format!("{}.policy", location);
        let Some(Value::Object(policy)) = options.get("policy") else {
            return Err(vec![ConfigIssue::new(location, "expected an embedded policy mapping")]);
        };

        let mut issues = Vec::new();
        for key in policy.keys() {
            if !matches!(key.as_str(), "resource" | "filters" | "name") {
                issues.push(ConfigIssue::new(
                    format!("{}.{}", location, key),
                    "embedded policies take only resource and filters",
                ));
            }
        }

        let resource = match policy.get("resource").and_then(|v| v.as_str()) {
            None => {
                issues.push(ConfigIssue::new(format!("{}.resource", location), "missing required field"));
                None
            },
            Some(name) => match get_resource(&qualify_for(&outer.provider, name)) {
                Some(def) if def.provider == outer.provider => Some(def),
                _ => {
                    issues.push(ConfigIssue::new(
                        format!("{}.resource", location),
                        format!("unknown {} resource type '{}'", outer.provider, name),
                    ));
                    None
                },
            },
        };

        let filters = match (resource, policy.get("filters")) {
            (Some(def), Some(Value::Array(entries))) => {
                let build = BuildContext {
                    resource: def,
                    registry: standard_registry(),
                };
                FilterNode::parse_list(entries, &format!("{}.filters", location), &build, &mut issues)
            },
            (_, Some(Value::Array(_))) | (_, None) => None,
            (_, Some(other)) => {
                issues.push(ConfigIssue::new(
                    format!("{}.filters", location),
                    format!("expected a sequence, got {}", other),
                ));
                None
            },
        };

        match resource {
            Some(resource) if issues.is_empty() => Ok(Self {
                resource,
                filters,
                verdicts: Mutex::new(HashMap::new()),
            }),
            _ => Err(issues),
        }
    }

    /// Whether the embedded policy matches anything in the context's scope
    async fn found(&self, ctx: &FilterContext) -> Result<bool> {
        if let Some(found) = self.verdicts.lock().get(&ctx.scope) {
            return Ok(*found);
        }
        let listing = ctx.resolver.resolve(&self.resource.key, &ctx.scope).await?;
        let found = match &self.filters {
            None => !listing.is_empty(),
            Some(node) => {
                let mut found = false;
                for candidate in listing.iter() {
                    if node.evaluate(candidate, ctx).await {
                        found = true;
                        break;
                    }
                }
                found
            },
        };
        tracing::debug!(
            policy = %ctx.policy,
            scope = %ctx.scope,
            "embedded {} policy found {}",
            self.resource.key,
            if found { "matches" } else { "nothing" }
        );
        self.verdicts.lock().insert(ctx.scope.clone(), found);
        Ok(found)
    }
}

#[async_trait]
impl Filter for MissingFilter {
    fn type_name(&self) -> &str {
        "missing"
    }

    async fn prepare(&self, ctx: &FilterContext) -> Result<()> {
        if let Some(node) = &self.filters {
            node.prepare(ctx).await?;
        }
        self.found(ctx).await?;
        Ok(())
    }

    async fn matches(&self, resource: &Resource, ctx: &FilterContext) -> std::result::Result<bool, FilterEvaluationError> {
        self.found(ctx).await.map(|found| !found).map_err(|e| FilterEvaluationError {
            filter: "missing".to_string(),
            resource_id: resource.id.clone(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLayer;
    use crate::cancel::CancelSignal;
    use crate::filters::DefaultDataSource;
    use crate::provider::MemoryProvider;
    use crate::resource::Resolver;
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::sync::Arc;

    fn scope() -> Scope {
        Scope::new("aws", "123", "us-east-1")
    }

    fn setup() -> (Arc<MemoryProvider>, FilterContext) {
        let provider = Arc::new(MemoryProvider::new("aws"));
        provider.insert("security-group", json!({"GroupId": "sg-1", "GroupName": "default"}));
        provider.insert("security-group", json!({"GroupId": "sg-2", "GroupName": "web"}));
        let resolver = Resolver::new(
            provider.clone(),
            Arc::new(CacheLayer::new()),
            RetryPolicy::default(),
            CancelSignal::new(),
        );
        let ctx = FilterContext::new("p", scope(), resolver, Arc::new(DefaultDataSource::new()));
        (provider, ctx)
    }

    fn filter(policy: Value) -> std::result::Result<MissingFilter, Vec<ConfigIssue>> {
        let options = json!({ "policy": policy });
        MissingFilter::from_options(
            options.as_object().unwrap(),
            "filters[0]",
            get_resource("ec2").unwrap(),
        )
    }

    fn instance(id: &str) -> Resource {
        Resource::new(id, "aws.ec2", scope(), json!({"InstanceId": id}))
    }

    #[tokio::test]
    async fn test_matches_when_embedded_policy_finds_nothing() {
        let (provider, ctx) = setup();
        let admin = filter(json!({"resource": "security-group", "filters": [{"GroupName": "admin"}]})).unwrap();
        let default = filter(json!({"resource": "security-group", "filters": [{"GroupName": "default"}]})).unwrap();
        let any = filter(json!({"resource": "security-group"})).unwrap();
        let subnets = filter(json!({"resource": "subnet"})).unwrap();

        admin.prepare(&ctx).await.unwrap();
        for i in 0..5 {
            let r = instance(&format!("i-{}", i));
            assert!(admin.matches(&r, &ctx).await.unwrap());
            assert!(!default.matches(&r, &ctx).await.unwrap());
        }
        assert!(!any.matches(&instance("i-9"), &ctx).await.unwrap());
        assert!(subnets.matches(&instance("i-9"), &ctx).await.unwrap());
        assert_eq!(provider.list_calls("security-group"), 1);
    }

    #[test]
    fn test_embedded_policy_is_validated() {
        let err = filter(json!({"resource": "security-group", "actions": ["delete"]})).unwrap_err();
        assert_eq!(err[0].location, "filters[0].policy.actions");

        let err = filter(json!({"resource": "gcp.instance"})).unwrap_err();
        assert_eq!(err[0].location, "filters[0].policy.resource");

        let err = filter(json!({"resource": "security-group", "filters": [{"type": "bogus"}]})).unwrap_err();
        assert!(err[0].location.starts_with("filters[0].policy.filters[0]"));

        let options = json!({});
        assert!(MissingFilter::from_options(options.as_object().unwrap(), "f", get_resource("ec2").unwrap()).is_err());
    }
}
