//! Related-resource filters
//!
//! Joins a resource to records of another resource type through a declared id
//! path, then applies value-filter semantics to the joined records:
//!
//! ```yaml
//! - type: security-group        # alias declared by aws.ec2
//!   key: GroupName
//!   value: default
//!   match: any                  # or `all`
//!
//! - type: related
//!   relation: subnet
//!   value_type: resource_count
//!   op: gte
//!   value: 2
//! ```
//!
//! The related type is listed through the run's resolver, so it is fetched at
//! most once per scope no matter how many resources or filters need it.

use super::value::{MatchEnv, Op, ValueMatcher};
use super::{Filter, FilterContext};
use crate::error::{ConfigIssue, FilterEvaluationError, Result};
use crate::resource::model::{scalar_text, AttrPath, Resource};
use crate::resource::registry::{qualify_for, ResourceDef};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// How many joined records must match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Any,
    All,
}

#[derive(Debug)]
enum Test {
    /// Compare the number of related ids
    Count { op: Op, value: f64 },
    /// Value semantics over each joined record
    Records { matcher: ValueMatcher, mode: MatchMode },
    /// Compare each joined record against the same attribute of the resource
    MatchResource {
        matcher: ValueMatcher,
        mode: MatchMode,
    },
}

/// Related-resource filter
#[derive(Debug)]
pub struct RelatedFilter {
    name: String,
    related_type: String,
    ids: AttrPath,
    test: Test,
}

impl RelatedFilter {
    /// Build either for an alias (`security-group`) or for `type: related`
    /// with a `relation` option.
    pub fn from_options(
        alias: Option<&str>,
        options: &Map<String, Value>,
        location: &str,
        resource: &ResourceDef,
    ) -> std::result::Result<Self, Vec<ConfigIssue>> {
        let mut issues = Vec::new();

        let relation = match alias {
            Some(name) => Some(name.to_string()),
            None => match options.get("relation").and_then(|v| v.as_str()) {
                Some(name) => Some(name.to_string()),
                None => {
                    issues.push(ConfigIssue::new(
                        format!("{}.relation", location),
                        "missing required field",
                    ));
                    None
                },
            },
        };
        let def = relation.as_deref().and_then(|name| {
            let def = resource.related_def(name);
            if def.is_none() {
                issues.push(ConfigIssue::new(
                    format!("{}.relation", location),
                    format!(
                        "resource {} declares no related '{}' (known: {})",
                        resource.key,
                        name,
                        resource.related.keys().cloned().collect::<Vec<_>>().join(", ")
                    ),
                ));
            }
            def
        });

        let mode = match (options.get("match"), options.get("operator")) {
            (Some(Value::String(m)), _) if m == "any" => MatchMode::Any,
            (Some(Value::String(m)), _) if m == "all" => MatchMode::All,
            (None, Some(Value::String(o))) if o == "or" => MatchMode::Any,
            (None, Some(Value::String(o))) if o == "and" => MatchMode::All,
            (None, None) => MatchMode::Any,
            (Some(other), _) | (None, Some(other)) => {
                issues.push(ConfigIssue::new(
                    format!("{}.match", location),
                    format!("expected any or all, got {}", other),
                ));
                MatchMode::Any
            },
        };

        let is_count = options.get("value_type").and_then(|v| v.as_str()) == Some("resource_count");
        let match_resource = options.get("match-resource").and_then(|v| v.as_bool()) == Some(true);

        let test = if is_count {
            let op = options
                .get("op")
                .and_then(|v| v.as_str())
                .map_or(Some(Op::Eq), Op::parse)
                .filter(|op| op.is_ordering());
            let value = options.get("value").and_then(|v| v.as_f64());
            match (op, value) {
                (Some(op), Some(value)) => Some(Test::Count { op, value }),
                (None, _) => {
                    issues.push(ConfigIssue::new(
                        format!("{}.op", location),
                        "resource_count needs a comparison operator",
                    ));
                    None
                },
                (_, None) => {
                    issues.push(ConfigIssue::new(
                        format!("{}.value", location),
                        "resource_count needs a numeric value",
                    ));
                    None
                },
            }
        } else {
            let mut options = options.clone();
            if match_resource {
                // placeholder, replaced per resource
                options.insert("value".to_string(), Value::Null);
            }
            match ValueMatcher::from_options(&options, location, true, true) {
                Ok(matcher) if match_resource => Some(Test::MatchResource { matcher, mode }),
                Ok(matcher) => Some(Test::Records { matcher, mode }),
                Err(mut errors) => {
                    issues.append(&mut errors);
                    None
                },
            }
        };

        let ids = def.and_then(|d| match AttrPath::parse(&d.ids) {
            Ok(path) => Some(path),
            Err(e) => {
                issues.push(ConfigIssue::new(location, format!("bad related id path: {}", e)));
                None
            },
        });

        match (def, ids, test) {
            (Some(def), Some(ids), Some(test)) if issues.is_empty() => Ok(Self {
                name: relation.unwrap_or_default(),
                related_type: qualify_for(&resource.provider, &def.resource),
                ids,
                test,
            }),
            _ => Err(issues),
        }
    }

    /// Count-only filters never need the related listing
    pub fn counts_only(&self) -> bool {
        matches!(self.test, Test::Count { .. })
    }

    pub fn related_type(&self) -> &str {
        &self.related_type
    }

    /// Related ids referenced by a resource, in order, without duplicates
    fn related_ids(&self, resource: &Resource) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for value in self.ids.collect(&resource.data) {
            let id = scalar_text(value);
            if !id.is_empty() && !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    fn error(&self, resource: &Resource, message: impl Into<String>) -> FilterEvaluationError {
        FilterEvaluationError {
            filter: self.name.clone(),
            resource_id: resource.id.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Filter for RelatedFilter {
    fn type_name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, ctx: &FilterContext) -> Result<()> {
        if self.counts_only() {
            return Ok(());
        }
        ctx.resolver.resolve(&self.related_type, &ctx.scope).await?;
        Ok(())
    }

    async fn matches(&self, resource: &Resource, ctx: &FilterContext) -> std::result::Result<bool, FilterEvaluationError> {
        let ids = self.related_ids(resource);

        let (matcher, mode, own_value) = match &self.test {
            Test::Count { op, value } => return Ok(op.compare_numbers(ids.len() as f64, *value)),
            Test::Records { matcher, mode } => (matcher, *mode, None),
            Test::MatchResource { matcher, mode } => {
                let Some(own) = resource.lookup(&matcher.key).into_owned() else {
                    return Ok(false);
                };
                (matcher, *mode, Some(own))
            },
        };

        let related = ctx
            .resolver
            .resolve(&self.related_type, &resource.scope)
            .await
            .map_err(|e| self.error(resource, e.to_string()))?;

        let mut matcher = matcher.clone();
        if let Some(own) = own_value {
            matcher.value = Some(own);
        }
        let env = MatchEnv {
            now: ctx.now,
            external: None,
        };

        let mut considered = 0usize;
        let mut found = 0usize;
        for id in &ids {
            let Some(record) = related.get(id) else {
                tracing::warn!(
                    "Resource {}:{} references non-existent {}: {}",
                    resource.resource_type,
                    resource.id,
                    self.related_type,
                    id
                );
                continue;
            };
            considered += 1;
            if matcher
                .matches_resource(record, &env)
                .map_err(|e| self.error(resource, e))?
            {
                found += 1;
            }
        }

        Ok(match mode {
            MatchMode::Any => found > 0,
            MatchMode::All => found == considered,
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
    use crate::resource::{get_resource, Resolver};
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

    fn filter(alias: Option<&str>, options: Value) -> RelatedFilter {
        let map = options.as_object().cloned().unwrap_or_default();
        RelatedFilter::from_options(alias, &map, "f", get_resource("ec2").unwrap()).unwrap()
    }

    fn instance(id: &str, groups: &[&str]) -> Resource {
        let groups: Vec<Value> = groups.iter().map(|g| json!({"GroupId": g})).collect();
        Resource::new(id, "aws.ec2", scope(), json!({"InstanceId": id, "SecurityGroups": groups}))
    }

    #[tokio::test]
    async fn test_any_and_all() {
        let (_, ctx) = setup();
        let any = filter(Some("security-group"), json!({"key": "GroupName", "value": "default"}));
        let all = filter(
            Some("security-group"),
            json!({"key": "GroupName", "value": "default", "match": "all"}),
        );

        let both = instance("i-1", &["sg-1", "sg-2"]);
        let only_default = instance("i-2", &["sg-1"]);
        let only_web = instance("i-3", &["sg-2"]);

        assert!(any.matches(&both, &ctx).await.unwrap());
        assert!(!all.matches(&both, &ctx).await.unwrap());
        assert!(all.matches(&only_default, &ctx).await.unwrap());
        assert!(!any.matches(&only_web, &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_related_listing_fetched_once() {
        let (provider, ctx) = setup();
        let f = filter(Some("security-group"), json!({"key": "GroupName", "value": "web"}));
        f.prepare(&ctx).await.unwrap();
        for i in 0..10 {
            f.matches(&instance(&format!("i-{}", i), &["sg-2"]), &ctx).await.unwrap();
        }
        assert_eq!(provider.list_calls("security-group"), 1);
    }

    #[tokio::test]
    async fn test_missing_related_is_skipped() {
        let (_, ctx) = setup();
        let f = filter(Some("security-group"), json!({"key": "GroupName", "value": "default"}));
        // sg-9 does not exist: only sg-1 is considered
        assert!(f.matches(&instance("i-1", &["sg-9", "sg-1"]), &ctx).await.unwrap());
        let all = filter(
            Some("security-group"),
            json!({"key": "GroupName", "value": "default", "match": "all"}),
        );
        assert!(all.matches(&instance("i-1", &["sg-9", "sg-1"]), &ctx).await.unwrap());
        // nothing related at all
        assert!(all.matches(&instance("i-2", &[]), &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_resource_count() {
        let (provider, ctx) = setup();
        let f = filter(
            None,
            json!({"relation": "security-group", "value_type": "resource_count", "op": "gte", "value": 2}),
        );
        assert!(f.counts_only());
        assert!(f.matches(&instance("i-1", &["sg-1", "sg-2"]), &ctx).await.unwrap());
        assert!(!f.matches(&instance("i-2", &["sg-1"]), &ctx).await.unwrap());
        assert_eq!(provider.list_calls("security-group"), 0);
    }

    #[test]
    fn test_unknown_relation() {
        let map = json!({"relation": "bucket", "key": "a", "value": 1});
        let err = RelatedFilter::from_options(
            None,
            map.as_object().unwrap(),
            "filters[0]",
            get_resource("ec2").unwrap(),
        )
        .unwrap_err();
        assert_eq!(err[0].location, "filters[0].relation");
    }
}
