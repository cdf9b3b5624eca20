//! Filter Engine
//!
//! A policy's `filters` form a boolean expression tree. Leaves are registered
//! filter implementations; composites are `and`, `or` and `not`:
//!
//! ```yaml
//! filters:
//!   - State.Name: running            # shorthand value filter
//!   - "tag:Environment": absent
//!   - or:
//!       - type: age
//!         days: 30
//!       - type: security-group
//!         key: GroupName
//!         value: default
//! ```
//!
//! `and` stops at the first false child, `or` at the first true child. A leaf
//! that cannot evaluate a resource (malformed data) counts as false for that
//! resource; the error is logged and recorded on the [`FilterContext`].
//!
//! # Module Structure
//!
//! - [`registry`] - Filter type name to constructor
//! - [`value`] - Attribute comparison (`type: value` and shorthand)
//! - [`related`] - Related-resource joins
//! - [`missing`] - Embedded policies that must find nothing
//! - [`age`] - Resource age and `marked-for-op`
//! - [`event`] - Push-mode event payload tests
//! - [`external`] - `value_from` tables

pub mod age;
pub mod event;
pub mod external;
pub mod missing;
pub mod registry;
pub mod related;
pub mod value;

use crate::error::{ConfigIssue, FilterEvaluationError, Result};
use crate::provider::Scope;
use crate::resource::model::Resource;
use crate::resource::registry::ResourceDef;
use crate::resource::Resolver;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

pub use external::{DefaultDataSource, ExternalDataSource};
pub use registry::{standard_registry, FilterRegistry};
pub use value::{ValueFilter, ValueMatcher};

/// A registered filter implementation
#[async_trait]
pub trait Filter: Send + Sync + fmt::Debug {
    /// Type name as written in policies
    fn type_name(&self) -> &str;

    /// Load whatever the filter needs before resources are evaluated.
    ///
    /// Failures here are fatal to the scope (configuration or resolution
    /// errors).
    async fn prepare(&self, _ctx: &FilterContext) -> Result<()> {
        Ok(())
    }

    /// Test one resource. Must not mutate anything.
    async fn matches(
        &self,
        resource: &Resource,
        ctx: &FilterContext,
    ) -> std::result::Result<bool, FilterEvaluationError>;
}

/// Per (policy, scope) evaluation context
pub struct FilterContext {
    pub policy: String,
    pub scope: Scope,
    pub resolver: Resolver,
    pub data_source: Arc<dyn ExternalDataSource>,
    /// Trigger payload in push mode
    pub event: Option<Arc<Value>>,
    /// Reference time for age-style comparisons, fixed for the run
    pub now: DateTime<Utc>,
    errors: Mutex<Vec<FilterEvaluationError>>,
}

impl FilterContext {
    pub fn new(
        policy: &str,
        scope: Scope,
        resolver: Resolver,
        data_source: Arc<dyn ExternalDataSource>,
    ) -> Self {
        Self {
            policy: policy.to_string(),
            scope,
            resolver,
            data_source,
            event: None,
            now: Utc::now(),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn with_event(mut self, event: Option<Arc<Value>>) -> Self {
        self.event = event;
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    fn record_error(&self, error: FilterEvaluationError) {
        tracing::warn!(policy = %self.policy, scope = %self.scope, "{}", error);
        self.errors.lock().push(error);
    }

    /// Evaluation errors recorded so far
    pub fn errors(&self) -> Vec<FilterEvaluationError> {
        self.errors.lock().clone()
    }
}

/// Boolean expression over filters
#[derive(Debug, Clone)]
pub enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
    Leaf(Arc<dyn Filter>),
}

/// What a filter is being built for
#[derive(Clone, Copy)]
pub struct BuildContext<'a> {
    pub resource: &'static ResourceDef,
    pub registry: &'a FilterRegistry,
}

impl FilterNode {
    /// Evaluate against one resource, short-circuiting composites
    pub fn evaluate<'a>(&'a self, resource: &'a Resource, ctx: &'a FilterContext) -> BoxFuture<'a, bool> {
        async move {
            match self {
                Self::And(children) => {
                    for child in children {
                        if !child.evaluate(resource, ctx).await {
                            return false;
                        }
                    }
                    true
                },
                Self::Or(children) => {
                    for child in children {
                        if child.evaluate(resource, ctx).await {
                            return true;
                        }
                    }
                    false
                },
                Self::Not(inner) => !inner.evaluate(resource, ctx).await,
                Self::Leaf(filter) => match filter.matches(resource, ctx).await {
                    Ok(matched) => matched,
                    Err(error) => {
                        ctx.record_error(error);
                        false
                    },
                },
            }
        }
        .boxed()
    }

    /// Run `prepare` on every leaf
    pub async fn prepare(&self, ctx: &FilterContext) -> Result<()> {
        for leaf in self.leaves() {
            leaf.prepare(ctx).await?;
        }
        Ok(())
    }

    /// Leaves in document order
    pub fn leaves(&self) -> Vec<&Arc<dyn Filter>> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Arc<dyn Filter>>) {
        match self {
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_leaves(out);
                }
            },
            Self::Not(inner) => inner.collect_leaves(out),
            Self::Leaf(filter) => out.push(filter),
        }
    }

    /// Parse a policy's `filters` sequence. An empty sequence matches every
    /// resource and yields `None`. Issues are appended to `issues`.
    pub fn parse_list(
        entries: &[Value],
        location: &str,
        ctx: &BuildContext<'_>,
        issues: &mut Vec<ConfigIssue>,
    ) -> Option<FilterNode> {
        let before = issues.len();
        let mut children: Vec<FilterNode> = entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| Self::parse(entry, &format!("{}[{}]", location, i), ctx, issues))
            .collect();

        if issues.len() > before || children.is_empty() {
            return None;
        }
        if children.len() == 1 {
            return children.pop();
        }
        Some(Self::And(children))
    }

    /// Parse one filter entry
    pub fn parse(
        entry: &Value,
        location: &str,
        ctx: &BuildContext<'_>,
        issues: &mut Vec<ConfigIssue>,
    ) -> Option<FilterNode> {
        let Value::Object(map) = entry else {
            issues.push(ConfigIssue::new(
                location,
                format!("expected a filter mapping, got {}", entry),
            ));
            return None;
        };

        if map.len() == 1 {
            let (key, value) = map.iter().next()?;
            match key.as_str() {
                "and" | "or" => return Self::parse_composite(key, value, location, ctx, issues),
                "not" => return Self::parse_not(value, location, ctx, issues),
                _ => {},
            }
        }

        if let Some(type_name) = map.get("type") {
            let Some(type_name) = type_name.as_str() else {
                issues.push(ConfigIssue::new(format!("{}.type", location), "expected a string"));
                return None;
            };
            return match ctx.registry.build(type_name, map, location, ctx.resource) {
                Ok(filter) => Some(Self::Leaf(filter)),
                Err(mut errors) => {
                    issues.append(&mut errors);
                    None
                },
            };
        }

        if map.len() == 1 {
            let (path, value) = map.iter().next()?;
            return match ValueMatcher::shorthand(path, value, location) {
                Ok(matcher) => Some(Self::Leaf(Arc::new(ValueFilter::new(matcher)))),
                Err(mut errors) => {
                    issues.append(&mut errors);
                    None
                },
            };
        }

        issues.push(ConfigIssue::new(
            location,
            "expected 'type', a single {path: value} pair, or one of and/or/not",
        ));
        None
    }

    fn parse_composite(
        op: &str,
        value: &Value,
        location: &str,
        ctx: &BuildContext<'_>,
        issues: &mut Vec<ConfigIssue>,
    ) -> Option<FilterNode> {
        let location = format!("{}.{}", location, op);
        let Some(entries) = value.as_array() else {
            issues.push(ConfigIssue::new(location, "expected a sequence of filters"));
            return None;
        };
        if entries.is_empty() {
            issues.push(ConfigIssue::new(location, "requires at least one child"));
            return None;
        }

        let before = issues.len();
        let children: Vec<FilterNode> = entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| Self::parse(e, &format!("{}[{}]", location, i), ctx, issues))
            .collect();
        if issues.len() > before {
            return None;
        }
        Some(if op == "and" {
            Self::And(children)
        } else {
            Self::Or(children)
        })
    }

    fn parse_not(
        value: &Value,
        location: &str,
        ctx: &BuildContext<'_>,
        issues: &mut Vec<ConfigIssue>,
    ) -> Option<FilterNode> {
        let location = format!("{}.not", location);
        let child = match value {
            Value::Array(entries) if entries.len() == 1 => &entries[0],
            Value::Array(entries) => {
                issues.push(ConfigIssue::new(
                    location,
                    format!("requires exactly one child, got {}", entries.len()),
                ));
                return None;
            },
            Value::Object(_) => value,
            other => {
                issues.push(ConfigIssue::new(location, format!("expected a filter, got {}", other)));
                return None;
            },
        };
        Self::parse(child, &format!("{}[0]", location), ctx, issues).map(|c| Self::Not(Box::new(c)))
    }
}

/// Options of a filter entry, without the `type` key
pub fn options_of(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter(|(k, _)| k.as_str() != "type")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
