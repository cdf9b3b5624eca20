//! Tag actions
//!
//! ```yaml
//! actions:
//!   - type: tag
//!     key: Owner
//!     value: unknown
//!   - type: remove-tag
//!     tags: [Temporary]
//!   - type: mark-for-op
//!     op: stop
//!     days: 4
//! ```
//!
//! `mark-for-op` writes a dated operation mark that the `marked-for-op`
//! filter reads back on later runs. A resource that already carries a mark
//! for the same operation is left alone, so re-running the policy never
//! pushes the date out.

use super::{Action, ActionContext, Plan};
use crate::error::{ConfigIssue, ProviderError};
use crate::filters::age::{
    format_action_date, parse_mark, DEFAULT_MARK_MESSAGE, DEFAULT_MARK_OP, DEFAULT_MARK_TAG,
};
use crate::provider::TargetOutcome;
use crate::resource::model::{scalar_text, Resource};
use crate::resource::registry::ResourceDef;
use async_trait::async_trait;
use chrono::Duration;
use serde_json::{json, Map, Value};
use std::sync::Arc;

const TAG_BATCH_SIZE: usize = 20;
const MAX_MARK_DAYS: f64 = 3650.0;
const MAX_MARK_HOURS: f64 = MAX_MARK_DAYS * 24.0;

fn require_tags(resource: &ResourceDef, location: &str, issues: &mut Vec<ConfigIssue>) {
    if !resource.taggable() {
        issues.push(ConfigIssue::new(
            location,
            format!("resource {} does not support tags", resource.key),
        ));
    }
}

// ============================================================================
// tag
// ============================================================================

#[derive(Debug)]
pub struct TagAction {
    tags: Map<String, Value>,
}

impl TagAction {
    /// `key`/`value` or a `tags` mapping
    pub fn from_options(
        options: &Map<String, Value>,
        location: &str,
        resource: &ResourceDef,
    ) -> Result<Self, Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        require_tags(resource, location, &mut issues);

        let mut tags = Map::new();
        match options.get("tags") {
            Some(Value::Object(map)) => {
                for (k, v) in map {
                    tags.insert(k.clone(), Value::String(scalar_text(v)));
                }
            },
            Some(other) => issues.push(ConfigIssue::new(
                format!("{}.tags", location),
                format!("expected a mapping, got {}", other),
            )),
            None => {},
        }
        if let Some(key) = options.get("key").and_then(|k| k.as_str()) {
            let value = options.get("value").map(scalar_text).unwrap_or_default();
            tags.insert(key.to_string(), Value::String(value));
        }
        if tags.is_empty() {
            issues.push(ConfigIssue::new(location, "tag requires key/value or tags"));
        }

        if !issues.is_empty() {
            return Err(issues);
        }
        Ok(Self { tags })
    }
}

#[async_trait]
impl Action for TagAction {
    fn type_name(&self) -> &str {
        "tag"
    }

    fn batch_size(&self) -> usize {
        TAG_BATCH_SIZE
    }

    async fn process(
        &self,
        batch: &[Arc<Resource>],
        ctx: &ActionContext,
    ) -> Result<Vec<TargetOutcome>, ProviderError> {
        ctx.mutate(ctx.request("tag", batch, json!({ "tags": self.tags })))
            .await
    }
}

// ============================================================================
// remove-tag
// ============================================================================

#[derive(Debug)]
pub struct RemoveTagAction {
    keys: Vec<String>,
}

impl RemoveTagAction {
    pub fn from_options(
        options: &Map<String, Value>,
        location: &str,
        resource: &ResourceDef,
    ) -> Result<Self, Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        require_tags(resource, location, &mut issues);

        let keys: Vec<String> = match (options.get("tags"), options.get("key")) {
            (Some(Value::Array(items)), _) => items.iter().map(scalar_text).collect(),
            (Some(Value::String(one)), _) | (None, Some(Value::String(one))) => vec![one.clone()],
            (None, None) => vec![DEFAULT_MARK_TAG.to_string()],
            (Some(other), _) | (None, Some(other)) => {
                issues.push(ConfigIssue::new(
                    format!("{}.tags", location),
                    format!("expected a list of tag keys, got {}", other),
                ));
                Vec::new()
            },
        };

        if !issues.is_empty() {
            return Err(issues);
        }
        Ok(Self { keys })
    }
}

#[async_trait]
impl Action for RemoveTagAction {
    fn type_name(&self) -> &str {
        "remove-tag"
    }

    fn batch_size(&self) -> usize {
        TAG_BATCH_SIZE
    }

    fn plan(&self, resource: &Resource, _ctx: &ActionContext) -> Plan {
        if self.keys.iter().any(|k| resource.tags.contains_key(k)) {
            Plan::Apply
        } else {
            Plan::Skip(format!("none of {} present", self.keys.join(", ")))
        }
    }

    async fn process(
        &self,
        batch: &[Arc<Resource>],
        ctx: &ActionContext,
    ) -> Result<Vec<TargetOutcome>, ProviderError> {
        ctx.mutate(ctx.request("remove-tag", batch, json!({ "tags": self.keys })))
            .await
    }
}

// ============================================================================
// mark-for-op
// ============================================================================

#[derive(Debug)]
pub struct MarkForOpAction {
    tag: String,
    op: String,
    delay: Duration,
    with_hours: bool,
    message: String,
}

impl MarkForOpAction {
    /// `op` must be a provider operation of the resource type
    pub fn from_options(
        options: &Map<String, Value>,
        location: &str,
        resource: &ResourceDef,
    ) -> Result<Self, Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        require_tags(resource, location, &mut issues);

        let text = |name: &str, default: &str| {
            options
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or(default)
                .to_string()
        };
        let op = text("op", DEFAULT_MARK_OP);
        if resource.action(&op).is_none() {
            issues.push(ConfigIssue::new(
                format!("{}.op", location),
                format!(
                    "'{}' is not an operation of {} (known: {})",
                    op,
                    resource.key,
                    resource.actions.iter().map(|a| a.key.as_str()).collect::<Vec<_>>().join(", ")
                ),
            ));
        }

        let mut number = |name: &str| match options.get(name) {
            None => None,
            Some(v) => match v.as_f64() {
                Some(n) if n >= 0.0 => Some(n),
                _ => {
                    issues.push(ConfigIssue::new(
                        format!("{}.{}", location, name),
                        format!("expected a non-negative number, got {}", v),
                    ));
                    None
                },
            },
        };
        let days = number("days");
        let hours = number("hours");
        let delay = match (days, hours) {
            (None, None) => Duration::days(4),
            (d, h) => {
                let total_hours = d.unwrap_or(0.0) * 24.0 + h.unwrap_or(0.0);
                if total_hours > MAX_MARK_HOURS {
                    issues.push(ConfigIssue::new(
                        location.to_string(),
                        format!("mark delay of {} hours exceeds {} days", total_hours, MAX_MARK_DAYS),
                    ));
                    Duration::zero()
                } else {
                    Duration::try_seconds((total_hours * 3600.0).round() as i64).unwrap_or_else(Duration::zero)
                }
            },
        };

        if !issues.is_empty() {
            return Err(issues);
        }
        Ok(Self {
            tag: text("tag", DEFAULT_MARK_TAG),
            message: text("msg", DEFAULT_MARK_MESSAGE),
            op,
            delay,
            with_hours: hours.is_some(),
        })
    }

    /// Mark written for a run at `ctx.now`; `None` when the due date is out of range
    pub fn mark(&self, ctx: &ActionContext) -> Option<String> {
        let due = ctx.now.checked_add_signed(self.delay)?;
        Some(
            self.message
                .replace("{op}", &self.op)
                .replace("{action_date}", &format_action_date(due, self.with_hours)),
        )
    }
}

#[async_trait]
impl Action for MarkForOpAction {
    fn type_name(&self) -> &str {
        "mark-for-op"
    }

    fn batch_size(&self) -> usize {
        TAG_BATCH_SIZE
    }

    fn plan(&self, resource: &Resource, _ctx: &ActionContext) -> Plan {
        match resource.tag(&self.tag).and_then(parse_mark) {
            Some((op, due)) if op == self.op => {
                Plan::Skip(format!("already marked for {} on {}", op, due.format("%Y/%m/%d")))
            },
            _ => Plan::Apply,
        }
    }

    async fn process(
        &self,
        batch: &[Arc<Resource>],
        ctx: &ActionContext,
    ) -> Result<Vec<TargetOutcome>, ProviderError> {
        let mut tags = Map::new();
        let Some(mark) = self.mark(ctx) else {
            return Err(ProviderError::Permanent(format!(
                "{} due date overflows from {}",
                self.op, ctx.now
            )));
        };
        tags.insert(self.tag.clone(), Value::String(mark));
        ctx.mutate(ctx.request("tag", batch, json!({ "tags": tags })))
            .await
    }
}
