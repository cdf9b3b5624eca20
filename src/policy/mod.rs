//! Policy Runtime
//!
//! A policy names a resource type, a filter tree and an ordered list of
//! actions. The runtime drives one policy against one scope through
//! `INIT → RESOLVING → FILTERING → ACTING → REPORTING → DONE`, and the engine
//! fans policies out over scopes (pull) or maps a trigger event onto them
//! (push).
//!
//! # Module Structure
//!
//! - [`loader`] - Policy documents (YAML/JSON) and validation
//! - [`vars`] - `{account_id}`-style variables in option strings
//! - [`runtime`] - Per (policy, scope) state machine and run report
//! - [`engine`] - Pull and push entry points over a worker pool

pub mod engine;
pub mod loader;
pub mod runtime;
pub mod vars;

use crate::actions::Action;
use crate::error::{ConfigIssue, ConfigurationError};
use crate::filters::FilterNode;
use crate::provider::Scope;
use crate::resource::model::AttrPath;
use crate::resource::registry::ResourceDef;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

pub use engine::Engine;
pub use loader::{load_file, parse_document};
pub use runtime::{PolicyRunner, RunReport, RunState};
pub use vars::Variables;

/// How a policy is triggered
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionMode {
    /// On demand, over every configured scope
    Pull,
    /// On a schedule; runs like pull
    Periodic { schedule: String },
    /// From a cloud event carrying resource references
    Event {
        /// Event names this policy reacts to; empty reacts to any
        events: Vec<String>,
        /// Where resource ids sit in the event payload
        ids: Option<AttrPath>,
    },
}

impl ExecutionMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Periodic { .. } => "periodic",
            Self::Event { .. } => "event",
        }
    }

    pub fn is_push(&self) -> bool {
        matches!(self, Self::Event { .. })
    }

    /// Whether a trigger with this event name should run the policy
    pub fn accepts_event(&self, name: Option<&str>) -> bool {
        match (self, name) {
            (Self::Event { events, .. }, Some(name)) => {
                events.is_empty() || events.iter().any(|e| e == name)
            },
            (Self::Event { .. }, None) => true,
            _ => false,
        }
    }
}

/// Run-time options of a policy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyOptions {
    /// Forces dry-run for this policy regardless of the run setting
    pub dry_run: bool,
    /// Skip actions when more resources than this match
    pub max_resources: Option<usize>,
    /// Skip actions when more than this share (0-100) of the resolved resources match
    pub max_resources_percent: Option<f64>,
}

impl PolicyOptions {
    /// Reason the match set is over the limit, if it is
    pub fn limit_exceeded(&self, matched: usize, total: usize) -> Option<String> {
        if let Some(max) = self.max_resources {
            if matched > max {
                return Some(format!("{} resources matched, max-resources is {}", matched, max));
            }
        }
        if let Some(percent) = self.max_resources_percent {
            if total > 0 {
                let share = matched as f64 * 100.0 / total as f64;
                if share > percent {
                    return Some(format!(
                        "{:.1}% of resources matched, max-resources-percent is {}",
                        share, percent
                    ));
                }
            }
        }
        None
    }
}

/// A validated policy
#[derive(Debug, Clone)]
pub struct Policy {
    pub name: String,
    pub resource: &'static ResourceDef,
    pub description: Option<String>,
    pub mode: ExecutionMode,
    /// `None` matches every resource
    pub filters: Option<FilterNode>,
    pub actions: Vec<Arc<dyn Action>>,
    pub options: PolicyOptions,
    document: Value,
    location: String,
}

impl Policy {
    /// Qualified resource type, e.g. `aws.ec2`
    pub fn resource_type(&self) -> &str {
        &self.resource.key
    }

    pub fn provider(&self) -> &str {
        &self.resource.provider
    }

    /// The policy definition as written
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Policy with its variables expanded for a scope.
    ///
    /// Policies without variables are returned as they are; the others are
    /// rebuilt from their document so filters and actions see final values.
    pub fn bind(&self, scope: &Scope, now: DateTime<Utc>) -> Result<Policy, ConfigurationError> {
        if !vars::references_variables(&self.document) {
            return Ok(self.clone());
        }
        let variables = Variables::for_scope(&self.name, scope, now);
        let mut issues: Vec<ConfigIssue> = Vec::new();
        let bound = loader::parse_policy(&self.document, &self.location, &variables, &mut issues);
        match bound {
            Some(policy) if issues.is_empty() => Ok(policy),
            _ => Err(ConfigurationError::new(issues)),
        }
    }
}

/// Validated policies in document order
#[derive(Debug, Clone, Default)]
pub struct PolicyCollection {
    policies: Vec<Policy>,
}

impl PolicyCollection {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self { policies }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.policies.iter()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| p.name == name)
    }

    /// Keep only the named policies; an empty list keeps everything
    pub fn select(&self, names: &[String]) -> Result<PolicyCollection, ConfigurationError> {
        if names.is_empty() {
            return Ok(self.clone());
        }
        let missing: Vec<ConfigIssue> = names
            .iter()
            .filter(|n| self.get(n).is_none())
            .map(|n| ConfigIssue::new("policies", format!("no policy named '{}'", n)))
            .collect();
        if !missing.is_empty() {
            return Err(ConfigurationError::new(missing));
        }
        Ok(Self::new(
            self.policies
                .iter()
                .filter(|p| names.contains(&p.name))
                .cloned()
                .collect(),
        ))
    }
}

impl<'a> IntoIterator for &'a PolicyCollection {
    type Item = &'a Policy;
    type IntoIter = std::slice::Iter<'a, Policy>;

    fn into_iter(self) -> Self::IntoIter {
        self.policies.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_limit_by_count_and_percent() {
        let options = PolicyOptions {
            max_resources: Some(2),
            ..Default::default()
        };
        assert!(options.limit_exceeded(2, 10).is_none());
        assert!(options.limit_exceeded(3, 10).is_some());

        let options = PolicyOptions {
            max_resources_percent: Some(25.0),
            ..Default::default()
        };
        assert!(options.limit_exceeded(2, 10).is_none());
        assert!(options.limit_exceeded(3, 10).is_some());
        assert!(options.limit_exceeded(0, 0).is_none());
    }

    #[test]
    fn test_event_mode_filters_by_name() {
        let mode = ExecutionMode::Event {
            events: vec!["RunInstances".into()],
            ids: None,
        };
        assert!(mode.accepts_event(Some("RunInstances")));
        assert!(!mode.accepts_event(Some("StopInstances")));
        assert!(mode.accepts_event(None));
        assert!(!ExecutionMode::Pull.accepts_event(Some("RunInstances")));
    }

    #[test]
    fn test_bind_expands_variables_per_scope() {
        let policies = parse_document(
            r#"
policies:
  - name: owner-check
    resource: ec2
    filters:
      - "tag:Account": "{account_id}"
    actions:
      - type: tag
        key: checked-in
        value: "{region}"
"#,
        )
        .unwrap();
        let policy = policies.get("owner-check").unwrap();
        let bound = policy
            .bind(&Scope::new("aws", "123", "eu-west-1"), Utc::now())
            .unwrap();
        assert_eq!(bound.name, "owner-check");
        assert_eq!(bound.actions.len(), 1);
        assert_eq!(policy.document()["filters"][0]["tag:Account"], json!("{account_id}"));
    }

    #[test]
    fn test_select_reports_unknown_names() {
        let policies = parse_document("policies:\n  - name: a\n    resource: ec2\n").unwrap();
        assert_eq!(policies.select(&["a".into()]).unwrap().len(), 1);
        let err = policies.select(&["b".into()]).unwrap_err();
        assert!(err.issues[0].message.contains("'b'"));
    }
}
