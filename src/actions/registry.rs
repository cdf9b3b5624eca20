//! Action Registry
//!
//! Maps action type names to constructors. Besides the generic actions
//! registered here, every operation declared by the policy's resource type
//! (`stop`, `terminate`, ...) is available by its key.

use super::notify::NotifyAction;
use super::operations::{InvokeAction, ProviderOperation};
use super::tags::{MarkForOpAction, RemoveTagAction, TagAction};
use super::Action;
use crate::error::ConfigIssue;
use crate::resource::registry::ResourceDef;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

/// Builds an action from its options, validated against the policy's resource type
pub type ActionFactory =
    fn(&Map<String, Value>, &str, &'static ResourceDef) -> Result<Arc<dyn Action>, Vec<ConfigIssue>>;

#[derive(Clone, Default)]
pub struct ActionRegistry {
    factories: BTreeMap<&'static str, ActionFactory>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in action
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("tag", |options, location, resource| {
            Ok(Arc::new(TagAction::from_options(options, location, resource)?))
        });
        registry.register("remove-tag", |options, location, resource| {
            Ok(Arc::new(RemoveTagAction::from_options(options, location, resource)?))
        });
        registry.register("unmark", |options, location, resource| {
            Ok(Arc::new(RemoveTagAction::from_options(options, location, resource)?))
        });
        registry.register("mark-for-op", |options, location, resource| {
            Ok(Arc::new(MarkForOpAction::from_options(options, location, resource)?))
        });
        registry.register("invoke", |options, location, resource| {
            Ok(Arc::new(InvokeAction::from_options(options, location, resource)?))
        });
        registry.register("notify", |options, location, resource| {
            Ok(Arc::new(NotifyAction::from_options(options, location, resource)?))
        });
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: ActionFactory) {
        self.factories.insert(name, factory);
    }

    pub fn build(
        &self,
        name: &str,
        options: &Map<String, Value>,
        location: &str,
        resource: &'static ResourceDef,
    ) -> Result<Arc<dyn Action>, Vec<ConfigIssue>> {
        if let Some(factory) = self.factories.get(name) {
            return factory(options, location, resource);
        }
        if let Some(def) = resource.action(name) {
            return Ok(Arc::new(ProviderOperation::from_def(def, options, location)?));
        }
        Err(vec![ConfigIssue::new(
            location,
            format!(
                "unknown action '{}' for resource {} (known: {})",
                name,
                resource.key,
                self.names_for(resource).join(", ")
            ),
        )])
    }

    /// Parse one `actions` entry: a bare name or a mapping with `type`
    pub fn parse(
        &self,
        entry: &Value,
        location: &str,
        resource: &'static ResourceDef,
    ) -> Result<Arc<dyn Action>, Vec<ConfigIssue>> {
        match entry {
            Value::String(name) => self.build(name, &Map::new(), location, resource),
            Value::Object(map) => match map.get("type") {
                Some(Value::String(name)) => self.build(name, map, location, resource),
                Some(other) => Err(vec![ConfigIssue::new(
                    format!("{}.type", location),
                    format!("expected a string, got {}", other),
                )]),
                None => Err(vec![ConfigIssue::new(
                    format!("{}.type", location),
                    "missing required field",
                )]),
            },
            other => Err(vec![ConfigIssue::new(
                location,
                format!("expected an action name or mapping, got {}", other),
            )]),
        }
    }

    /// Parse a policy's `actions` sequence, collecting every issue
    pub fn parse_list(
        &self,
        entries: &[Value],
        location: &str,
        resource: &'static ResourceDef,
        issues: &mut Vec<ConfigIssue>,
    ) -> Vec<Arc<dyn Action>> {
        entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| {
                match self.parse(entry, &format!("{}[{}]", location, i), resource) {
                    Ok(action) => Some(action),
                    Err(mut errors) => {
                        issues.append(&mut errors);
                        None
                    },
                }
            })
            .collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Action names usable on a resource type
    pub fn names_for(&self, resource: &ResourceDef) -> Vec<String> {
        let mut names: Vec<String> = self.names().into_iter().map(String::from).collect();
        names.extend(resource.actions.iter().map(|a| a.key.clone()));
        names.sort();
        names.dedup();
        names
    }
}

static REGISTRY: OnceLock<ActionRegistry> = OnceLock::new();

/// Shared registry of the built-in actions
pub fn standard_registry() -> &'static ActionRegistry {
    REGISTRY.get_or_init(ActionRegistry::standard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::get_resource;
    use serde_json::json;

    #[test]
    fn test_string_and_mapping_entries() {
        let ec2 = get_resource("ec2").unwrap();
        let mut issues = Vec::new();
        let actions = standard_registry().parse_list(
            &[json!("stop"), json!({"type": "tag", "key": "a", "value": "b"})],
            "actions",
            ec2,
            &mut issues,
        );
        assert!(issues.is_empty(), "{:?}", issues);
        let names: Vec<&str> = actions.iter().map(|a| a.type_name()).collect();
        assert_eq!(names, vec!["stop", "tag"]);
    }

    #[test]
    fn test_every_issue_is_reported() {
        let vpc = get_resource("vpc").unwrap();
        let mut issues = Vec::new();
        standard_registry().parse_list(
            &[json!("terminate"), json!({"key": "x"}), json!(7)],
            "policies[0].actions",
            vpc,
            &mut issues,
        );
        let locations: Vec<&str> = issues.iter().map(|i| i.location.as_str()).collect();
        assert_eq!(
            locations,
            vec![
                "policies[0].actions[0]",
                "policies[0].actions[1].type",
                "policies[0].actions[2]"
            ]
        );
    }

    #[test]
    fn test_operations_follow_resource_type() {
        let names = standard_registry().names_for(get_resource("ec2").unwrap());
        for name in ["start", "stop", "terminate", "tag", "notify"] {
            assert!(names.contains(&name.to_string()), "missing {}", name);
        }
    }
}
