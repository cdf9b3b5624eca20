//! Policy document loading
//!
//! ```yaml
//! policies:
//!   - name: stop-untagged
//!     resource: ec2
//!     mode:
//!       type: event
//!       events: [RunInstances]
//!       ids: detail.responseElements.instancesSet.items[].instanceId
//!     filters:
//!       - State.Name: running
//!       - "tag:Environment": absent
//!     actions:
//!       - type: mark-for-op
//!         op: stop
//!         days: 4
//!     max-resources: 50
//! ```
//!
//! Validation runs to completion and reports every offending field with its
//! location (`policies[0].filters[2].op`), never just the first.

use super::vars::Variables;
use super::{ExecutionMode, Policy, PolicyCollection, PolicyOptions};
use crate::error::{ConfigIssue, ConfigurationError};
use crate::filters::{BuildContext, FilterNode};
use crate::resource::model::AttrPath;
use crate::resource::registry::{get_registry, qualify};
use anyhow::Context;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

const KNOWN_FIELDS: &[&str] = &[
    "name",
    "resource",
    "description",
    "comment",
    "comments",
    "mode",
    "filters",
    "actions",
    "max-resources",
    "max-resources-percent",
    "dryrun",
    "tags",
];

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("static regex"))
}

/// Read and validate a policy file (YAML, or JSON by extension)
pub fn load_file(path: &Path) -> anyhow::Result<PolicyCollection> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy file {}", path.display()))?;
    let policies = parse_document(&content)?;
    tracing::info!("Loaded {} policy(ies) from {}", policies.len(), path.display());
    Ok(policies)
}

/// Parse and validate a policy document. JSON input is accepted as YAML.
pub fn parse_document(text: &str) -> Result<PolicyCollection, ConfigurationError> {
    let document: Value = serde_yaml::from_str(text)
        .map_err(|e| ConfigurationError::single("document", format!("not a valid document: {}", e)))?;
    from_value(&document)
}

/// Validate an already parsed document
pub fn from_value(document: &Value) -> Result<PolicyCollection, ConfigurationError> {
    let entries = match document.get("policies") {
        Some(Value::Array(entries)) => entries,
        Some(other) => {
            return Err(ConfigurationError::single(
                "policies",
                format!("expected a sequence, got {}", kind(other)),
            ))
        },
        None => return Err(ConfigurationError::single("policies", "missing required field")),
    };

    let mut issues = Vec::new();
    let mut policies = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (i, entry) in entries.iter().enumerate() {
        let location = format!("policies[{}]", i);
        if let Some(name) = entry.get("name").and_then(|v| v.as_str()) {
            if let Some(first) = seen.get(name) {
                issues.push(ConfigIssue::new(
                    format!("{}.name", location),
                    format!("duplicate policy name '{}' (first at policies[{}])", name, first),
                ));
            } else {
                seen.insert(name.to_string(), i);
            }
        }
        let variables = Variables::placeholders(
            entry.get("name").and_then(|v| v.as_str()).unwrap_or_default(),
        );
        if let Some(policy) = parse_policy(entry, &location, &variables, &mut issues) {
            policies.push(policy);
        }
    }

    if !issues.is_empty() {
        return Err(ConfigurationError::new(issues));
    }
    Ok(PolicyCollection::new(policies))
}

/// Build one policy, expanding variables in its filters and actions.
/// Returns `None` when anything was wrong; the issues are appended.
pub(super) fn parse_policy(
    entry: &Value,
    location: &str,
    variables: &Variables,
    issues: &mut Vec<ConfigIssue>,
) -> Option<Policy> {
    let Value::Object(map) = entry else {
        issues.push(ConfigIssue::new(
            location,
            format!("expected a policy mapping, got {}", kind(entry)),
        ));
        return None;
    };
    let before = issues.len();
    let field = |name: &str| format!("{}.{}", location, name);

    for key in map.keys() {
        if !KNOWN_FIELDS.contains(&key.as_str()) {
            issues.push(ConfigIssue::new(field(key), "unknown field"));
        }
    }

    let name = match map.get("name") {
        Some(Value::String(name)) if name_pattern().is_match(name) => Some(name.clone()),
        Some(Value::String(name)) => {
            issues.push(ConfigIssue::new(
                field("name"),
                format!("'{}' may only contain letters, digits, '-', '_' and '.'", name),
            ));
            None
        },
        Some(other) => {
            issues.push(ConfigIssue::new(field("name"), format!("expected a string, got {}", kind(other))));
            None
        },
        None => {
            issues.push(ConfigIssue::new(field("name"), "missing required field"));
            None
        },
    };

    let resource = match map.get("resource") {
        Some(Value::String(key)) => {
            let qualified = qualify(key);
            let def = get_registry().resources.get(&qualified);
            if def.is_none() {
                issues.push(ConfigIssue::new(
                    field("resource"),
                    format!("unknown resource type '{}'", key),
                ));
            }
            def
        },
        Some(other) => {
            issues.push(ConfigIssue::new(field("resource"), format!("expected a string, got {}", kind(other))));
            None
        },
        None => {
            issues.push(ConfigIssue::new(field("resource"), "missing required field"));
            None
        },
    };

    let description = match map.get("description") {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text.clone()),
        Some(other) => {
            issues.push(ConfigIssue::new(
                field("description"),
                format!("expected a string, got {}", kind(other)),
            ));
            None
        },
    };

    let mode = parse_mode(map.get("mode"), &field("mode"), issues);
    let options = parse_options(map, location, issues);

    let filter_entries = sequence(map.get("filters"), &field("filters"), issues);
    let action_entries = sequence(map.get("actions"), &field("actions"), issues);

    // Filters and actions are validated against the resource type, so they
    // can only be checked once it is known.
    let (filters, actions) = match resource {
        Some(resource) => {
            let filter_entries: Vec<Value> = filter_entries.iter().map(|v| variables.expand(v)).collect();
            let action_entries: Vec<Value> = action_entries.iter().map(|v| variables.expand(v)).collect();
            let build = BuildContext {
                resource,
                registry: crate::filters::standard_registry(),
            };
            let filters = FilterNode::parse_list(&filter_entries, &field("filters"), &build, issues);
            let actions = crate::actions::standard_registry().parse_list(
                &action_entries,
                &field("actions"),
                resource,
                issues,
            );
            (filters, actions)
        },
        None => (None, Vec::new()),
    };

    if issues.len() > before {
        return None;
    }
    Some(Policy {
        name: name?,
        resource: resource?,
        description,
        mode: mode?,
        filters,
        actions,
        options,
        document: entry.clone(),
        location: location.to_string(),
    })
}

fn parse_mode(value: Option<&Value>, location: &str, issues: &mut Vec<ConfigIssue>) -> Option<ExecutionMode> {
    let map = match value {
        None | Some(Value::Null) => return Some(ExecutionMode::Pull),
        Some(Value::String(name)) => {
            let mut map = Map::new();
            map.insert("type".to_string(), Value::String(name.clone()));
            map
        },
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            issues.push(ConfigIssue::new(location, format!("expected a mapping, got {}", kind(other))));
            return None;
        },
    };

    let type_location = format!("{}.type", location);
    match map.get("type").and_then(|v| v.as_str()) {
        None | Some("pull") => Some(ExecutionMode::Pull),
        Some("periodic") => match map.get("schedule").and_then(|v| v.as_str()) {
            Some(schedule) => Some(ExecutionMode::Periodic {
                schedule: schedule.to_string(),
            }),
            None => {
                issues.push(ConfigIssue::new(format!("{}.schedule", location), "missing required field"));
                None
            },
        },
        Some("event") | Some("cloudtrail") => {
            let mut ok = true;
            let events = match map.get("events") {
                None => Vec::new(),
                Some(Value::String(name)) => vec![name.clone()],
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(name) => Some(name.clone()),
                        // cloudtrail-style `{event: RunInstances, source: ..}`
                        Value::Object(spec) => spec.get("event").and_then(|v| v.as_str()).map(String::from),
                        _ => None,
                    })
                    .collect(),
                Some(other) => {
                    issues.push(ConfigIssue::new(
                        format!("{}.events", location),
                        format!("expected a sequence, got {}", kind(other)),
                    ));
                    ok = false;
                    Vec::new()
                },
            };
            let ids = match map.get("ids") {
                None => None,
                Some(Value::String(path)) => match AttrPath::parse(path) {
                    Ok(path) => Some(path),
                    Err(e) => {
                        issues.push(ConfigIssue::new(format!("{}.ids", location), e));
                        ok = false;
                        None
                    },
                },
                Some(other) => {
                    issues.push(ConfigIssue::new(
                        format!("{}.ids", location),
                        format!("expected a path, got {}", kind(other)),
                    ));
                    ok = false;
                    None
                },
            };
            ok.then_some(ExecutionMode::Event { events, ids })
        },
        Some(other) => {
            issues.push(ConfigIssue::new(
                type_location,
                format!("unknown mode '{}' (known: pull, periodic, event)", other),
            ));
            None
        },
    }
}

fn parse_options(map: &Map<String, Value>, location: &str, issues: &mut Vec<ConfigIssue>) -> PolicyOptions {
    let mut options = PolicyOptions::default();

    match map.get("max-resources") {
        None | Some(Value::Null) => {},
        Some(value) => match value.as_u64() {
            Some(n) => options.max_resources = Some(n as usize),
            None => issues.push(ConfigIssue::new(
                format!("{}.max-resources", location),
                format!("expected a non-negative integer, got {}", value),
            )),
        },
    }

    match map.get("max-resources-percent") {
        None | Some(Value::Null) => {},
        Some(value) => match value.as_f64() {
            Some(p) if (0.0..=100.0).contains(&p) => options.max_resources_percent = Some(p),
            _ => issues.push(ConfigIssue::new(
                format!("{}.max-resources-percent", location),
                format!("expected a number between 0 and 100, got {}", value),
            )),
        },
    }

    match map.get("dryrun") {
        None | Some(Value::Null) => {},
        Some(Value::Bool(flag)) => options.dry_run = *flag,
        Some(other) => issues.push(ConfigIssue::new(
            format!("{}.dryrun", location),
            format!("expected a boolean, got {}", kind(other)),
        )),
    }

    options
}

fn sequence(value: Option<&Value>, location: &str, issues: &mut Vec<ConfigIssue>) -> Vec<Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => {
            issues.push(ConfigIssue::new(location, format!("expected a sequence, got {}", kind(other))));
            Vec::new()
        },
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}
