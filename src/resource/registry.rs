//! Resource Registry - Load resource definitions from JSON
//!
//! This module loads all resource type definitions from embedded JSON files
//! and provides lookup functions for the rest of the engine. Resource types
//! are addressed as `<provider>.<type>`; a bare type name refers to the
//! default provider.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

/// Provider assumed when a resource type carries no prefix
pub const DEFAULT_PROVIDER: &str = "aws";

/// Embedded resource JSON files (compiled into the binary)
const RESOURCE_FILES: &[&str] = &[
    include_str!("../resources/aws.json"),
    include_str!("../resources/gcp.json"),
];

/// How a resource type stores its tags
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TagStyle {
    /// `[{"Key": "k", "Value": "v"}, ...]`
    #[default]
    KeyValueList,
    /// `{"k": "v", ...}`
    Map,
}

/// Tag layout of a resource type
#[derive(Debug, Clone, Deserialize)]
pub struct TagSpec {
    /// Attribute holding the tags
    pub path: String,
    #[serde(default)]
    pub style: TagStyle,
}

/// Related resource join declared by a resource type
#[derive(Debug, Clone, Deserialize)]
pub struct RelatedDef {
    /// Related resource type (same provider)
    pub resource: String,
    /// Path expression producing the related ids, e.g. `SecurityGroups[].GroupId`
    pub ids: String,
}

/// State pre-condition of a provider operation
#[derive(Debug, Clone, Deserialize)]
pub struct StateRequirement {
    pub path: String,
    pub values: Vec<String>,
}

/// Provider operation exposed as an action
#[derive(Debug, Clone, Deserialize)]
pub struct ActionDef {
    /// Action type name used in policies
    pub key: String,
    pub display_name: String,
    /// Provider operation passed to `mutate`
    pub sdk_method: String,
    /// Preferred number of targets per provider call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// False when later actions on a handled resource are meaningless
    #[serde(default = "default_true")]
    pub continuable: bool,
    /// Resources outside these states are rejected before the call
    #[serde(default)]
    pub requires: Option<StateRequirement>,
}

fn default_batch_size() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Resource definition from JSON
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceDef {
    /// Qualified key, e.g. `aws.ec2` (filled in at load time)
    #[serde(skip)]
    pub key: String,
    /// Provider name (filled in at load time)
    #[serde(skip)]
    pub provider: String,
    pub display_name: String,
    pub service: String,
    /// Listing method of the provider API
    pub sdk_method: String,
    #[serde(default)]
    pub sdk_method_params: Value,
    /// Path of the record list inside a listing response
    pub response_path: String,
    pub id_field: String,
    pub name_field: String,
    /// Creation timestamp attribute, used by the `age` filter
    #[serde(default)]
    pub date_field: Option<String>,
    /// Method to call when fetching details for a single resource
    #[serde(default)]
    pub detail_sdk_method: Option<String>,
    /// Listing parameter accepting resource ids, when the API supports it
    #[serde(default)]
    pub id_filter_param: Option<String>,
    #[serde(default)]
    pub is_global: bool,
    #[serde(default)]
    pub tags: Option<TagSpec>,
    #[serde(default)]
    pub related: BTreeMap<String, RelatedDef>,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
}

impl ResourceDef {
    /// Unqualified type name, e.g. `ec2`
    pub fn type_name(&self) -> &str {
        self.key
            .split_once('.')
            .map(|(_, name)| name)
            .unwrap_or(&self.key)
    }

    pub fn action(&self, key: &str) -> Option<&ActionDef> {
        self.actions.iter().find(|a| a.key == key)
    }

    /// Lookup by action key or provider operation name
    pub fn action_by_method(&self, op: &str) -> Option<&ActionDef> {
        self.actions
            .iter()
            .find(|a| a.key == op || a.sdk_method == op)
    }

    pub fn related_def(&self, key: &str) -> Option<&RelatedDef> {
        self.related.get(key)
    }

    pub fn supports_id_filter(&self) -> bool {
        self.id_filter_param.is_some()
    }

    pub fn taggable(&self) -> bool {
        self.tags.is_some()
    }
}

/// Root structure of resources/*.json
#[derive(Debug, Clone, Deserialize)]
struct ResourceFile {
    provider: String,
    #[serde(default)]
    resources: HashMap<String, ResourceDef>,
}

/// All known resource types
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    pub resources: BTreeMap<String, ResourceDef>,
}

/// Global registry loaded from JSON
static REGISTRY: OnceLock<ResourceRegistry> = OnceLock::new();

/// Get the resource registry (loads from embedded JSON on first access)
pub fn get_registry() -> &'static ResourceRegistry {
    REGISTRY.get_or_init(|| {
        let mut registry = ResourceRegistry::default();

        for content in RESOURCE_FILES {
            let file: ResourceFile = serde_json::from_str(content)
                .unwrap_or_else(|e| panic!("Failed to parse embedded resource JSON: {}", e));
            for (name, mut def) in file.resources {
                def.key = format!("{}.{}", file.provider, name);
                def.provider = file.provider.clone();
                registry.resources.insert(def.key.clone(), def);
            }
        }

        registry
    })
}

/// Qualify a resource type name with the default provider when needed
pub fn qualify(key: &str) -> String {
    if key.contains('.') {
        key.to_string()
    } else {
        format!("{}.{}", DEFAULT_PROVIDER, key)
    }
}

/// Qualify a resource type name relative to a provider
pub fn qualify_for(provider: &str, key: &str) -> String {
    if key.contains('.') {
        key.to_string()
    } else {
        format!("{}.{}", provider, key)
    }
}

/// Get a resource definition by key (`aws.ec2` or `ec2`)
pub fn get_resource(key: &str) -> Option<&'static ResourceDef> {
    get_registry().resources.get(&qualify(key))
}

/// Get all qualified resource keys
pub fn get_all_resource_keys() -> Vec<&'static str> {
    get_registry()
        .resources
        .keys()
        .map(|s| s.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_loads_successfully() {
        let registry = get_registry();
        assert!(
            !registry.resources.is_empty(),
            "Registry should have resources"
        );
    }

    #[test]
    fn test_ec2_resource_exists() {
        let resource = get_resource("ec2").expect("ec2 should exist");
        assert_eq!(resource.key, "aws.ec2");
        assert_eq!(resource.provider, "aws");
        assert_eq!(resource.type_name(), "ec2");
        assert_eq!(resource.id_field, "InstanceId");
        assert!(resource.taggable());
    }

    #[test]
    fn test_qualified_lookup() {
        assert!(get_resource("aws.ebs").is_some());
        assert!(get_resource("gcp.instance").is_some());
        assert!(get_resource("instance").is_none());
    }

    #[test]
    fn test_related_definitions_point_at_known_types() {
        for def in get_registry().resources.values() {
            for (name, related) in &def.related {
                let target = qualify_for(&def.provider, &related.resource);
                assert!(
                    get_registry().resources.contains_key(&target),
                    "{} related filter {} references unknown {}",
                    def.key,
                    name,
                    target
                );
            }
        }
    }

    #[test]
    fn test_terminate_is_not_continuable() {
        let ec2 = get_resource("ec2").unwrap();
        let terminate = ec2.action("terminate").expect("terminate action");
        assert!(!terminate.continuable);
        let stop = ec2.action("stop").expect("stop action");
        assert!(stop.continuable);
        assert!(stop.requires.is_some());
    }

    #[test]
    fn test_get_all_resource_keys() {
        let keys = get_all_resource_keys();
        assert!(keys.contains(&"aws.ec2"), "Should contain aws.ec2");
        assert!(keys.contains(&"gcp.bucket"), "Should contain gcp.bucket");
    }
}
