//! Filter Registry
//!
//! Maps filter type names to constructors. Names are resolved once, when a
//! policy is loaded; an unknown name is a configuration error. Related-resource
//! aliases declared by a resource type (`security-group`, `subnet`, ...) are
//! resolved against that type's definition.

use super::age::{AgeFilter, MarkedForOpFilter};
use super::event::EventFilter;
use super::missing::MissingFilter;
use super::related::RelatedFilter;
use super::value::ValueFilter;
use super::Filter;
use crate::error::ConfigIssue;
use crate::resource::registry::ResourceDef;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

/// Builds a filter from its options, validated against the policy's resource type
pub type FilterFactory =
    fn(&Map<String, Value>, &str, &'static ResourceDef) -> Result<Arc<dyn Filter>, Vec<ConfigIssue>>;

/// Registered filter types
#[derive(Clone, Default)]
pub struct FilterRegistry {
    factories: BTreeMap<&'static str, FilterFactory>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in filter
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("value", |options, location, _| {
            Ok(Arc::new(ValueFilter::from_options(options, location)?))
        });
        registry.register("age", |options, location, resource| {
            Ok(Arc::new(AgeFilter::from_options(options, location, resource)?))
        });
        registry.register("marked-for-op", |options, location, resource| {
            Ok(Arc::new(MarkedForOpFilter::from_options(options, location, resource)?))
        });
        registry.register("related", |options, location, resource| {
            Ok(Arc::new(RelatedFilter::from_options(None, options, location, resource)?))
        });
        registry.register("missing", |options, location, resource| {
            Ok(Arc::new(MissingFilter::from_options(options, location, resource)?))
        });
        registry.register("event", |options, location, _| {
            Ok(Arc::new(EventFilter::from_options(options, location)?))
        });
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: FilterFactory) {
        self.factories.insert(name, factory);
    }

    /// Construct a filter by type name
    pub fn build(
        &self,
        name: &str,
        options: &Map<String, Value>,
        location: &str,
        resource: &'static ResourceDef,
    ) -> Result<Arc<dyn Filter>, Vec<ConfigIssue>> {
        if let Some(factory) = self.factories.get(name) {
            return factory(options, location, resource);
        }
        if resource.related_def(name).is_some() {
            let filter = RelatedFilter::from_options(Some(name), options, location, resource)?;
            return Ok(Arc::new(filter));
        }
        Err(vec![ConfigIssue::new(
            location,
            format!("unknown filter type '{}' for resource {}", name, resource.key),
        )])
    }

    /// Generic filter type names
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Filter type names usable on a resource type
    pub fn names_for(&self, resource: &ResourceDef) -> Vec<String> {
        let mut names: Vec<String> = self.names().into_iter().map(String::from).collect();
        names.extend(resource.related.keys().cloned());
        names.sort();
        names
    }
}

static REGISTRY: OnceLock<FilterRegistry> = OnceLock::new();

/// Shared registry of the built-in filters
pub fn standard_registry() -> &'static FilterRegistry {
    REGISTRY.get_or_init(FilterRegistry::standard)
}
