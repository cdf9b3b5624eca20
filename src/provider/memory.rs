//! In-memory provider
//!
//! Serves raw records from memory (or from a fixture directory) through the
//! provider contract. Tag, remove-tag and delete style operations are applied
//! to the stored records so repeated runs observe earlier mutations. Failure
//! injection and call counters make it the test double for the engine.

use super::{ListQuery, MutationRequest, Page, ProviderClient, Scope, TargetOutcome};
use crate::error::ProviderError;
use crate::resource::model::{scalar_text, AttrPath};
use crate::resource::registry::{get_registry, qualify_for, ResourceDef, TagStyle};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Stored record, optionally pinned to one scope
#[derive(Debug, Clone)]
struct Record {
    scope: Option<Scope>,
    data: Value,
}

/// Fixture-backed provider
pub struct MemoryProvider {
    name: String,
    records: RwLock<HashMap<String, Vec<Record>>>,
    page_size: Option<usize>,
    list_delay: Option<Duration>,
    list_failures: RwLock<HashMap<String, VecDeque<ProviderError>>>,
    mutate_failures: RwLock<VecDeque<ProviderError>>,
    failing_targets: RwLock<HashSet<String>>,
    list_calls: RwLock<HashMap<String, usize>>,
    describe_calls: AtomicUsize,
    mutations: RwLock<Vec<MutationRequest>>,
}

impl MemoryProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: RwLock::new(HashMap::new()),
            page_size: None,
            list_delay: None,
            list_failures: RwLock::new(HashMap::new()),
            mutate_failures: RwLock::new(VecDeque::new()),
            failing_targets: RwLock::new(HashSet::new()),
            list_calls: RwLock::new(HashMap::new()),
            describe_calls: AtomicUsize::new(0),
            mutations: RwLock::new(Vec::new()),
        }
    }

    /// Load `<dir>/<type>.json` files, each holding an array of raw records
    pub fn from_fixture_dir(name: &str, dir: &Path) -> Result<Self> {
        let provider = Self::new(name);
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read fixture directory {}", dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read fixture {}", path.display()))?;
            let items: Vec<Value> = serde_json::from_str(&content)
                .with_context(|| format!("Fixture {} must be a JSON array", path.display()))?;
            tracing::debug!("Loaded {} {} record(s) from {}", items.len(), stem, path.display());
            for item in items {
                provider.insert(stem, item);
            }
        }
        Ok(provider)
    }

    /// Serve listings in pages of `size` records
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    /// Delay every listing call (used to exercise concurrent fills)
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = Some(delay);
        self
    }

    /// Add a record visible from every scope
    pub fn insert(&self, resource_type: &str, data: Value) {
        self.push_record(resource_type, None, data);
    }

    /// Add a record visible from one scope only
    pub fn insert_scoped(&self, resource_type: &str, scope: &Scope, data: Value) {
        self.push_record(resource_type, Some(scope.clone()), data);
    }

    fn push_record(&self, resource_type: &str, scope: Option<Scope>, data: Value) {
        let key = qualify_for(&self.name, resource_type);
        self.records
            .write()
            .entry(key)
            .or_default()
            .push(Record { scope, data });
    }

    /// Fail the next listing calls of a resource type with the given errors
    pub fn fail_next_lists(&self, resource_type: &str, errors: Vec<ProviderError>) {
        let key = qualify_for(&self.name, resource_type);
        self.list_failures
            .write()
            .entry(key)
            .or_default()
            .extend(errors);
    }

    /// Fail the next mutating calls with the given errors
    pub fn fail_next_mutations(&self, errors: Vec<ProviderError>) {
        self.mutate_failures.write().extend(errors);
    }

    /// Any batch containing this target fails as a whole
    pub fn fail_target(&self, id: &str) {
        self.failing_targets.write().insert(id.to_string());
    }

    pub fn list_calls(&self, resource_type: &str) -> usize {
        let key = qualify_for(&self.name, resource_type);
        self.list_calls.read().get(&key).copied().unwrap_or(0)
    }

    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    /// Mutating calls that reached this provider
    pub fn mutations(&self) -> Vec<MutationRequest> {
        self.mutations.read().clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.read().len()
    }

    /// Current raw record of a resource, if it still exists
    pub fn record(&self, resource_type: &str, id: &str) -> Option<Value> {
        let key = qualify_for(&self.name, resource_type);
        let def = get_registry().resources.get(&key)?;
        self.records
            .read()
            .get(&key)?
            .iter()
            .find(|r| record_id(def, &r.data).as_deref() == Some(id))
            .map(|r| r.data.clone())
    }

    fn definition(&self, resource_type: &str) -> Result<&'static ResourceDef, ProviderError> {
        let key = qualify_for(&self.name, resource_type);
        get_registry()
            .resources
            .get(&key)
            .ok_or_else(|| ProviderError::Permanent(format!("unsupported resource type {}", key)))
    }

    fn visible(&self, key: &str, scope: &Scope) -> Vec<Value> {
        self.records
            .read()
            .get(key)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.scope.as_ref().map_or(true, |s| s == scope))
                    .map(|r| r.data.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn apply(&self, def: &ResourceDef, request: &MutationRequest) {
        let mut records = self.records.write();
        let Some(entries) = records.get_mut(&def.key) else {
            return;
        };
        let targets: HashSet<&str> = request.targets.iter().map(|s| s.as_str()).collect();
        let is_target = |data: &Value| {
            record_id(def, data)
                .map(|id| targets.contains(id.as_str()))
                .unwrap_or(false)
        };

        match request.operation.as_str() {
            "tag" => {
                let Some(spec) = &def.tags else { return };
                let Some(tags) = request.params.get("tags").and_then(|t| t.as_object()) else {
                    return;
                };
                for entry in entries.iter_mut().filter(|r| is_target(&r.data)) {
                    for (key, value) in tags {
                        set_tag(&mut entry.data, &spec.path, spec.style, key, Some(value));
                    }
                }
            },
            "remove-tag" => {
                let Some(spec) = &def.tags else { return };
                let keys: Vec<String> = request
                    .params
                    .get("tags")
                    .and_then(|t| t.as_array())
                    .map(|arr| arr.iter().map(scalar_text).collect())
                    .unwrap_or_default();
                for entry in entries.iter_mut().filter(|r| is_target(&r.data)) {
                    for key in &keys {
                        set_tag(&mut entry.data, &spec.path, spec.style, key, None);
                    }
                }
            },
            op if def.action_by_method(op).is_some_and(|a| !a.continuable) => {
                entries.retain(|r| !is_target(&r.data));
            },
            _ => {},
        }
    }
}

fn record_id(def: &ResourceDef, data: &Value) -> Option<String> {
    let path = AttrPath::parse(&def.id_field).ok()?;
    path.resolve(data).value().map(scalar_text)
}

fn set_tag(data: &mut Value, path: &str, style: TagStyle, key: &str, value: Option<&Value>) {
    let Value::Object(map) = data else { return };
    match style {
        TagStyle::Map => {
            let slot = map
                .entry(path.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(tags) = slot {
                match value {
                    Some(v) => {
                        tags.insert(key.to_string(), v.clone());
                    },
                    None => {
                        tags.remove(key);
                    },
                }
            }
        },
        TagStyle::KeyValueList => {
            let slot = map
                .entry(path.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(tags) = slot {
                tags.retain(|t| t.get("Key").and_then(|k| k.as_str()) != Some(key));
                if let Some(v) = value {
                    tags.push(json!({"Key": key, "Value": v}));
                }
            }
        },
    }
}

#[async_trait]
impl ProviderClient for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(
        &self,
        resource_type: &str,
        scope: &Scope,
        query: &ListQuery,
    ) -> Result<Page, ProviderError> {
        let def = self.definition(resource_type)?;
        *self.list_calls.write().entry(def.key.clone()).or_default() += 1;

        if let Some(delay) = self.list_delay {
            tokio::time::sleep(delay).await;
        }

        let injected = self
            .list_failures
            .write()
            .get_mut(&def.key)
            .and_then(|q| q.pop_front());
        if let Some(error) = injected {
            return Err(error);
        }

        let mut items = self.visible(&def.key, scope);
        if let Some(ids) = &query.ids {
            let wanted: HashSet<&str> = ids.iter().map(|s| s.as_str()).collect();
            items.retain(|item| {
                record_id(def, item)
                    .map(|id| wanted.contains(id.as_str()))
                    .unwrap_or(false)
            });
        }

        let Some(page_size) = self.page_size else {
            return Ok(Page::last(items));
        };
        let offset = match &query.page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ProviderError::Permanent(format!("bad page token {}", token)))?,
            None => 0,
        };
        let end = (offset + page_size).min(items.len());
        let page = items.get(offset..end).map(|s| s.to_vec()).unwrap_or_default();
        let next_token = (end < items.len()).then(|| end.to_string());
        Ok(Page {
            items: page,
            next_token,
        })
    }

    async fn describe(
        &self,
        resource_type: &str,
        scope: &Scope,
        id: &str,
    ) -> Result<Option<Value>, ProviderError> {
        let def = self.definition(resource_type)?;
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .visible(&def.key, scope)
            .into_iter()
            .find(|item| record_id(def, item).as_deref() == Some(id)))
    }

    async fn mutate(&self, request: &MutationRequest) -> Result<Vec<TargetOutcome>, ProviderError> {
        let def = self.definition(&request.resource_type)?;
        self.mutations.write().push(request.clone());

        if let Some(error) = self.mutate_failures.write().pop_front() {
            return Err(error);
        }
        let failing = self.failing_targets.read();
        if let Some(bad) = request.targets.iter().find(|t| failing.contains(*t)) {
            return Err(ProviderError::Permanent(format!(
                "InvalidInstanceState: {} cannot be modified",
                bad
            )));
        }
        drop(failing);

        self.apply(def, request);
        Ok(request.targets.iter().map(|id| TargetOutcome::ok(id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope::new("aws", "123", "us-east-1")
    }

    #[tokio::test]
    async fn test_pagination() {
        let provider = MemoryProvider::new("aws").with_page_size(2);
        for i in 0..5 {
            provider.insert("ec2", json!({"InstanceId": format!("i-{}", i)}));
        }

        let first = provider.list("ec2", &scope(), &ListQuery::default()).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_token.as_deref(), Some("2"));

        let last = provider
            .list(
                "ec2",
                &scope(),
                &ListQuery {
                    ids: None,
                    page_token: Some("4".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(last.next_token.is_none());
        assert_eq!(provider.list_calls("ec2"), 2);
    }

    #[tokio::test]
    async fn test_scoped_records() {
        let provider = MemoryProvider::new("aws");
        provider.insert_scoped("ec2", &scope(), json!({"InstanceId": "i-1"}));
        let other = scope().with_region("eu-west-1");
        let page = provider.list("ec2", &other, &ListQuery::default()).await.unwrap();
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn test_tag_mutation_is_applied() {
        let provider = MemoryProvider::new("aws");
        provider.insert("ec2", json!({"InstanceId": "i-1", "Tags": []}));
        provider
            .mutate(&MutationRequest {
                operation: "tag".into(),
                resource_type: "aws.ec2".into(),
                scope: scope(),
                targets: vec!["i-1".into()],
                params: json!({"tags": {"Owner": "ops"}}),
            })
            .await
            .unwrap();

        let record = provider.record("ec2", "i-1").unwrap();
        assert_eq!(record["Tags"], json!([{"Key": "Owner", "Value": "ops"}]));
    }

    #[tokio::test]
    async fn test_terminate_removes_record() {
        let provider = MemoryProvider::new("aws");
        provider.insert("ec2", json!({"InstanceId": "i-1"}));
        provider
            .mutate(&MutationRequest {
                operation: "terminate_instances".into(),
                resource_type: "aws.ec2".into(),
                scope: scope(),
                targets: vec!["i-1".into()],
                params: Value::Null,
            })
            .await
            .unwrap();
        assert!(provider.record("ec2", "i-1").is_none());
    }

    #[tokio::test]
    async fn test_failing_target_fails_batch() {
        let provider = MemoryProvider::new("aws");
        provider.fail_target("i-2");
        let result = provider
            .mutate(&MutationRequest {
                operation: "stop_instances".into(),
                resource_type: "aws.ec2".into(),
                scope: scope(),
                targets: vec!["i-1".into(), "i-2".into()],
                params: Value::Null,
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Permanent(_))));
    }
}
