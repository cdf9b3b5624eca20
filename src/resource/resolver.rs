//! Resource Resolver
//!
//! Lists and describes resources through a provider client and normalizes the
//! raw records into [`Resource`]s. Every lookup goes through the run's cache
//! layer first; provider calls are wrapped with timeout, retry and
//! cancellation.

use super::model::{scalar_text, tags_from_value, AttrPath, Resource};
use super::registry::{get_registry, qualify_for, ResourceDef};
use crate::cache::{CacheKey, CacheLayer, CacheValue, ResourceSet};
use crate::cancel::CancelSignal;
use crate::error::{CancellationError, ConfigurationError, CustodianError, ResolutionError, Result};
use crate::provider::{ListQuery, Page, ProviderClient, Scope};
use crate::retry::{with_retry, RetryError, RetryPolicy};
use serde_json::Value;
use std::sync::Arc;

/// Region name used for resource types that are not regional
pub const GLOBAL_REGION: &str = "global";

/// Resolver bound to one provider client and one run's cache
#[derive(Clone)]
pub struct Resolver {
    client: Arc<dyn ProviderClient>,
    cache: Arc<CacheLayer>,
    retry: RetryPolicy,
    cancel: CancelSignal,
}

impl Resolver {
    pub fn new(
        client: Arc<dyn ProviderClient>,
        cache: Arc<CacheLayer>,
        retry: RetryPolicy,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            client,
            cache,
            retry,
            cancel,
        }
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    pub fn client(&self) -> &Arc<dyn ProviderClient> {
        &self.client
    }

    /// Definition of a resource type, qualified against the client's provider
    pub fn definition(&self, resource_type: &str) -> Result<&'static ResourceDef> {
        let key = qualify_for(self.client.name(), resource_type);
        get_registry().resources.get(&key).ok_or_else(|| {
            ConfigurationError::single("resource", format!("unknown resource type '{}'", key)).into()
        })
    }

    /// Full listing of a resource type in a scope
    pub async fn resolve(&self, resource_type: &str, scope: &Scope) -> Result<Arc<ResourceSet>> {
        let def = self.definition(resource_type)?;
        let scope = effective_scope(def, scope);
        let key = CacheKey::listing(&scope, &def.key);
        let value = self
            .cache
            .get_or_fetch(&key, || self.fetch_all(def, &scope, None))
            .await?;
        resource_set(&key, &value)
    }

    /// Subset of a resource type by id.
    ///
    /// Served from the cached full listing when present, otherwise pushed down
    /// to the provider when the type supports an id filter.
    pub async fn resolve_ids(
        &self,
        resource_type: &str,
        scope: &Scope,
        ids: &[String],
    ) -> Result<Arc<ResourceSet>> {
        let def = self.definition(resource_type)?;
        let scope = effective_scope(def, scope);

        let listing = CacheKey::listing(&scope, &def.key);
        if let Some(set) = self.cache.peek(&listing).and_then(|v| v.resource_set()) {
            return Ok(Arc::new(set.select(ids)));
        }
        if !def.supports_id_filter() {
            let set = self.resolve(&def.key, &scope).await?;
            return Ok(Arc::new(set.select(ids)));
        }

        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();
        let key = CacheKey::new(&scope, &def.key, format!("ids:{}", sorted.join(",")));
        let value = self
            .cache
            .get_or_fetch(&key, || self.fetch_all(def, &scope, Some(sorted.clone())))
            .await?;
        resource_set(&key, &value)
    }

    /// Single resource by id; `None` when it does not exist
    pub async fn describe(
        &self,
        resource_type: &str,
        scope: &Scope,
        id: &str,
    ) -> Result<Option<Arc<Resource>>> {
        let def = self.definition(resource_type)?;
        let scope = effective_scope(def, scope);
        let key = CacheKey::new(&scope, &def.key, format!("id:{}", id));

        let value = self
            .cache
            .get_or_fetch(&key, || async {
                let client = self.client.clone();
                let rtype = def.key.clone();
                let call_scope = scope.clone();
                let id_owned = id.to_string();
                let raw = with_retry(
                    &self.retry,
                    &self.cancel,
                    &format!("describe {} {}", def.key, id),
                    move || {
                        let client = client.clone();
                        let rtype = rtype.clone();
                        let scope = call_scope.clone();
                        let id = id_owned.clone();
                        async move { client.describe(&rtype, &scope, &id).await }
                    },
                )
                .await
                .map_err(|e| resolution_error(def, &scope, e))?;

                let resources = raw.into_iter().filter_map(|r| normalize(def, &scope, r)).collect();
                Ok::<_, CustodianError>(CacheValue::Resources(Arc::new(ResourceSet::new(resources))))
            })
            .await?;

        Ok(resource_set(&key, &value)?.get(id).cloned())
    }

    /// Follow pagination until the provider stops returning a token
    async fn fetch_all(
        &self,
        def: &'static ResourceDef,
        scope: &Scope,
        ids: Option<Vec<String>>,
    ) -> Result<CacheValue> {
        let mut records: Vec<Value> = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self.fetch_page(def, scope, ids.clone(), page_token.clone()).await?;
            pages += 1;
            records.extend(page.items);

            match page.next_token {
                Some(token) if Some(&token) == page_token.as_ref() => {
                    tracing::warn!(
                        "{} in {}: provider repeated page token {}, stopping",
                        def.key,
                        scope,
                        token
                    );
                    break;
                },
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        let resources: Vec<Resource> = records
            .into_iter()
            .filter_map(|raw| normalize(def, scope, raw))
            .collect();
        tracing::debug!(
            "Resolved {} {} in {} ({} page(s))",
            resources.len(),
            def.key,
            scope,
            pages
        );
        Ok(CacheValue::Resources(Arc::new(ResourceSet::new(resources))))
    }

    async fn fetch_page(
        &self,
        def: &'static ResourceDef,
        scope: &Scope,
        ids: Option<Vec<String>>,
        page_token: Option<String>,
    ) -> Result<Page> {
        let client = self.client.clone();
        let rtype = def.key.clone();
        let call_scope = scope.clone();
        let query = ListQuery { ids, page_token };

        with_retry(&self.retry, &self.cancel, &format!("list {}", def.key), move || {
            let client = client.clone();
            let rtype = rtype.clone();
            let scope = call_scope.clone();
            let query = query.clone();
            async move { client.list(&rtype, &scope, &query).await }
        })
        .await
        .map_err(|e| resolution_error(def, scope, e))
    }
}

/// Scope a resource type is listed in: non-regional types use [`GLOBAL_REGION`]
pub fn effective_scope(def: &ResourceDef, scope: &Scope) -> Scope {
    if def.is_global && scope.region != GLOBAL_REGION {
        scope.with_region(GLOBAL_REGION)
    } else {
        scope.clone()
    }
}

fn resource_set(key: &CacheKey, value: &CacheValue) -> Result<Arc<ResourceSet>> {
    value.resource_set().ok_or_else(|| {
        ConfigurationError::single("cache", format!("entry {} does not hold resources", key)).into()
    })
}

fn resolution_error(def: &ResourceDef, scope: &Scope, error: RetryError) -> CustodianError {
    match error {
        RetryError::Cancelled => CancellationError::during("resolving").into(),
        RetryError::Exhausted { attempts, last } => ResolutionError {
            scope: scope.clone(),
            resource_type: def.key.clone(),
            attempts,
            source: last,
        }
        .into(),
        RetryError::Permanent { attempts, error } => ResolutionError {
            scope: scope.clone(),
            resource_type: def.key.clone(),
            attempts,
            source: error,
        }
        .into(),
    }
}

/// Turn a raw provider record into a [`Resource`]. Records without an id are
/// dropped with a warning.
pub fn normalize(def: &ResourceDef, scope: &Scope, raw: Value) -> Option<Resource> {
    let id = AttrPath::parse(&def.id_field)
        .ok()
        .and_then(|path| path.resolve(&raw).value().map(scalar_text))
        .filter(|id| !id.is_empty());
    let Some(id) = id else {
        tracing::warn!("Skipping {} record without {} in {}", def.key, def.id_field, scope);
        return None;
    };

    let tags = def
        .tags
        .as_ref()
        .map(|spec| tags_from_value(&raw, spec))
        .unwrap_or_default();
    Some(Resource::new(&id, &def.key, scope.clone(), raw).with_tags(tags))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::MemoryProvider;
    use serde_json::json;
    use std::time::Duration;

    fn scope() -> Scope {
        Scope::new("aws", "123", "us-east-1")
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            call_timeout: Duration::from_secs(5),
        }
    }

    fn resolver(provider: Arc<MemoryProvider>) -> Resolver {
        Resolver::new(provider, Arc::new(CacheLayer::new()), fast_retry(), CancelSignal::new())
    }

    fn seeded(count: usize) -> Arc<MemoryProvider> {
        let provider = MemoryProvider::new("aws").with_page_size(2);
        for i in 0..count {
            provider.insert(
                "ec2",
                json!({
                    "InstanceId": format!("i-{}", i),
                    "Tags": [{"Key": "Index", "Value": i.to_string()}]
                }),
            );
        }
        Arc::new(provider)
    }

    #[tokio::test]
    async fn test_resolve_paginates_and_normalizes() {
        let provider = seeded(5);
        let set = resolver(provider.clone()).resolve("ec2", &scope()).await.unwrap();

        assert_eq!(set.len(), 5);
        let r = set.get("i-3").unwrap();
        assert_eq!(r.resource_type, "aws.ec2");
        assert_eq!(r.tag("Index"), Some("3"));
        assert_eq!(provider.list_calls("ec2"), 3);
    }

    #[tokio::test]
    async fn test_second_resolve_is_cached() {
        let provider = seeded(3);
        let resolver = resolver(provider.clone());
        resolver.resolve("ec2", &scope()).await.unwrap();
        resolver.resolve("aws.ec2", &scope()).await.unwrap();
        assert_eq!(provider.list_calls("ec2"), 2);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_listing() {
        let provider = Arc::new(
            MemoryProvider::new("aws").with_list_delay(Duration::from_millis(50)),
        );
        provider.insert("ebs", json!({"VolumeId": "vol-1"}));
        let resolver = resolver(provider.clone());

        let (scope_a, scope_b) = (scope(), scope());
        let (a, b) = tokio::join!(
            resolver.resolve("ebs", &scope_a),
            resolver.resolve("ebs", &scope_b)
        );
        assert_eq!(a.unwrap().len(), 1);
        assert_eq!(b.unwrap().len(), 1);
        assert_eq!(provider.list_calls("ebs"), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let provider = seeded(1);
        provider.fail_next_lists(
            "ec2",
            vec![
                ProviderError::Transient("Throttling".into()),
                ProviderError::Transient("Throttling".into()),
            ],
        );
        let set = resolver(provider.clone()).resolve("ec2", &scope()).await.unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(provider.list_calls("ec2"), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_is_resolution_error() {
        let provider = seeded(1);
        provider.fail_next_lists(
            "ec2",
            vec![ProviderError::Transient("Throttling".into()); 3],
        );
        let err = resolver(provider).resolve("ec2", &scope()).await.unwrap_err();
        match err {
            CustodianError::Resolution(e) => {
                assert_eq!(e.attempts, 3);
                assert_eq!(e.resource_type, "aws.ec2");
                assert_eq!(e.scope, scope());
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_resolution() {
        let provider = seeded(1);
        let cancel = CancelSignal::new();
        cancel.cancel();
        let resolver = Resolver::new(provider, Arc::new(CacheLayer::new()), fast_retry(), cancel);
        let err = resolver.resolve("ec2", &scope()).await.unwrap_err();
        assert!(matches!(err, CustodianError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_resolve_ids_pushes_down_filter() {
        let provider = seeded(5);
        let resolver = resolver(provider.clone());
        let set = resolver
            .resolve_ids("ec2", &scope(), &["i-4".to_string(), "i-1".to_string()])
            .await
            .unwrap();
        let mut ids: Vec<&str> = set.iter().map(|r| r.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["i-1", "i-4"]);
        // two matching records fit in one page
        assert_eq!(provider.list_calls("ec2"), 1);
    }

    #[tokio::test]
    async fn test_describe() {
        let provider = seeded(2);
        let resolver = resolver(provider.clone());
        let found = resolver.describe("ec2", &scope(), "i-1").await.unwrap();
        assert_eq!(found.map(|r| r.id.clone()), Some("i-1".to_string()));
        assert!(resolver.describe("ec2", &scope(), "i-9").await.unwrap().is_none());
        assert_eq!(provider.describe_calls(), 2);
    }

    #[tokio::test]
    async fn test_global_types_use_global_region() {
        let provider = Arc::new(MemoryProvider::new("aws"));
        provider.insert("cloudtrail", json!({"Name": "main", "TrailARN": "arn:trail"}));
        let set = resolver(provider).resolve("cloudtrail", &scope()).await.unwrap();
        let trail = set.iter().next().unwrap();
        assert_eq!(trail.scope.region, GLOBAL_REGION);
    }

    #[test]
    fn test_normalize_skips_records_without_id() {
        let def = get_registry().resources.get("aws.ec2").unwrap();
        assert!(normalize(def, &scope(), json!({"State": {"Name": "running"}})).is_none());
    }
}
