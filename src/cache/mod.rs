//! Run-scoped Cache Layer
//!
//! Key-value store shared by the resolver, filters and actions of one run.
//! Keys are `(provider, account, region, resource-type, query)`; values are
//! resource sets or opaque data blobs.
//!
//! Fills are single-flight: the first caller for a key runs the fetch, every
//! concurrent caller for the same key awaits that fetch instead of issuing its
//! own. A failed fill is not cached. Reads never block each other.
//!
//! # Module Structure
//!
//! - [`store`] - Optional persistence across runs

pub mod store;

use crate::provider::Scope;
use crate::resource::model::Resource;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

use dashmap::DashMap;

pub use store::{CacheStore, FileCacheStore};

/// Query key of a full listing
pub const FULL_LISTING: &str = "*";

/// Cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub provider: String,
    pub account: String,
    pub region: String,
    pub resource_type: String,
    pub query: String,
}

impl CacheKey {
    pub fn new(scope: &Scope, resource_type: &str, query: impl Into<String>) -> Self {
        Self {
            provider: scope.provider.clone(),
            account: scope.account.clone(),
            region: scope.region.clone(),
            resource_type: resource_type.to_string(),
            query: query.into(),
        }
    }

    /// Key of the full listing of a resource type
    pub fn listing(scope: &Scope, resource_type: &str) -> Self {
        Self::new(scope, resource_type, FULL_LISTING)
    }

    fn in_scope(&self, scope: &Scope) -> bool {
        self.provider == scope.provider && self.account == scope.account && self.region == scope.region
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}?{}",
            self.provider, self.account, self.region, self.resource_type, self.query
        )
    }
}

/// Immutable set of resources with an id index
#[derive(Debug, Clone, Default)]
pub struct ResourceSet {
    resources: Vec<Arc<Resource>>,
    index: HashMap<String, usize>,
}

impl ResourceSet {
    pub fn new(resources: Vec<Resource>) -> Self {
        Self::from_shared(resources.into_iter().map(Arc::new).collect())
    }

    pub fn from_shared(resources: Vec<Arc<Resource>>) -> Self {
        let mut index = HashMap::with_capacity(resources.len());
        for (i, r) in resources.iter().enumerate() {
            if index.insert(r.id.clone(), i).is_some() {
                tracing::warn!("Duplicate resource id {} in {}", r.id, r.resource_type);
            }
        }
        Self { resources, index }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Resource>> {
        self.index.get(id).map(|&i| &self.resources[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Resource>> {
        self.resources.iter()
    }

    pub fn resources(&self) -> &[Arc<Resource>] {
        &self.resources
    }

    /// Subset with the given ids, in listing order
    pub fn select(&self, ids: &[String]) -> Self {
        let wanted: std::collections::HashSet<&str> = ids.iter().map(|s| s.as_str()).collect();
        Self::from_shared(
            self.resources
                .iter()
                .filter(|r| wanted.contains(r.id.as_str()))
                .cloned()
                .collect(),
        )
    }
}

/// Cached value
#[derive(Debug, Clone)]
pub enum CacheValue {
    Resources(Arc<ResourceSet>),
    Blob(Value),
}

impl CacheValue {
    pub fn as_resources(&self) -> Option<&ResourceSet> {
        match self {
            Self::Resources(set) => Some(set.as_ref()),
            Self::Blob(_) => None,
        }
    }

    /// Shared handle on a cached resource set
    pub fn resource_set(&self) -> Option<Arc<ResourceSet>> {
        match self {
            Self::Resources(set) => Some(set.clone()),
            Self::Blob(_) => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Value> {
        match self {
            Self::Blob(value) => Some(value),
            Self::Resources(_) => None,
        }
    }
}

/// Value plus fetch timestamp
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Arc<CacheValue>,
    fetched_at: Instant,
}

/// Per-key fill slot. The cell is initialized at most once.
#[derive(Debug, Default)]
struct Slot {
    cell: OnceCell<CacheEntry>,
}

/// Hit/miss counters
#[derive(Debug, Default)]
struct Stats {
    hits: AtomicU64,
    fills: AtomicU64,
    store_hits: AtomicU64,
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub fills: u64,
    pub store_hits: u64,
    pub entries: usize,
}

/// Run-scoped cache handle (cheap to share behind an `Arc`)
pub struct CacheLayer {
    slots: DashMap<CacheKey, Arc<Slot>>,
    ttl: Option<Duration>,
    store: Option<Arc<dyn CacheStore>>,
    stats: Stats,
}

impl Default for CacheLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheLayer {
    /// In-run cache without expiry or persistence
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            ttl: None,
            store: None,
            stats: Stats::default(),
        }
    }

    /// Expire entries older than `ttl`
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Consult and feed an external store on fills
    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn expired(&self, entry: &CacheEntry) -> bool {
        self.ttl
            .map(|ttl| entry.fetched_at.elapsed() >= ttl)
            .unwrap_or(false)
    }

    /// Slot for `key`, replacing an expired one.
    ///
    /// The map guard is released before returning so no shard lock is held
    /// across an await.
    fn slot(&self, key: &CacheKey) -> Arc<Slot> {
        let slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Slot::default()))
            .clone();

        let stale = slot.cell.get().is_some_and(|entry| self.expired(entry));
        if !stale {
            return slot;
        }
        tracing::debug!("Cache entry expired: {}", key);
        self.slots.remove_if(key, |_, current| Arc::ptr_eq(current, &slot));
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Slot::default()))
            .clone()
    }

    /// Cached value for `key` if present and fresh
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<CacheValue>> {
        let slot = self.slots.get(key)?.clone();
        let entry = slot.cell.get()?;
        if self.expired(entry) {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Return the cached value for `key`, or run `fetch` to fill it.
    ///
    /// Concurrent callers for the same key share one fetch. If the fetch
    /// fails, the error goes to the caller that ran it and the slot stays
    /// empty; a waiting caller then runs its own fetch.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &CacheKey, fetch: F) -> Result<Arc<CacheValue>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheValue, E>>,
    {
        let slot = self.slot(key);
        let filled_here = AtomicBool::new(false);
        let filled = &filled_here;

        let entry = slot
            .cell
            .get_or_try_init::<E, _, _>(|| async move {
                filled.store(true, Ordering::Relaxed);
                if let Some(value) = self.load_from_store(key) {
                    return Ok(CacheEntry {
                        value: Arc::new(value),
                        fetched_at: Instant::now(),
                    });
                }

                tracing::debug!("Cache miss: {}", key);
                let value = fetch().await?;
                self.stats.fills.fetch_add(1, Ordering::Relaxed);
                self.save_to_store(key, &value);
                Ok(CacheEntry {
                    value: Arc::new(value),
                    fetched_at: Instant::now(),
                })
            })
            .await?;

        if !filled_here.load(Ordering::Relaxed) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Cache hit: {}", key);
        }
        Ok(entry.value.clone())
    }

    fn load_from_store(&self, key: &CacheKey) -> Option<CacheValue> {
        let store = self.store.as_ref()?;
        match store.load(key) {
            Ok(Some(value)) => {
                self.stats.store_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache store hit: {}", key);
                Some(value)
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Cache store read failed for {}: {:#}", key, e);
                None
            },
        }
    }

    fn save_to_store(&self, key: &CacheKey, value: &CacheValue) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(key, value) {
            tracing::warn!("Cache store write failed for {}: {:#}", key, e);
        }
    }

    /// Drop one entry
    pub fn invalidate(&self, key: &CacheKey) {
        if self.slots.remove(key).is_some() {
            tracing::debug!("Cache invalidated: {}", key);
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(key) {
                tracing::warn!("Cache store remove failed for {}: {:#}", key, e);
            }
        }
    }

    /// Drop every entry of a resource type in a scope (all query keys)
    pub fn invalidate_resource_type(&self, scope: &Scope, resource_type: &str) {
        let keys: Vec<CacheKey> = self
            .slots
            .iter()
            .filter(|e| e.key().in_scope(scope) && e.key().resource_type == resource_type)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            self.invalidate(&key);
        }
    }

    /// Discard all in-run entries (run teardown). The external store is kept.
    pub fn clear(&self) {
        let count = self.slots.len();
        self.slots.clear();
        tracing::debug!("Cache cleared ({} entries)", count);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            fills: self.stats.fills.load(Ordering::Relaxed),
            store_hits: self.stats.store_hits.load(Ordering::Relaxed),
            entries: self.slots.len(),
        }
    }
}
