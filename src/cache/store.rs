//! External cache store
//!
//! Persists cache entries across runs. The engine works the same without a
//! store, only with more provider calls. Store failures are logged by the
//! cache layer and never fail a fill.

use super::{CacheKey, CacheValue, ResourceSet};
use crate::resource::model::Resource;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Persistence collaborator for cache entries
pub trait CacheStore: Send + Sync {
    /// Stored value for `key`, `None` when missing or stale
    fn load(&self, key: &CacheKey) -> Result<Option<CacheValue>>;
    fn save(&self, key: &CacheKey, value: &CacheValue) -> Result<()>;
    fn remove(&self, key: &CacheKey) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
enum StoredValue {
    Resources(Vec<Resource>),
    Blob(Value),
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    stored_at: DateTime<Utc>,
    value: StoredValue,
}

/// One JSON file per key under a cache directory
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
    max_age: Duration,
}

impl FileCacheStore {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
        }
    }

    /// Default location: `<cache dir>/custodian`
    pub fn default_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|d| d.join("custodian"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        let name = format!(
            "{}_{}_{}_{}_{}.json",
            key.provider, key.account, key.region, key.resource_type, key.query
        );
        self.dir.join(urlencoding::encode(&name).into_owned())
    }
}

impl CacheStore for FileCacheStore {
    fn load(&self, key: &CacheKey) -> Result<Option<CacheValue>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cache file {}", path.display()))?;
        let entry: StoredEntry = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse cache file {}", path.display()))?;

        let age = Utc::now().signed_duration_since(entry.stored_at);
        let max_age = chrono::Duration::from_std(self.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        if age > max_age {
            tracing::debug!("Cache file {} is stale ({}s old)", path.display(), age.num_seconds());
            return Ok(None);
        }

        Ok(Some(match entry.value {
            StoredValue::Resources(resources) => CacheValue::Resources(Arc::new(ResourceSet::new(resources))),
            StoredValue::Blob(value) => CacheValue::Blob(value),
        }))
    }

    fn save(&self, key: &CacheKey, value: &CacheValue) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create cache directory {}", self.dir.display()))?;
        let value = match value {
            CacheValue::Resources(set) => {
                StoredValue::Resources(set.iter().map(|r| r.as_ref().clone()).collect())
            },
            CacheValue::Blob(value) => StoredValue::Blob(value.clone()),
        };
        let entry = StoredEntry {
            stored_at: Utc::now(),
            value,
        };
        let path = self.path_for(key);
        let content = serde_json::to_string(&entry).context("Failed to serialize cache entry")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write cache file {}", path.display()))?;
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove cache file {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLayer;
    use crate::provider::Scope;
    use serde_json::json;

    fn key() -> CacheKey {
        CacheKey::listing(&Scope::new("aws", "123", "us-east-1"), "aws.ec2")
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path(), Duration::from_secs(600));
        let set = ResourceSet::new(vec![Resource::new(
            "i-1",
            "aws.ec2",
            Scope::new("aws", "123", "us-east-1"),
            json!({"InstanceId": "i-1"}),
        )]);

        store.save(&key(), &CacheValue::Resources(Arc::new(set))).unwrap();
        let loaded = store.load(&key()).unwrap().expect("entry should load");
        let loaded = loaded.as_resources().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains("i-1"));

        store.remove(&key()).unwrap();
        assert!(store.load(&key()).unwrap().is_none());
    }

    #[test]
    fn test_stale_entries_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path(), Duration::ZERO);
        store.save(&key(), &CacheValue::Blob(json!(1))).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.load(&key()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_layer_reads_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCacheStore::new(dir.path(), Duration::from_secs(600)));
        store.save(&key(), &CacheValue::Blob(json!("persisted"))).unwrap();

        let cache = CacheLayer::new().with_store(store);
        let value = cache
            .get_or_fetch(&key(), || async { Err::<CacheValue, String>("should not fetch".into()) })
            .await
            .unwrap();
        assert_eq!(value.as_blob(), Some(&json!("persisted")));
        assert_eq!(cache.stats().store_hits, 1);
    }
}
