//! The resource cache collaborator.
//!
//! The loader only talks to the [`ResourceCache`] trait. [`MemoryCache`] is the default
//! implementation: an in-memory moka cache with a TTL, optionally mirrored to a
//! directory so that it survives restarts.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::LoaderConfig;
use crate::error::CacheError;
use crate::types::{RawResource, ResourceType};
use crate::utils::fs::write_atomic;

/// Persistent storage for loaded resources, keyed by normalized URL.
///
/// Cache failures never fail a load, implementations log and carry on.
#[async_trait]
pub trait ResourceCache: Send + Sync + fmt::Debug {
    /// Looks up a resource.
    async fn get(&self, url: &str) -> Option<RawResource>;

    /// Stores a resource, replacing any previous value.
    async fn store(&self, url: &str, resource: RawResource);

    /// Removes all entries, or only the non-essential ones if `preserve_essential` is set,
    /// and returns how many were removed.
    async fn clear(&self, preserve_essential: bool) -> usize;

    /// Removes roughly `fraction` of the non-essential entries and returns how many
    /// were removed.
    async fn prune(&self, fraction: f64) -> usize;

    /// Loads previously persisted entries and returns how many were restored.
    async fn restore(&self) -> Result<usize, CacheError> {
        Ok(0)
    }

    /// The number of entries currently held.
    fn entry_count(&self) -> u64;
}

/// Essential entries survive `clear(true)` and are never pruned.
fn is_essential(url: &str) -> bool {
    ResourceType::from_url(url).is_critical()
}

#[derive(Clone, Debug)]
struct CachedItem {
    resource: RawResource,
    essential: bool,
    /// Insertion sequence number, lower is older.
    seq: u64,
}

/// Metadata written next to every persisted body.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMetadata {
    url: String,
    content_type: Option<String>,
    stored_at: DateTime<Utc>,
}

/// The default [`ResourceCache`].
pub struct MemoryCache {
    entries: moka::sync::Cache<String, CachedItem>,
    ttl: Duration,
    persist_dir: Option<PathBuf>,
    next_seq: AtomicU64,
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.entries.entry_count())
            .field("ttl", &self.ttl)
            .field("persist_dir", &self.persist_dir)
            .finish()
    }
}

impl MemoryCache {
    /// Creates a purely in-memory cache.
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            entries: moka::sync::Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            ttl,
            persist_dir: None,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Mirrors every stored entry into `dir`.
    pub fn with_persistence(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persist_dir = Some(dir.into());
        self
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        let cache = Self::new(config.cache_capacity, config.cache_ttl);
        match (&config.cache_dir, config.persist_cache) {
            (Some(dir), true) => cache.with_persistence(dir),
            _ => cache,
        }
    }

    fn insert(&self, url: &str, resource: RawResource) {
        let item = CachedItem {
            resource,
            essential: is_essential(url),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.entries.insert(url.to_owned(), item);
    }

    async fn persist(&self, dir: &Path, url: &str, resource: &RawResource) -> Result<(), CacheError> {
        let metadata = serde_json::to_vec(&EntryMetadata {
            url: url.to_owned(),
            content_type: resource.content_type.clone(),
            stored_at: Utc::now(),
        })?;
        let (body_path, meta_path) = entry_paths(dir, url);
        let body = resource.body.clone();

        // `restore` starts from the metadata, so the body has to be complete first
        tokio::task::spawn_blocking(move || {
            write_atomic(&body_path, &body)?;
            write_atomic(&meta_path, &metadata)
        })
        .await
        .map_err(io::Error::other)??;
        Ok(())
    }

    async fn unpersist(&self, url: &str) {
        let Some(dir) = &self.persist_dir else {
            return;
        };
        let (body_path, meta_path) = entry_paths(dir, url);
        for path in [body_path, meta_path] {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    let dynerr: &dyn std::error::Error = &e;
                    tracing::warn!(error = dynerr, path = %path.display(), "failed to remove cache file");
                }
            }
        }
    }

    async fn restore_entry(&self, meta_path: &Path) -> Result<bool, CacheError> {
        let metadata: EntryMetadata = serde_json::from_slice(&tokio::fs::read(meta_path).await?)?;
        let age = Utc::now()
            .signed_duration_since(metadata.stored_at)
            .to_std()
            .unwrap_or_default();
        if age >= self.ttl {
            self.unpersist(&metadata.url).await;
            return Ok(false);
        }

        let body_path = meta_path.with_file_name(format!("{}.bin", url_digest(&metadata.url)));
        let body = tokio::fs::read(&body_path).await?;
        self.insert(
            &metadata.url,
            RawResource {
                content_type: metadata.content_type,
                body: Bytes::from(body),
            },
        );
        Ok(true)
    }
}

fn url_digest(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

fn entry_paths(dir: &Path, url: &str) -> (PathBuf, PathBuf) {
    let digest = url_digest(url);
    (
        dir.join(format!("{digest}.bin")),
        dir.join(format!("{digest}.meta.json")),
    )
}

#[async_trait]
impl ResourceCache for MemoryCache {
    async fn get(&self, url: &str) -> Option<RawResource> {
        self.entries.get(url).map(|item| item.resource)
    }

    async fn store(&self, url: &str, resource: RawResource) {
        if let Some(dir) = &self.persist_dir {
            if let Err(e) = self.persist(dir, url, &resource).await {
                let dynerr: &dyn std::error::Error = &e;
                tracing::warn!(error = dynerr, url, "failed to persist cache entry");
            }
        }
        self.insert(url, resource);
    }

    async fn clear(&self, preserve_essential: bool) -> usize {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, item)| !(preserve_essential && item.essential))
            .map(|(url, _)| url.to_string())
            .collect();

        for url in &doomed {
            self.entries.invalidate(url);
            self.unpersist(url).await;
        }
        tracing::debug!(removed = doomed.len(), preserve_essential, "cleared resource cache");
        doomed.len()
    }

    async fn prune(&self, fraction: f64) -> usize {
        let mut candidates: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|(_, item)| !item.essential)
            .map(|(url, item)| (url.to_string(), item.seq))
            .collect();
        if candidates.is_empty() || fraction <= 0.0 {
            return 0;
        }

        // oldest first
        candidates.sort_by_key(|(_, seq)| *seq);
        let count = ((candidates.len() as f64) * fraction.min(1.0)).ceil() as usize;
        for (url, _) in candidates.iter().take(count) {
            self.entries.invalidate(url);
            self.unpersist(url).await;
        }
        tracing::debug!(removed = count, "pruned resource cache");
        count
    }

    async fn restore(&self) -> Result<usize, CacheError> {
        let Some(dir) = &self.persist_dir else {
            return Ok(0);
        };

        let mut read_dir = match tokio::fs::read_dir(dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut restored = 0;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let is_metadata = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(".meta.json"));
            if !is_metadata {
                continue;
            }

            match self.restore_entry(&path).await {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(e) => {
                    let dynerr: &dyn std::error::Error = &e;
                    tracing::warn!(error = dynerr, path = %path.display(), "skipping corrupt cache entry");
                }
            }
        }

        tracing::info!(restored, "restored persisted resource cache");
        Ok(restored)
    }

    fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(body: &'static str) -> RawResource {
        RawResource {
            content_type: Some("text/plain".into()),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    #[tokio::test]
    async fn test_clear_preserves_essential() {
        let cache = MemoryCache::new(100, Duration::from_secs(60));
        cache.store("https://cdn.test/app.js", raw("js")).await;
        cache.store("https://cdn.test/logo.png", raw("png")).await;

        assert_eq!(cache.clear(true).await, 1);
        assert!(cache.get("https://cdn.test/app.js").await.is_some());
        assert!(cache.get("https://cdn.test/logo.png").await.is_none());

        assert_eq!(cache.clear(false).await, 1);
        assert!(cache.get("https://cdn.test/app.js").await.is_none());
    }

    #[tokio::test]
    async fn test_prune_skips_essential() {
        let cache = MemoryCache::new(100, Duration::from_secs(60));
        cache.store("https://cdn.test/site.css", raw("css")).await;
        for i in 0..10 {
            cache
                .store(&format!("https://cdn.test/img-{i}.png"), raw("png"))
                .await;
        }

        let removed = cache.prune(0.3).await;
        assert_eq!(removed, 3);
        assert_eq!(cache.entry_count(), 8);
        assert!(cache.get("https://cdn.test/site.css").await.is_some());
        // the oldest images go first
        assert!(cache.get("https://cdn.test/img-0.png").await.is_none());
        assert!(cache.get("https://cdn.test/img-9.png").await.is_some());
    }

    #[tokio::test]
    async fn test_restore_from_disk() {
        let dir = tempfile::tempdir().unwrap();

        let cache = MemoryCache::new(100, Duration::from_secs(60)).with_persistence(dir.path());
        cache.store("https://cdn.test/a.json", raw("{}")).await;
        cache.store("https://cdn.test/b.txt", raw("hello")).await;
        drop(cache);

        let restored = MemoryCache::new(100, Duration::from_secs(60)).with_persistence(dir.path());
        assert_eq!(restored.restore().await.unwrap(), 2);
        assert_eq!(
            restored.get("https://cdn.test/b.txt").await,
            Some(raw("hello"))
        );
    }

    #[tokio::test]
    async fn test_concurrent_stores_persist_whole_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MemoryCache::new(100, Duration::from_secs(60)).with_persistence(dir.path());

        let bodies: Vec<String> = (0..16).map(|i| format!("body-{i}-").repeat(1000)).collect();
        futures::future::join_all(bodies.iter().map(|body| {
            cache.store(
                "https://cdn.test/shared.txt",
                RawResource {
                    content_type: None,
                    body: Bytes::from(body.clone()),
                },
            )
        }))
        .await;

        // a body and its metadata, no temporary files
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);

        let restored = MemoryCache::new(100, Duration::from_secs(60)).with_persistence(dir.path());
        assert_eq!(restored.restore().await.unwrap(), 1);
        let body = restored
            .get("https://cdn.test/shared.txt")
            .await
            .unwrap()
            .body;
        assert!(bodies.iter().any(|expected| expected.as_bytes() == body));
    }

    #[tokio::test]
    async fn test_restore_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MemoryCache::new(100, Duration::from_secs(60))
            .with_persistence(dir.path().join("does-not-exist"));
        assert_eq!(cache.restore().await.unwrap(), 0);
    }
}
