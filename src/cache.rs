//! Bounded on-disk HTTP response cache
//!
//! Each entry is two files named after the SHA-256 of the request URL: a
//! JSON metadata file and the raw response body. When the directory grows
//! beyond its size limit the oldest entries are evicted first. All access
//! goes through one async mutex so concurrent requests never observe a
//! half-written entry.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const META_SUFFIX: &str = ".meta.json";
const BODY_SUFFIX: &str = ".body";

/// Parsed `Cache-Control` directives relevant to a private client cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_store: bool,
    pub no_cache: bool,
    pub max_age: Option<u64>,
}

impl CacheControl {
    pub fn parse(value: &str) -> Self {
        let mut directives = Self::default();

        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            match directive.split_once('=') {
                Some(("max-age", secs)) => {
                    directives.max_age = secs.trim_matches('"').parse().ok();
                }
                Some(_) => {}
                None => match directive.as_str() {
                    "no-store" => directives.no_store = true,
                    "no-cache" => directives.no_cache = true,
                    _ => {}
                },
            }
        }

        directives
    }
}

/// A stored response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedResponse {
    pub url: String,
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
    pub stored_at: DateTime<Utc>,
    pub max_age: Option<u64>,
    pub must_revalidate: bool,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl CachedResponse {
    /// Whether the entry can be served without contacting the server
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        if self.must_revalidate {
            return false;
        }

        match self.max_age {
            Some(max_age) => {
                let max_age = i64::try_from(max_age).unwrap_or(i64::MAX);
                let age = now.signed_duration_since(self.stored_at);
                age < Duration::seconds(max_age)
            }
            None => false,
        }
    }

    /// Whether a conditional request can be built from the validators
    pub fn can_revalidate(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

#[derive(Debug)]
struct EntryFile {
    key: String,
    modified: SystemTime,
    size: u64,
}

/// Size-bounded response cache rooted in one directory
#[derive(Debug)]
pub struct ResponseCache {
    dir: PathBuf,
    max_size: u64,
    lock: Mutex<()>,
}

impl ResponseCache {
    /// Open (and create if needed) the cache directory
    pub fn open(dir: impl Into<PathBuf>, max_size: u64) -> Result<Self> {
        let dir = dir.into();

        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory: {:?}", dir))?;

        debug!("Opened response cache at {:?} ({} bytes max)", dir, max_size);

        Ok(Self {
            dir,
            max_size,
            lock: Mutex::new(()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Look up the entry stored for `url`
    pub async fn get(&self, url: &str) -> Option<CachedResponse> {
        let _guard = self.lock.lock().await;
        let key = cache_key(url);

        let meta = tokio::fs::read(self.meta_path(&key)).await.ok()?;
        let mut entry: CachedResponse = match serde_json::from_slice(&meta) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Discarding corrupt cache entry for {}: {}", url, e);
                self.remove_files(&key).await;
                return None;
            }
        };

        // Hash collisions are not worth serving
        if entry.url != url {
            return None;
        }

        entry.body = match tokio::fs::read(self.body_path(&key)).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Cache entry for {} has no readable body: {}", url, e);
                self.remove_files(&key).await;
                return None;
            }
        };

        Some(entry)
    }

    /// Store `entry`, evicting older entries to stay within the size limit
    pub async fn put(&self, entry: &CachedResponse) -> Result<()> {
        let _guard = self.lock.lock().await;
        let key = cache_key(&entry.url);

        let meta = serde_json::to_vec(entry).context("Failed to serialize cache entry")?;
        let size = (meta.len() + entry.body.len()) as u64;

        if size > self.max_size {
            debug!(
                "Response for {} ({} bytes) exceeds cache size, not storing",
                entry.url, size
            );
            self.remove_files(&key).await;
            return Ok(());
        }

        // Metadata goes last so a readable entry always has its body
        tokio::fs::write(self.body_path(&key), &entry.body)
            .await
            .with_context(|| format!("Failed to write cache body for {}", entry.url))?;
        tokio::fs::write(self.meta_path(&key), meta)
            .await
            .with_context(|| format!("Failed to write cache metadata for {}", entry.url))?;

        debug!("Cached response for {} ({} bytes)", entry.url, size);

        self.evict_to_limit(&key).await
    }

    /// Drop the entry stored for `url`
    pub async fn remove(&self, url: &str) {
        let _guard = self.lock.lock().await;
        self.remove_files(&cache_key(url)).await;
    }

    /// Remove every entry
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;

        let entries = self.entries().await?;
        let count = entries.len();
        for entry in entries {
            self.remove_files(&entry.key).await;
        }

        info!("Cleared {} cached responses from {:?}", count, self.dir);
        Ok(())
    }

    /// Total bytes currently used by complete entries
    pub async fn size(&self) -> Result<u64> {
        let _guard = self.lock.lock().await;
        Ok(self.entries().await?.iter().map(|e| e.size).sum())
    }

    pub async fn entry_count(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        Ok(self.entries().await?.len())
    }

    async fn evict_to_limit(&self, keep: &str) -> Result<()> {
        let mut entries = self.entries().await?;
        let mut total: u64 = entries.iter().map(|e| e.size).sum();

        if total <= self.max_size {
            return Ok(());
        }

        entries.sort_by_key(|e| e.modified);

        for entry in entries {
            if total <= self.max_size {
                break;
            }
            if entry.key == keep {
                continue;
            }
            debug!("Evicting cache entry {} ({} bytes)", entry.key, entry.size);
            self.remove_files(&entry.key).await;
            total = total.saturating_sub(entry.size);
        }

        Ok(())
    }

    async fn entries(&self) -> Result<Vec<EntryFile>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read cache directory: {:?}", self.dir))?;

        while let Some(item) = dir.next_entry().await? {
            let file_name = item.file_name();
            let Some(key) = file_name.to_str().and_then(|n| n.strip_suffix(META_SUFFIX)) else {
                continue;
            };

            let meta = item.metadata().await?;
            let body_size = tokio::fs::metadata(self.body_path(key))
                .await
                .map(|m| m.len())
                .unwrap_or(0);

            entries.push(EntryFile {
                key: key.to_string(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size: meta.len() + body_size,
            });
        }

        Ok(entries)
    }

    async fn remove_files(&self, key: &str) {
        for path in [self.meta_path(key), self.body_path(key)] {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove cache file {:?}: {}", path, e);
                }
            }
        }
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", key, META_SUFFIX))
    }

    fn body_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", key, BODY_SUFFIX))
    }
}

fn cache_key(url: &str) -> String {
    format!("{:x}", Sha256::digest(url.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(url: &str, body: &[u8]) -> CachedResponse {
        CachedResponse {
            url: url.to_string(),
            status: 200,
            etag: Some("\"abc\"".to_string()),
            last_modified: None,
            content_type: Some("application/json".to_string()),
            stored_at: Utc::now(),
            max_age: Some(60),
            must_revalidate: false,
            body: body.to_vec(),
        }
    }

    #[test]
    fn test_cache_control_parsing() {
        let cc = CacheControl::parse("private, max-age=60, s-maxage=60");
        assert_eq!(cc.max_age, Some(60));
        assert!(!cc.no_store);
        assert!(!cc.no_cache);

        let cc = CacheControl::parse("No-Store, no-cache");
        assert!(cc.no_store);
        assert!(cc.no_cache);
        assert_eq!(cc.max_age, None);

        assert_eq!(CacheControl::parse("max-age=abc").max_age, None);
    }

    #[test]
    fn test_freshness() {
        let now = Utc::now();
        let mut cached = entry("https://example.test/a", b"[]");
        cached.stored_at = now - Duration::seconds(30);

        assert!(cached.is_fresh(now));
        assert!(!cached.is_fresh(now + Duration::seconds(31)));

        cached.must_revalidate = true;
        assert!(!cached.is_fresh(now));

        cached.must_revalidate = false;
        cached.max_age = None;
        assert!(!cached.is_fresh(now));
        assert!(cached.can_revalidate());
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let dir = TempDir::new().unwrap();
        let cache = ResponseCache::open(dir.path(), 1024 * 1024).unwrap();

        let stored = entry("https://example.test/users/a/repos", br#"[{"name":"a"}]"#);
        cache.put(&stored).await.unwrap();

        let loaded = cache.get(&stored.url).await.expect("entry should exist");
        assert_eq!(loaded, stored);
        assert_eq!(cache.entry_count().await.unwrap(), 1);
        assert!(cache.get("https://example.test/other").await.is_none());
    }

    #[tokio::test]
    async fn test_eviction_keeps_within_limit() {
        let dir = TempDir::new().unwrap();
        let cache = ResponseCache::open(dir.path(), 2048).unwrap();

        for i in 0..10 {
            let url = format!("https://example.test/{}", i);
            cache.put(&entry(&url, &[b'x'; 500])).await.unwrap();
        }

        assert!(cache.size().await.unwrap() <= 2048);
        assert!(cache.entry_count().await.unwrap() < 10);
        assert!(cache.get("https://example.test/9").await.is_some());
    }

    #[tokio::test]
    async fn test_oversized_entry_not_stored() {
        let dir = TempDir::new().unwrap();
        let cache = ResponseCache::open(dir.path(), 100).unwrap();

        cache
            .put(&entry("https://example.test/big", &[0u8; 200]))
            .await
            .unwrap();

        assert_eq!(cache.entry_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_and_remove() {
        let dir = TempDir::new().unwrap();
        let cache = ResponseCache::open(dir.path(), 1024 * 1024).unwrap();

        cache.put(&entry("https://example.test/1", b"1")).await.unwrap();
        cache.put(&entry("https://example.test/2", b"2")).await.unwrap();

        cache.remove("https://example.test/1").await;
        assert_eq!(cache.entry_count().await.unwrap(), 1);

        cache.clear().await.unwrap();
        assert_eq!(cache.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_discarded() {
        let dir = TempDir::new().unwrap();
        let cache = ResponseCache::open(dir.path(), 1024 * 1024).unwrap();
        let url = "https://example.test/corrupt";

        let key = cache_key(url);
        std::fs::write(dir.path().join(format!("{}{}", key, META_SUFFIX)), b"not json").unwrap();

        assert!(cache.get(url).await.is_none());
        assert_eq!(cache.entry_count().await.unwrap(), 0);
    }
}
