//! Time-boxed JSON cache on disk.
//!
//! A cache file is valid while `now - mtime` is below the cache interval.
//! A file modified in the future is never valid. Reads and writes share a
//! process wide limit on open cache files.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error};

use crate::error::AgentResult;

/// Concurrently open cache files.
const OPEN_CACHE_FILES: usize = 10;

lazy_static! {
    static ref OPEN_CACHE_SEMAPHORE: Semaphore = Semaphore::new(OPEN_CACHE_FILES);
}

/// Replace characters that are not safe in a single path component.
pub fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "-_.() ".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Whether the file at `path` is younger than `interval`.
pub async fn cache_is_valid(path: &Path, interval: Duration) -> bool {
    let modified = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => {
            debug!("No cache file: {}", path.display());
            return false;
        }
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => {
            let valid = age < interval;
            debug!(
                "Cache {} is {}s old, valid for {}s: {}",
                path.display(),
                age.as_secs(),
                interval.as_secs(),
                valid
            );
            valid
        }
        Err(_) => {
            debug!("Cache {} was modified in the future", path.display());
            false
        }
    }
}

async fn read_cache(path: &Path) -> AgentResult<Value> {
    let _permit = OPEN_CACHE_SEMAPHORE
        .acquire()
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

async fn write_cache(path: &Path, data: &Value) -> AgentResult<()> {
    let _permit = OPEN_CACHE_SEMAPHORE
        .acquire()
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, serde_json::to_vec(data)?).await?;
    Ok(())
}

/// A data source whose results are cached in one file.
#[async_trait]
pub trait DataCache: Send + Sync {
    fn cache_file(&self) -> PathBuf;

    fn cache_interval(&self) -> Duration;

    /// Propagate cache I/O failures instead of logging them.
    fn debug(&self) -> bool;

    async fn get_live_data(&self) -> AgentResult<Value>;

    /// Cached data when valid and `use_cache`, live data otherwise. Live
    /// data is written back to the cache.
    async fn get_data(&self, use_cache: bool) -> AgentResult<Value> {
        let path = self.cache_file();
        if use_cache && cache_is_valid(&path, self.cache_interval()).await {
            debug!("Reading data from cache: {}", path.display());
            match read_cache(&path).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    error!("Getting live data (failed to read from cache: {}).", e);
                    if self.debug() {
                        return Err(e);
                    }
                }
            }
        }

        let live_data = self.get_live_data().await?;
        if let Err(e) = write_cache(&path, &live_data).await {
            error!("Failed to write data to cache file: {}", e);
            if self.debug() {
                return Err(e);
            }
        }
        Ok(live_data)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCache {
        file: PathBuf,
        interval: Duration,
        fetches: AtomicUsize,
        debug: bool,
    }

    impl CountingCache {
        fn new(dir: &Path) -> Self {
            Self {
                file: dir.join("cache-id").join("sub").join("westeurope_Microsoft.Network_loadBalancers").join("ByteCount"),
                interval: Duration::from_secs(300),
                fetches: AtomicUsize::new(0),
                debug: false,
            }
        }
    }

    #[async_trait]
    impl DataCache for CountingCache {
        fn cache_file(&self) -> PathBuf {
            self.file.clone()
        }

        fn cache_interval(&self) -> Duration {
            self.interval
        }

        fn debug(&self) -> bool {
            self.debug
        }

        async fn get_live_data(&self) -> AgentResult<Value> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"fetch": n}))
        }
    }

    #[tokio::test]
    async fn second_read_within_interval_uses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CountingCache::new(dir.path());
        assert_eq!(cache.get_data(true).await.unwrap(), json!({"fetch": 0}));
        assert_eq!(cache.get_data(true).await.unwrap(), json!({"fetch": 0}));
        assert_eq!(cache.fetches.load(Ordering::SeqCst), 1);
        assert!(cache.file.exists());
    }

    #[tokio::test]
    async fn disabled_cache_always_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CountingCache::new(dir.path());
        cache.get_data(false).await.unwrap();
        assert_eq!(cache.get_data(false).await.unwrap(), json!({"fetch": 1}));
        assert_eq!(cache.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn future_mtime_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CountingCache::new(dir.path());
        cache.get_data(true).await.unwrap();

        let file = std::fs::File::options().write(true).open(&cache.file).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(3600)).unwrap();

        assert!(!cache_is_valid(&cache.file, cache.interval).await);
        cache.get_data(true).await.unwrap();
        assert_eq!(cache.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CountingCache::new(dir.path());
        cache.get_data(true).await.unwrap();

        let file = std::fs::File::options().write(true).open(&cache.file).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(301)).unwrap();
        assert!(!cache_is_valid(&cache.file, cache.interval).await);
    }

    #[tokio::test]
    async fn corrupt_cache_falls_back_to_live_data() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CountingCache::new(dir.path());
        std::fs::create_dir_all(cache.file.parent().unwrap()).unwrap();
        std::fs::write(&cache.file, "{not json").unwrap();

        assert_eq!(cache.get_data(true).await.unwrap(), json!({"fetch": 0}));
        let rewritten: Value = serde_json::from_str(&std::fs::read_to_string(&cache.file).unwrap()).unwrap();
        assert_eq!(rewritten, json!({"fetch": 0}));
    }

    #[tokio::test]
    async fn corrupt_cache_propagates_in_debug() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CountingCache::new(dir.path());
        cache.debug = true;
        std::fs::create_dir_all(cache.file.parent().unwrap()).unwrap();
        std::fs::write(&cache.file, "{not json").unwrap();

        assert!(matches!(cache.get_data(true).await, Err(AgentError::Json(_))));
    }

    #[test]
    fn components_are_sanitized() {
        assert_eq!(
            sanitize_component("westeurope_Microsoft.Network/loadBalancers"),
            "westeurope_Microsoft.Network_loadBalancers"
        );
        assert_eq!(sanitize_component("Percentage CPU,Disk Read Bytes"), "Percentage CPU_Disk Read Bytes");
        assert_eq!(sanitize_component("../x"), ".._x");
    }
}
