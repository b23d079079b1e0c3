//! # Diagnostic Cache
//!
//! Per-unit TTL cache for slow-changing readings (wifi lists, modem state,
//! capability probes). Values are stored as JSON so one cache serves every
//! reading type.
//!
//! ```text
//!   get(device, key, ttl, fetch)
//!        │
//!        ├── entry younger than ttl ──────────► cached value, fetch not called
//!        │
//!        └── missing / expired / unreadable ──► fetch()
//!                                                 ├─ Ok  → store + return
//!                                                 └─ Err → return Err, keep old entry
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SyncResult;

/// Reading kinds held in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKey {
    WifiNetworks,
    CurrentWifi,
    ModemStatus,
    InternetReachable,
    Battery,
    Capabilities,
    DeviceConfig,
}

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    stored_at: Instant,
}

/// Shared TTL cache. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticCache {
    entries: Arc<RwLock<HashMap<(String, DiagnosticKey), Entry>>>,
}

impl DiagnosticCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value if it is younger than `ttl`, otherwise
    /// calls `fetch` and caches its result.
    pub async fn get<T, F, Fut>(
        &self,
        device_id: &str,
        key: DiagnosticKey,
        ttl: Duration,
        fetch: F,
    ) -> SyncResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        if let Some(value) = self.fresh(device_id, key, ttl).await {
            return Ok(value);
        }

        let value = fetch().await?;
        self.put(device_id, key, &value).await;
        Ok(value)
    }

    /// Returns any cached value, even if stale, and refreshes stale or
    /// missing entries in the background.
    ///
    /// Falls back to an inline fetch when nothing is cached yet.
    pub async fn get_stale_while_revalidate<T, F, Fut>(
        &self,
        device_id: &str,
        key: DiagnosticKey,
        ttl: Duration,
        fetch: F,
    ) -> SyncResult<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
    {
        let cached = {
            let entries = self.entries.read().await;
            entries
                .get(&(device_id.to_string(), key))
                .map(|e| (e.value.clone(), e.stored_at.elapsed() < ttl))
        };

        match cached.and_then(|(value, fresh)| Some((serde_json::from_value::<T>(value).ok()?, fresh))) {
            Some((value, true)) => Ok(value),
            Some((value, false)) => {
                self.refresh_in_background(device_id, key, fetch);
                Ok(value)
            }
            None => {
                let value = fetch().await?;
                self.put(device_id, key, &value).await;
                Ok(value)
            }
        }
    }

    /// Fetches and stores a value on a spawned task.
    pub fn refresh_in_background<T, F, Fut>(&self, device_id: &str, key: DiagnosticKey, fetch: F)
    where
        T: Serialize + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
    {
        let cache = self.clone();
        let device_id = device_id.to_string();

        tokio::spawn(async move {
            match fetch().await {
                Ok(value) => cache.put(&device_id, key, &value).await,
                Err(e) => debug!(device_id = %device_id, ?key, error = %e, "Background refresh failed"),
            }
        });
    }

    pub async fn put<T: Serialize>(&self, device_id: &str, key: DiagnosticKey, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                warn!(device_id = %device_id, ?key, error = %e, "Value not cacheable");
                return;
            }
        };

        self.entries.write().await.insert(
            (device_id.to_string(), key),
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, device_id: &str, key: DiagnosticKey) {
        self.entries
            .write()
            .await
            .remove(&(device_id.to_string(), key));
    }

    /// Drops every entry for a unit.
    pub async fn invalidate_device(&self, device_id: &str) {
        self.entries
            .write()
            .await
            .retain(|(id, _), _| id != device_id);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn fresh<T: DeserializeOwned>(
        &self,
        device_id: &str,
        key: DiagnosticKey,
        ttl: Duration,
    ) -> Option<T> {
        let entries = self.entries.read().await;
        let entry = entries.get(&(device_id.to_string(), key))?;
        if entry.stored_at.elapsed() >= ttl {
            return None;
        }
        serde_json::from_value(entry.value.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicU32, Ordering};

    const TTL: Duration = Duration::from_secs(20);

    async fn read(cache: &DiagnosticCache, calls: &Arc<AtomicU32>) -> u32 {
        let calls = calls.clone();
        cache
            .get("100", DiagnosticKey::WifiNetworks, TTL, || async move {
                Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
            })
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_window() {
        let cache = DiagnosticCache::new();
        let calls = Arc::new(AtomicU32::new(0));

        assert_eq!(read(&cache, &calls).await, 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(read(&cache, &calls).await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(read(&cache, &calls).await, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_refetch() {
        let cache = DiagnosticCache::new();
        let calls = Arc::new(AtomicU32::new(0));

        read(&cache, &calls).await;
        cache.invalidate("100", DiagnosticKey::WifiNetworks).await;
        assert_eq!(read(&cache, &calls).await, 2);

        cache.put("200", DiagnosticKey::Battery, &80.0).await;
        cache.invalidate_device("100").await;
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_is_not_cached() {
        let cache = DiagnosticCache::new();

        let result: SyncResult<u32> = cache
            .get("100", DiagnosticKey::ModemStatus, TTL, || async {
                Err(SyncError::Timeout(3))
            })
            .await;
        assert!(result.is_err());
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_value_served_while_refreshing() {
        let cache = DiagnosticCache::new();
        cache.put("100", DiagnosticKey::CurrentWifi, &"old-ssid").await;

        tokio::time::advance(Duration::from_secs(30)).await;

        let value: String = cache
            .get_stale_while_revalidate("100", DiagnosticKey::CurrentWifi, TTL, || async {
                Ok("new-ssid".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "old-ssid");

        // Let the spawned refresh run.
        tokio::time::sleep(Duration::from_millis(1)).await;

        let value: String = cache
            .get("100", DiagnosticKey::CurrentWifi, TTL, || async {
                Err(SyncError::Timeout(1))
            })
            .await
            .unwrap();
        assert_eq!(value, "new-ssid");
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_refresh_from_spawned_task() {
        let cache = DiagnosticCache::new();
        cache
            .put("100", DiagnosticKey::WifiNetworks, &vec!["old".to_string()])
            .await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let reader = cache.clone();
        let value = tokio::spawn(async move {
            reader
                .get_stale_while_revalidate("100", DiagnosticKey::WifiNetworks, TTL, || async {
                    Ok(vec!["bush-net".to_string(), "hut".to_string()])
                })
                .await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(value, vec!["old".to_string()]);

        tokio::time::sleep(Duration::from_millis(1)).await;

        let value: Vec<String> = cache
            .get("100", DiagnosticKey::WifiNetworks, TTL, || async {
                Err(SyncError::Timeout(1))
            })
            .await
            .unwrap();
        assert_eq!(value, vec!["bush-net".to_string(), "hut".to_string()]);
    }
}
