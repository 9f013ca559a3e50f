//! Multi-layer market data cache.
//!
//! Reads traverse L1 (bounded in-memory LRU) -> L2 (JSON files keyed by a
//! content hash, under per-symbol subdirectories) -> L3 (distributed, when
//! configured) -> origin. Writes go to every available layer.
//!
//! A separate *fallback read* ignores TTLs entirely so callers can serve
//! stale data when every provider is down.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::domain::ports::DistributedCache;

/// What is being cached; each kind carries its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    /// Live quote: ~5s.
    Price,
    /// Recent candles: 60s.
    Candles,
    /// Historical OHLCV frames: 12h.
    Historical,
    Sentiment,
    Volatility,
    AssetDetails,
    Context,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Price => "price",
            CacheKind::Candles => "candles",
            CacheKind::Historical => "historical",
            CacheKind::Sentiment => "sentiment",
            CacheKind::Volatility => "volatility",
            CacheKind::AssetDetails => "asset_details",
            CacheKind::Context => "context",
        }
    }

    pub fn ttl(&self) -> Duration {
        match self {
            CacheKind::Price => Duration::from_secs(5),
            CacheKind::Candles => Duration::from_secs(60),
            CacheKind::Historical => Duration::from_secs(12 * 3600),
            CacheKind::Sentiment => Duration::from_secs(300),
            CacheKind::Volatility => Duration::from_secs(300),
            CacheKind::AssetDetails => Duration::from_secs(24 * 3600),
            CacheKind::Context => Duration::from_secs(30),
        }
    }

    /// Only candle-shaped payloads are worth a disk round-trip.
    fn file_backed(&self) -> bool {
        matches!(self, CacheKind::Candles | CacheKind::Historical)
    }

    fn file_ttl(&self) -> Duration {
        match self {
            CacheKind::Historical => Duration::from_secs(12 * 3600),
            _ => Duration::from_secs(60),
        }
    }
}

struct MemoryEntry {
    value: Value,
    cached_at: Instant,
}

struct MemoryCache {
    entries: HashMap<String, MemoryEntry>,
    access_order: Vec<String>,
    max_size: usize,
}

impl MemoryCache {
    fn touch(&mut self, key: &str) {
        self.access_order.retain(|k| k != key);
        self.access_order.push(key.to_string());
    }

    fn evict_if_full(&mut self, incoming: &str) {
        if self.entries.len() >= self.max_size && !self.entries.contains_key(incoming) {
            if !self.access_order.is_empty() {
                let lru = self.access_order.remove(0);
                self.entries.remove(&lru);
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct FileEntry {
    key: String,
    cached_at_unix: u64,
    value: Value,
}

pub struct MarketDataCache {
    memory: Mutex<MemoryCache>,
    cache_dir: PathBuf,
    distributed: Option<Arc<dyn DistributedCache>>,
}

impl MarketDataCache {
    pub fn new(cache_dir: impl Into<PathBuf>, max_entries: usize) -> Self {
        let cache_dir = cache_dir.into();
        if let Err(e) = fs::create_dir_all(&cache_dir) {
            warn!("Could not create cache directory {:?}: {}", cache_dir, e);
        }
        Self {
            memory: Mutex::new(MemoryCache {
                entries: HashMap::new(),
                access_order: Vec::new(),
                max_size: max_entries.max(1),
            }),
            cache_dir,
            distributed: None,
        }
    }

    pub fn with_distributed(mut self, layer: Arc<dyn DistributedCache>) -> Self {
        self.distributed = Some(layer);
        self
    }

    pub fn make_key(kind: CacheKind, symbol: &str, interval: Option<&str>) -> String {
        match interval {
            Some(iv) => format!("{}:{}:{}", kind.as_str(), symbol, iv),
            None => format!("{}:{}", kind.as_str(), symbol),
        }
    }

    /// TTL-respecting read through L1 -> L2 -> L3.
    pub async fn get(&self, kind: CacheKind, symbol: &str, interval: Option<&str>) -> Option<Value> {
        let key = Self::make_key(kind, symbol, interval);
        let ttl = kind.ttl();

        {
            let mut memory = self.memory.lock().ok()?;
            if let Some(entry) = memory.entries.get(&key) {
                if entry.cached_at.elapsed() <= ttl {
                    let value = entry.value.clone();
                    memory.touch(&key);
                    return Some(value);
                }
                memory.entries.remove(&key);
                memory.access_order.retain(|k| k != &key);
            }
        }

        if kind.file_backed() {
            if let Some(value) = self.read_file(&key, symbol, kind.file_ttl()) {
                self.store_memory(&key, value.clone());
                return Some(value);
            }
        }

        if let Some(layer) = &self.distributed {
            if let Some(value) = layer.get(&key).await {
                self.store_memory(&key, value.clone());
                return Some(value);
            }
        }

        None
    }

    /// Write-through to all available layers.
    pub async fn set(&self, kind: CacheKind, symbol: &str, interval: Option<&str>, value: Value) {
        let key = Self::make_key(kind, symbol, interval);
        self.store_memory(&key, value.clone());

        if kind.file_backed() {
            self.write_file(&key, symbol, &value);
        }

        if let Some(layer) = &self.distributed {
            layer.set(&key, value, kind.ttl().as_secs()).await;
        }
    }

    /// Stale read for graceful degradation: memory first (expired entries
    /// included), then disk with no TTL check.
    pub fn fallback(&self, kind: CacheKind, symbol: &str, interval: Option<&str>) -> Option<Value> {
        let key = Self::make_key(kind, symbol, interval);

        if let Ok(memory) = self.memory.lock() {
            if let Some(entry) = memory.entries.get(&key) {
                return Some(entry.value.clone());
            }
        }

        self.read_file(&key, symbol, Duration::from_secs(u64::MAX))
    }

    /// Drop entries matching the given kind and/or symbol.
    pub fn invalidate(&self, kind: Option<CacheKind>, symbol: Option<&str>) {
        let Ok(mut memory) = self.memory.lock() else {
            return;
        };
        let keys: Vec<String> = memory
            .entries
            .keys()
            .filter(|key| {
                let parts: Vec<&str> = key.split(':').collect();
                if let Some(kind) = kind {
                    if parts.first() != Some(&kind.as_str()) {
                        return false;
                    }
                }
                if let Some(symbol) = symbol {
                    if parts.get(1) != Some(&symbol) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        for key in keys {
            memory.entries.remove(&key);
            memory.access_order.retain(|k| k != &key);
        }
    }

    pub fn stats(&self) -> (usize, usize) {
        match self.memory.lock() {
            Ok(memory) => (memory.entries.len(), memory.max_size),
            Err(_) => (0, 0),
        }
    }

    fn store_memory(&self, key: &str, value: Value) {
        let Ok(mut memory) = self.memory.lock() else {
            return;
        };
        memory.evict_if_full(key);
        memory.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                cached_at: Instant::now(),
            },
        );
        memory.touch(key);
    }

    fn file_path(&self, key: &str, symbol: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let name = format!("{}.json", hex::encode(digest));
        self.cache_dir.join(symbol).join(name)
    }

    fn read_file(&self, key: &str, symbol: &str, ttl: Duration) -> Option<Value> {
        let path = self.file_path(key, symbol);
        let raw = fs::read_to_string(&path).ok()?;
        let entry: FileEntry = serde_json::from_str(&raw).ok()?;

        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
        let age = now.saturating_sub(entry.cached_at_unix);
        if age > ttl.as_secs() {
            let _ = fs::remove_file(&path);
            return None;
        }
        Some(entry.value)
    }

    fn write_file(&self, key: &str, symbol: &str, value: &Value) {
        let path = self.file_path(key, symbol);
        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let entry = FileEntry {
            key: key.to_string(),
            cached_at_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            value: value.clone(),
        };
        match serde_json::to_string(&entry) {
            Ok(serialized) => {
                if let Err(e) = fs::write(&path, serialized) {
                    debug!("File cache write failed for {}: {}", key, e);
                }
            }
            Err(e) => debug!("File cache serialization failed for {}: {}", key, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_cache(max: usize) -> (MarketDataCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (MarketDataCache::new(dir.path(), max), dir)
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let (cache, _dir) = temp_cache(10);
        cache
            .set(CacheKind::Price, "AAPL", None, json!({"price": 123.45}))
            .await;

        let hit = cache.get(CacheKind::Price, "AAPL", None).await.unwrap();
        assert_eq!(hit["price"], 123.45);

        assert!(cache.get(CacheKind::Price, "MSFT", None).await.is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let (cache, _dir) = temp_cache(2);
        cache.set(CacheKind::Price, "A", None, json!(1)).await;
        cache.set(CacheKind::Price, "B", None, json!(2)).await;
        // Touch A so B becomes the LRU entry.
        cache.get(CacheKind::Price, "A", None).await;
        cache.set(CacheKind::Price, "C", None, json!(3)).await;

        assert!(cache.get(CacheKind::Price, "A", None).await.is_some());
        assert!(cache.get(CacheKind::Price, "B", None).await.is_none());
        assert!(cache.get(CacheKind::Price, "C", None).await.is_some());
    }

    #[tokio::test]
    async fn test_file_layer_survives_memory_invalidation() {
        let (cache, _dir) = temp_cache(10);
        cache
            .set(CacheKind::Historical, "AAPL", Some("1d"), json!([1, 2, 3]))
            .await;

        cache.invalidate(None, Some("AAPL"));
        // L1 is empty now; the read must come back from disk.
        let hit = cache
            .get(CacheKind::Historical, "AAPL", Some("1d"))
            .await
            .unwrap();
        assert_eq!(hit, json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_fallback_returns_stale_values() {
        let (cache, _dir) = temp_cache(10);
        cache
            .set(CacheKind::Candles, "TSLA", Some("1h"), json!(["stale"]))
            .await;

        // Fallback must serve the entry regardless of TTL.
        let value = cache.fallback(CacheKind::Candles, "TSLA", Some("1h")).unwrap();
        assert_eq!(value, json!(["stale"]));

        assert!(cache.fallback(CacheKind::Candles, "NVDA", Some("1h")).is_none());
    }

    #[tokio::test]
    async fn test_invalidate_by_kind() {
        let (cache, _dir) = temp_cache(10);
        cache.set(CacheKind::Price, "A", None, json!(1)).await;
        cache.set(CacheKind::Sentiment, "A", None, json!(2)).await;

        cache.invalidate(Some(CacheKind::Price), None);
        assert!(cache.get(CacheKind::Price, "A", None).await.is_none());
        assert!(cache.get(CacheKind::Sentiment, "A", None).await.is_some());
    }
}
