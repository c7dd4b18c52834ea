//! Response Cache
//!
//! Memoizes AI answers under a normalized SHA256 key and tracks per-client
//! rate-limit counters. Two backends behind one contract: Redis (native
//! expiry) and a file-backed fallback (manual TTL checks). The backend is
//! chosen once at construction by a connection probe; callers never learn
//! which one served a call.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::AsyncCommands;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, RouterError};

const KEY_PREFIX: &str = "grocer_ai:";
const RATE_PREFIX: &str = "grocer_ai:rate:";
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));
static PUNCTUATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").expect("static regex"));

/// A cached answer with its origin timestamp
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub response: String,
    pub cached_at: i64,
    pub ttl_secs: u64,
}

/// On-disk / in-Redis representation of a cache entry
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    response: String,
    timestamp: i64,
    ttl: u64,
}

/// Rate-limit counter: single start-stamped window, wholesale reset
#[derive(Debug, Serialize, Deserialize)]
struct RateCounter {
    count: u32,
    window_start: i64,
}

/// Cache diagnostics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub total_keys: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
}

/// Connectivity test result for the status API
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub status: String,
    pub message: String,
}

#[async_trait]
trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn get_entry(&self, key: &str) -> Result<Option<StoredEntry>>;
    async fn put_entry(&self, key: &str, entry: &StoredEntry) -> Result<()>;
    async fn clear(&self, pattern: &str) -> Result<usize>;
    /// Fixed-window check: true = allowed (and counted), false = denied.
    async fn check_rate(&self, key: &str, max_requests: u32, window_secs: u64) -> Result<bool>;
    async fn ping(&self) -> Result<()>;
    async fn key_count(&self) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// Redis backend
// ---------------------------------------------------------------------------

struct RedisBackend {
    manager: redis::aio::ConnectionManager,
}

impl RedisBackend {
    async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = tokio::time::timeout(
            REDIS_CONNECT_TIMEOUT,
            client.get_connection_manager(),
        )
        .await
        .map_err(|_| RouterError::Cache("redis connect timed out".to_string()))??;
        Ok(Self { manager })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get_entry(&self, key: &str) -> Result<Option<StoredEntry>> {
        let mut con = self.manager.clone();
        let raw: Option<String> = con.get(key).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json).ok()),
            None => Ok(None),
        }
    }

    async fn put_entry(&self, key: &str, entry: &StoredEntry) -> Result<()> {
        let mut con = self.manager.clone();
        let json = serde_json::to_string(entry)?;
        // Native expiry: Redis owns the TTL.
        let _: () = con.set_ex(key, json, entry.ttl).await?;
        Ok(())
    }

    async fn clear(&self, pattern: &str) -> Result<usize> {
        let mut con = self.manager.clone();
        let mut keys: Vec<String> = con.keys(format!("{KEY_PREFIX}{pattern}")).await?;
        // Rate counters share the prefix but must survive a cache clear.
        keys.retain(|k| !k.starts_with(RATE_PREFIX));
        if keys.is_empty() {
            return Ok(0);
        }
        let deleted: usize = con.del(keys).await?;
        Ok(deleted)
    }

    async fn check_rate(&self, key: &str, max_requests: u32, window_secs: u64) -> Result<bool> {
        let mut con = self.manager.clone();
        // INCR is atomic, so concurrent requests each see a distinct count.
        // A count of 1 means this request opened the window and owns the TTL.
        let count: i64 = con.incr(key, 1).await?;
        if count == 1 {
            let _: () = con.expire(key, window_secs as i64).await?;
        }
        Ok(count <= i64::from(max_requests))
    }

    async fn ping(&self) -> Result<()> {
        let mut con = self.manager.clone();
        let pong: String = redis::cmd("PING").query_async(&mut con).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(RouterError::Cache(format!("unexpected ping reply: {pong}")))
        }
    }

    async fn key_count(&self) -> Result<usize> {
        let mut con = self.manager.clone();
        let keys: Vec<String> = con.keys(format!("{KEY_PREFIX}*")).await?;
        Ok(keys.len())
    }
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

struct FileBackend {
    dir: PathBuf,
    // Counter files are read-modify-write; serialize them across tasks.
    rate_lock: parking_lot::Mutex<()>,
}

impl FileBackend {
    fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            rate_lock: parking_lot::Mutex::new(()),
        })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key.replace(':', "_")))
    }

    fn rate_path(&self, key: &str) -> PathBuf {
        // Rate keys already carry the rate prefix; keep them distinguishable
        // from cache entries so clear() never touches counters.
        self.dir
            .join(format!("{}.counter", key.replace(':', "_")))
    }
}

#[async_trait]
impl CacheBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get_entry(&self, key: &str) -> Result<Option<StoredEntry>> {
        let path = self.entry_path(key);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };
        let entry: StoredEntry = match serde_json::from_str(&raw) {
            Ok(e) => e,
            Err(_) => return Ok(None),
        };
        // No service-side expiry here: check the TTL by hand.
        let expires_at = entry.timestamp + entry.ttl as i64;
        if chrono::Utc::now().timestamp() > expires_at {
            let _ = std::fs::remove_file(&path);
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn put_entry(&self, key: &str, entry: &StoredEntry) -> Result<()> {
        let path = self.entry_path(key);
        std::fs::write(&path, serde_json::to_string(entry)?)?;
        Ok(())
    }

    async fn clear(&self, _pattern: &str) -> Result<usize> {
        // File backend only supports a full clear.
        let mut deleted = 0;
        for file in std::fs::read_dir(&self.dir)? {
            let path = file?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                std::fs::remove_file(&path)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn check_rate(&self, key: &str, max_requests: u32, window_secs: u64) -> Result<bool> {
        let _guard = self.rate_lock.lock();
        let path = self.rate_path(key);
        let now = chrono::Utc::now().timestamp();

        let counter = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<RateCounter>(&raw).ok());

        let mut counter = match counter {
            // Wholesale reset once the window has elapsed since first-seen.
            Some(c) if now - c.window_start <= window_secs as i64 => c,
            _ => {
                let fresh = RateCounter {
                    count: 1,
                    window_start: now,
                };
                std::fs::write(&path, serde_json::to_string(&fresh)?)?;
                return Ok(true);
            }
        };

        if counter.count >= max_requests {
            return Ok(false);
        }

        counter.count += 1;
        std::fs::write(&path, serde_json::to_string(&counter)?)?;
        Ok(true)
    }

    async fn ping(&self) -> Result<()> {
        if self.dir.is_dir() {
            Ok(())
        } else {
            Err(RouterError::Cache("cache directory missing".to_string()))
        }
    }

    async fn key_count(&self) -> Result<usize> {
        let count = std::fs::read_dir(&self.dir)?
            .flatten()
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("json"))
            .count();
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

/// Cache store with transparent backend degradation
pub struct CacheStore {
    backend: Box<dyn CacheBackend>,
    default_ttl: u64,
    rate_limit_enabled: bool,
    rate_max_requests: u32,
    rate_window_secs: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    /// Probe Redis; degrade permanently to the file backend on failure.
    pub async fn connect(config: &Config) -> Self {
        let backend: Box<dyn CacheBackend> = match &config.redis_url {
            Some(url) => match RedisBackend::connect(url).await {
                Ok(redis) => {
                    info!("Connected to Redis cache at {}", url);
                    Box::new(redis)
                }
                Err(e) => {
                    warn!("Redis unavailable ({}), degrading to file cache", e);
                    Self::file_backend_or_die(&config.cache_dir)
                }
            },
            None => {
                info!("No Redis configured, using file cache");
                Self::file_backend_or_die(&config.cache_dir)
            }
        };

        Self {
            backend,
            default_ttl: config.cache_ttl_secs,
            rate_limit_enabled: config.rate_limit_enabled,
            rate_max_requests: config.rate_limit_max_requests,
            rate_window_secs: config.rate_limit_window_secs,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Construct directly on the file backend (tests, offline tooling).
    pub fn file_backed(
        dir: &Path,
        default_ttl: u64,
        rate_max_requests: u32,
        rate_window_secs: u64,
    ) -> Result<Self> {
        Ok(Self {
            backend: Box::new(FileBackend::new(dir)?),
            default_ttl,
            rate_limit_enabled: true,
            rate_max_requests,
            rate_window_secs,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    fn file_backend_or_die(dir: &Path) -> Box<dyn CacheBackend> {
        // create_dir_all on a local path; if this fails the process cannot
        // cache or rate-limit at all and should stop at bootstrap.
        match FileBackend::new(dir) {
            Ok(b) => Box::new(b),
            Err(e) => panic!("cannot initialize file cache at {}: {e}", dir.display()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Normalize a prompt: case-fold, collapse whitespace, strip punctuation.
    pub fn normalize(prompt: &str) -> String {
        let lowered = prompt.to_lowercase();
        let collapsed = WHITESPACE.replace_all(lowered.trim(), " ");
        PUNCTUATION.replace_all(&collapsed, "").into_owned()
    }

    /// Deterministic cache key for a prompt.
    pub fn cache_key(prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(Self::normalize(prompt).as_bytes());
        format!("{KEY_PREFIX}{}", hex::encode(hasher.finalize()))
    }

    fn rate_key(identifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(identifier.as_bytes());
        format!("{RATE_PREFIX}{}", hex::encode(hasher.finalize()))
    }

    /// Look up a cached answer. Backend errors read as misses.
    pub async fn get(&self, prompt: &str) -> Option<CachedEntry> {
        let key = Self::cache_key(prompt);
        match self.backend.get_entry(&key).await {
            Ok(Some(entry)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache HIT: {}", &key[..KEY_PREFIX.len() + 12]);
                Some(CachedEntry {
                    response: entry.response,
                    cached_at: entry.timestamp,
                    ttl_secs: entry.ttl,
                })
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Cache MISS: {}", &key[..KEY_PREFIX.len() + 12]);
                None
            }
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                warn!("Cache get failed: {}", e);
                None
            }
        }
    }

    /// Store an answer. Failures are logged, never surfaced.
    pub async fn put(&self, prompt: &str, response: &str, ttl: Option<u64>) {
        let key = Self::cache_key(prompt);
        let entry = StoredEntry {
            response: response.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            ttl: ttl.unwrap_or(self.default_ttl),
        };
        if let Err(e) = self.backend.put_entry(&key, &entry).await {
            warn!("Cache put failed: {}", e);
        }
    }

    /// Fixed-window rate limit. Fails open: any backend error allows the
    /// request (availability over strict enforcement).
    pub async fn check_rate_limit(&self, identifier: &str) -> bool {
        if !self.rate_limit_enabled {
            return true;
        }
        let key = Self::rate_key(identifier);
        match self
            .backend
            .check_rate(&key, self.rate_max_requests, self.rate_window_secs)
            .await
        {
            Ok(allowed) => {
                if !allowed {
                    warn!("Rate limit exceeded for {}", identifier);
                }
                allowed
            }
            Err(e) => {
                warn!("Rate limit check failed ({}), allowing request", e);
                true
            }
        }
    }

    /// Delete cache entries matching the pattern suffix. Returns the count.
    pub async fn clear(&self, pattern: &str) -> usize {
        match self.backend.clear(pattern).await {
            Ok(n) => {
                info!("Cleared {} cache entries", n);
                n
            }
            Err(e) => {
                warn!("Cache clear failed: {}", e);
                0
            }
        }
    }

    /// Diagnostic snapshot.
    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            backend: self.backend.name(),
            total_keys: self.backend.key_count().await.unwrap_or(0),
            hits,
            misses,
            hit_rate_percent: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }

    /// Connectivity test for the status API. Pure read.
    pub async fn test_connection(&self) -> ConnectionStatus {
        match self.backend.ping().await {
            Ok(()) => ConnectionStatus {
                status: "connected".to_string(),
                message: format!("{} cache is healthy", self.backend.name()),
            },
            Err(e) => ConnectionStatus {
                status: "error".to_string(),
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_store(ttl: u64) -> (CacheStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::file_backed(dir.path(), ttl, 3, 60).unwrap();
        (store, dir)
    }

    #[test]
    fn test_normalization_equivalence() {
        let a = CacheStore::normalize("What are your   store hours?");
        let b = CacheStore::normalize("what ARE your store hours");
        let c = CacheStore::normalize("  What, are your store hours!!  ");
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a, "what are your store hours");
    }

    #[test]
    fn test_key_stability_across_variants() {
        assert_eq!(
            CacheStore::cache_key("Do you deliver on Sundays?"),
            CacheStore::cache_key("do you DELIVER on sundays")
        );
        assert_ne!(
            CacheStore::cache_key("Do you deliver on Sundays?"),
            CacheStore::cache_key("Do you deliver on Mondays?")
        );
    }

    #[tokio::test]
    async fn test_file_cache_roundtrip() {
        let (store, _dir) = file_store(3600);

        assert!(store.get("store hours?").await.is_none());
        store.put("store hours?", "8am to 8pm", None).await;

        let hit = store.get("STORE HOURS").await.expect("normalized hit");
        assert_eq!(hit.response, "8am to 8pm");
        assert_eq!(hit.ttl_secs, 3600);

        let stats = store.stats().await;
        assert_eq!(stats.backend, "file");
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_keys, 1);
    }

    #[tokio::test]
    async fn test_file_cache_expiry() {
        let (store, _dir) = file_store(0);
        store.put("old question", "old answer", Some(0)).await;
        // A zero TTL entry is expired as soon as the clock ticks; force it
        // by checking against an entry stamped in the past.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(store.get("old question").await.is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_window_denies_then_fails_open_semantics() {
        let (store, _dir) = file_store(3600);
        // Limit is 3 per window.
        assert!(store.check_rate_limit("10.0.0.1").await);
        assert!(store.check_rate_limit("10.0.0.1").await);
        assert!(store.check_rate_limit("10.0.0.1").await);
        assert!(!store.check_rate_limit("10.0.0.1").await);
        // Other identifiers are unaffected.
        assert!(store.check_rate_limit("10.0.0.2").await);
    }

    #[tokio::test]
    async fn test_rate_limit_window_reset() {
        let dir = TempDir::new().unwrap();
        // 1-second window for a fast reset test.
        let store = CacheStore::file_backed(dir.path(), 3600, 1, 1).unwrap();
        assert!(store.check_rate_limit("client").await);
        assert!(!store.check_rate_limit("client").await);
        // Timestamps have second granularity, so sleep past two full seconds
        // to guarantee `now - window_start > 1` regardless of sub-second phase.
        tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
        // Window elapsed since first-seen: counter resets to 1.
        assert!(store.check_rate_limit("client").await);
        assert!(!store.check_rate_limit("client").await);
    }

    #[tokio::test]
    async fn test_clear_removes_entries_not_counters() {
        let (store, _dir) = file_store(3600);
        store.put("q1", "a1", None).await;
        store.put("q2", "a2", None).await;
        assert!(store.check_rate_limit("1.2.3.4").await);

        let cleared = store.clear("*").await;
        assert_eq!(cleared, 2);
        assert!(store.get("q1").await.is_none());
        // Counter survived the clear: two more requests exhaust the limit of 3.
        assert!(store.check_rate_limit("1.2.3.4").await);
        assert!(store.check_rate_limit("1.2.3.4").await);
        assert!(!store.check_rate_limit("1.2.3.4").await);
    }
}
