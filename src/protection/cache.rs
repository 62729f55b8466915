//! TTL response cache for capability calls.
//!
//! Entries are keyed by a SHA-256 over the capability name, the operation and
//! a canonical rendering of the parameters (object keys sorted at every
//! level), so `{"a":1,"b":2}` and `{"b":2,"a":1}` share an entry.
//!
//! The cache is shared by every in-flight task. Reads take the map's read
//! lock; hits then briefly take the write lock to bump recency.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::capability::{CapabilityOutput, Params};

/// Default time-to-live for cached responses.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default maximum number of cached responses.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Hex-encoded SHA-256 cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a call.
    pub fn for_call(capability: &str, operation: &str, params: &Params) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(capability.as_bytes());
        hasher.update([0u8]);
        hasher.update(operation.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_json(&Value::Object(params.clone())).as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Render JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Cache tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: DEFAULT_TTL,
        }
    }
}

impl CacheConfig {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    output: CapabilityOutput,
    created_at: Instant,
    last_accessed: Instant,
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries_added: u64,
    pub entries_evicted: u64,
}

impl CacheStats {
    /// Hit rate between 0.0 and 1.0, or 0.0 with no lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_lookups();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn total_lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

/// Thread-safe response cache with TTL expiry and LRU eviction.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    config: CacheConfig,
    stats: RwLock<CacheStats>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            stats: RwLock::new(CacheStats::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Fresh cached output for `key`, if any.
    pub fn get(&self, key: &CacheKey) -> Option<CapabilityOutput> {
        let hit = {
            let entries = self.entries.read().expect("cache read lock poisoned");
            entries
                .get(key)
                .filter(|entry| entry.created_at.elapsed() < self.config.ttl)
                .map(|entry| entry.output.clone())
        };

        let mut stats = self.stats.write().expect("stats write lock poisoned");
        match hit {
            Some(output) => {
                stats.hits += 1;
                drop(stats);
                let mut entries = self.entries.write().expect("cache write lock poisoned");
                if let Some(entry) = entries.get_mut(key) {
                    entry.last_accessed = Instant::now();
                }
                Some(output)
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    /// Store `output` under `key`, evicting expired and least recently used entries.
    pub fn insert(&self, key: CacheKey, output: CapabilityOutput) {
        let mut entries = self.entries.write().expect("cache write lock poisoned");
        self.evict_expired(&mut entries);
        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            self.evict_oldest(&mut entries);
        }

        let now = Instant::now();
        entries.insert(
            key,
            CacheEntry {
                output,
                created_at: now,
                last_accessed: now,
            },
        );
        self.stats
            .write()
            .expect("stats write lock poisoned")
            .entries_added += 1;
    }

    fn evict_oldest(&self, entries: &mut HashMap<CacheKey, CacheEntry>) {
        let oldest = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            entries.remove(&key);
            self.stats
                .write()
                .expect("stats write lock poisoned")
                .entries_evicted += 1;
        }
    }

    fn evict_expired(&self, entries: &mut HashMap<CacheKey, CacheEntry>) {
        let ttl = self.config.ttl;
        let before = entries.len();
        entries.retain(|_, entry| entry.created_at.elapsed() < ttl);
        let evicted = (before - entries.len()) as u64;
        if evicted > 0 {
            self.stats
                .write()
                .expect("stats write lock poisoned")
                .entries_evicted += evicted;
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.read().expect("stats read lock poisoned").clone()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .expect("cache write lock poisoned")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache read lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
