use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::config::CacheConfig;
use crate::core::errors::{CoreError, Result};
use crate::queue::Task;

/// Which entry makes room when the cache is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently accessed
    #[default]
    Lru,
    /// Least frequently accessed
    Lfu,
    /// Oldest insertion
    Fifo,
}

#[derive(Debug, Clone)]
enum Payload {
    Raw(Value),
    Compressed(Vec<u8>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Payload,
    /// Stored bytes, post-compression
    size_bytes: usize,
    original_bytes: usize,
    inserted_at: Instant,
    ttl: Option<Duration>,
    insert_seq: u64,
    access_seq: u64,
    access_count: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .map(|ttl| now.duration_since(self.inserted_at) >= ttl)
            .unwrap_or(false)
    }

    fn is_compressed(&self) -> bool {
        matches!(self.payload, Payload::Compressed(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetrics {
    pub entries: usize,
    pub size_bytes: usize,
    pub uncompressed_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub compressed_entries: usize,
    /// Fraction of bytes saved by compression, 0.0 when nothing is stored
    pub compression_ratio: f64,
}

/// Cache key for a task's output, shared by every run that repeats the same work
pub fn fingerprint_key(task: &Task) -> String {
    format!("result:{}", task.fingerprint())
}

/// Memoizes node outputs keyed by execution fingerprint.
///
/// Bounded by entry count and by stored size; large values are transparently
/// zstd-compressed. Expiry is lazy: an entry past its TTL is dropped the next
/// time it is looked at.
#[derive(Debug)]
pub struct ResultCache {
    config: CacheConfig,
    entries: HashMap<String, CacheEntry>,
    size_bytes: usize,
    original_bytes: usize,
    seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            entries: HashMap::new(),
            size_bytes: 0,
            original_bytes: 0,
            seq: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        })
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        let ttl = self.config.default_ttl;
        self.set_with_ttl(key, value, ttl)
    }

    pub fn set_with_ttl(
        &mut self,
        key: impl Into<String>,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = key.into();
        let serialized = serde_json::to_vec(&value)?;
        let original_bytes = serialized.len();

        let payload = if original_bytes > self.config.compression_threshold {
            let compressed = zstd::encode_all(&serialized[..], self.config.compression_level)
                .map_err(|e| CoreError::Compression {
                    operation: format!("compress {}", key),
                    source: e,
                })?;
            if compressed.len() < original_bytes {
                Payload::Compressed(compressed)
            } else {
                Payload::Raw(value)
            }
        } else {
            Payload::Raw(value)
        };
        let size_bytes = match &payload {
            Payload::Compressed(bytes) => bytes.len(),
            Payload::Raw(_) => original_bytes,
        };

        if size_bytes > self.config.max_size_bytes {
            return Err(CoreError::resource_exhausted(
                "cache_size",
                size_bytes as u64,
                self.config.max_size_bytes as u64,
            ));
        }

        self.remove_entry(&key);
        while !self.entries.is_empty()
            && (self.entries.len() >= self.config.max_entries
                || self.size_bytes + size_bytes > self.config.max_size_bytes)
        {
            if !self.evict_one() {
                break;
            }
        }

        let seq = self.next_seq();
        self.size_bytes += size_bytes;
        self.original_bytes += original_bytes;
        self.entries.insert(
            key,
            CacheEntry {
                payload,
                size_bytes,
                original_bytes,
                inserted_at: Instant::now(),
                ttl,
                insert_seq: seq,
                access_seq: seq,
                access_count: 0,
            },
        );
        Ok(())
    }

    /// Value for `key`, refreshing its recency. Counts a hit or a miss.
    pub fn get(&mut self, key: &str) -> Option<Value> {
        if self.expire_if_stale(key) {
            self.misses += 1;
            return None;
        }
        let seq = self.next_seq();
        let Some(entry) = self.entries.get_mut(key) else {
            self.misses += 1;
            return None;
        };
        entry.access_seq = seq;
        entry.access_count += 1;

        let decoded = match &entry.payload {
            Payload::Raw(value) => Ok(value.clone()),
            Payload::Compressed(bytes) => zstd::decode_all(&bytes[..])
                .map_err(CoreError::from)
                .and_then(|raw| serde_json::from_slice(&raw).map_err(CoreError::from)),
        };
        match decoded {
            Ok(value) => {
                self.hits += 1;
                Some(value)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Dropping undecodable cache entry");
                self.remove_entry(key);
                self.misses += 1;
                None
            }
        }
    }

    /// Presence check; does not touch recency or hit statistics
    pub fn has(&mut self, key: &str) -> bool {
        !self.expire_if_stale(key) && self.entries.contains_key(key)
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.remove_entry(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.size_bytes = 0;
        self.original_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Sweep every expired entry; returns how many were dropped
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove_entry(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }

    /// Evict by policy until stored size is at most `fraction` of `max_size_bytes`.
    /// Returns the number of stored bytes released.
    pub fn shrink_to(&mut self, fraction: f64) -> u64 {
        let target = (self.config.max_size_bytes as f64 * fraction.clamp(0.0, 1.0)) as usize;
        let before = self.size_bytes;
        while self.size_bytes > target {
            if !self.evict_one() {
                break;
            }
        }
        let freed = before - self.size_bytes;
        if freed > 0 {
            debug!(freed, remaining = self.size_bytes, "Cache shrunk");
        }
        freed as u64
    }

    pub fn get_metrics(&self) -> CacheMetrics {
        let lookups = self.hits + self.misses;
        let (hit_rate, miss_rate) = if lookups == 0 {
            (0.0, 0.0)
        } else {
            (
                self.hits as f64 / lookups as f64,
                self.misses as f64 / lookups as f64,
            )
        };
        let compression_ratio = if self.original_bytes == 0 {
            0.0
        } else {
            1.0 - self.size_bytes as f64 / self.original_bytes as f64
        };
        CacheMetrics {
            entries: self.entries.len(),
            size_bytes: self.size_bytes,
            uncompressed_bytes: self.original_bytes,
            hits: self.hits,
            misses: self.misses,
            hit_rate,
            miss_rate,
            evictions: self.evictions,
            expirations: self.expirations,
            compressed_entries: self.entries.values().filter(|e| e.is_compressed()).count(),
            compression_ratio,
        }
    }

    fn expire_if_stale(&mut self, key: &str) -> bool {
        let stale = self
            .entries
            .get(key)
            .map(|e| e.is_expired(Instant::now()))
            .unwrap_or(false);
        if stale {
            self.remove_entry(key);
            self.expirations += 1;
            debug!(key = %key, "Cache entry expired");
        }
        stale
    }

    fn evict_one(&mut self) -> bool {
        let victim = match self.config.eviction_policy {
            EvictionPolicy::Lru => self
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.access_seq, e.insert_seq)),
            EvictionPolicy::Lfu => self
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.access_count, e.insert_seq)),
            EvictionPolicy::Fifo => self.entries.iter().min_by_key(|(_, e)| e.insert_seq),
        }
        .map(|(k, _)| k.clone());

        match victim {
            Some(key) => {
                self.remove_entry(&key);
                self.evictions += 1;
                debug!(key = %key, policy = ?self.config.eviction_policy, "Evicted cache entry");
                true
            }
            None => false,
        }
    }

    fn remove_entry(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.size_bytes -= entry.size_bytes;
                self.original_bytes -= entry.original_bytes;
                true
            }
            None => false,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}
