//! Result cache: hit accounting, eviction order and compression

use flowcore::cache::{EvictionPolicy, ResultCache};
use flowcore::CacheConfig;
use pretty_assertions::assert_eq;
use serde_json::json;

fn cache(max_entries: usize) -> ResultCache {
    ResultCache::new(CacheConfig {
        max_entries,
        ..Default::default()
    })
    .unwrap()
}

// One set, two hits and one miss on a different key
#[test]
fn test_hit_rate() {
    let mut c = cache(10);
    c.set("result:a", json!({"rows": 3})).unwrap();

    assert!(c.get("result:a").is_some());
    assert!(c.get("result:a").is_some());
    assert!(c.get("result:b").is_none());

    let metrics = c.get_metrics();
    assert_eq!(metrics.hits, 2);
    assert_eq!(metrics.misses, 1);
    assert!((metrics.hit_rate - 0.666).abs() < 0.01);
    assert!((metrics.miss_rate - 0.333).abs() < 0.01);
}

// Reading key1 makes key2 the least recently accessed entry
#[test]
fn test_lru_eviction() {
    let mut c = cache(3);
    c.set("key1", json!(1)).unwrap();
    c.set("key2", json!(2)).unwrap();
    c.set("key3", json!(3)).unwrap();

    assert_eq!(c.get("key1"), Some(json!(1)));
    c.set("key4", json!(4)).unwrap();

    assert!(!c.has("key2"));
    for key in ["key1", "key3", "key4"] {
        assert!(c.has(key), "{} should remain", key);
    }
    assert_eq!(c.len(), 3);
    assert_eq!(c.get_metrics().evictions, 1);
}

#[test]
fn test_eviction_without_access_follows_insertion() {
    let mut c = cache(2);
    c.set("first", json!(1)).unwrap();
    c.set("second", json!(2)).unwrap();
    c.set("third", json!(3)).unwrap();
    assert!(!c.has("first"));
}

#[test]
fn test_overwrite_keeps_single_entry() {
    let mut c = cache(2);
    c.set("k", json!("old")).unwrap();
    c.set("k", json!("new")).unwrap();
    assert_eq!(c.len(), 1);
    assert_eq!(c.get("k"), Some(json!("new")));
    assert_eq!(c.get_metrics().evictions, 0);
}

#[test]
fn test_compression_ratio_reports_savings() {
    let mut c = ResultCache::new(CacheConfig {
        compression_threshold: 256,
        ..Default::default()
    })
    .unwrap();
    let payload = json!({ "log": "line of repetitive output\n".repeat(500) });
    c.set("big", payload.clone()).unwrap();

    let metrics = c.get_metrics();
    assert_eq!(metrics.compressed_entries, 1);
    assert!(metrics.compression_ratio > 0.0 && metrics.compression_ratio < 1.0);
    assert_eq!(c.get("big"), Some(payload));
}

#[test]
fn test_policy_from_config() {
    let mut c = ResultCache::new(CacheConfig {
        max_entries: 2,
        eviction_policy: EvictionPolicy::Fifo,
        ..Default::default()
    })
    .unwrap();
    c.set("a", json!(1)).unwrap();
    c.set("b", json!(2)).unwrap();
    c.get("a");
    c.set("c", json!(3)).unwrap();
    assert!(!c.has("a"));
}

#[test]
fn test_metrics_idempotent() {
    let mut c = cache(4);
    c.set("x", json!(1)).unwrap();
    c.get("x");
    c.get("y");
    assert_eq!(c.get_metrics(), c.get_metrics());
}
