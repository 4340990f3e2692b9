pub mod result_cache;

pub use result_cache::{fingerprint_key, CacheMetrics, EvictionPolicy, ResultCache};
