//! Per-session tool-result cache (§3, §4.6 `runToolWithCache`).
//!
//! Keyed by `"{tool name}:{canonical args JSON}"`. Write-class tools clear
//! the whole cache; cacheable (read-only) tools are served from cache within
//! TTL and, for path-keyed tools, only while the target file's mtime hasn't
//! changed. Oldest entries are evicted once the cache exceeds
//! `CACHE_MAX_SIZE`.

use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use sd_domain::config::CacheConfig;

#[derive(Clone)]
struct Entry {
    value: String,
    inserted_at: Instant,
    mtime: Option<SystemTime>,
    insertion_order: u64,
}

pub enum ToolClass {
    Write,
    Cacheable { path_arg: Option<String> },
    Uncached,
}

pub struct ToolResultCache {
    config: CacheConfig,
    entries: HashMap<String, Entry>,
    next_order: u64,
}

impl ToolResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self { config, entries: HashMap::new(), next_order: 0 }
    }

    pub fn classify(&self, tool_name: &str) -> ToolClass {
        if self.config.write_tools.iter().any(|t| t == tool_name) {
            ToolClass::Write
        } else if self.config.cacheable_tools.iter().any(|t| t == tool_name) {
            ToolClass::Cacheable { path_arg: Some(self.config.path_arg_key.clone()) }
        } else {
            ToolClass::Uncached
        }
    }

    fn key(tool_name: &str, args_json: &str) -> String {
        format!("{tool_name}:{args_json}")
    }

    /// Looks up a cached value, honoring TTL and (if applicable) the
    /// target file's current mtime.
    pub fn get(&self, tool_name: &str, args_json: &str, current_mtime: Option<SystemTime>) -> Option<String> {
        let entry = self.entries.get(&Self::key(tool_name, args_json))?;
        if entry.inserted_at.elapsed().as_secs() > self.config.ttl_secs {
            return None;
        }
        if entry.mtime.is_some() && entry.mtime != current_mtime {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Inserts/overwrites an entry, evicting the oldest entries until the
    /// cache is back under `max_size`.
    pub fn put(&mut self, tool_name: &str, args_json: &str, value: String, mtime: Option<SystemTime>) {
        let order = self.next_order;
        self.next_order += 1;
        self.entries.insert(
            Self::key(tool_name, args_json),
            Entry { value, inserted_at: Instant::now(), mtime, insertion_order: order },
        );
        while self.entries.len() > self.config.max_size {
            if let Some(oldest_key) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.insertion_order)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest_key);
            } else {
                break;
            }
        }
    }

    /// Clears the whole cache — called after any write-class tool runs
    /// (§3, §4.6, property P6).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_within_ttl() {
        let mut cache = ToolResultCache::new(CacheConfig::default());
        cache.put("read_file", "{\"path\":\"a\"}", "contents".into(), None);
        assert_eq!(cache.get("read_file", "{\"path\":\"a\"}", None), Some("contents".into()));
    }

    #[test]
    fn mtime_mismatch_invalidates_entry() {
        let mut cache = ToolResultCache::new(CacheConfig::default());
        let t1 = SystemTime::now();
        cache.put("read_file", "{\"path\":\"a\"}", "v1".into(), Some(t1));
        let t2 = t1 + std::time::Duration::from_secs(5);
        assert!(cache.get("read_file", "{\"path\":\"a\"}", Some(t2)).is_none());
        assert!(cache.get("read_file", "{\"path\":\"a\"}", Some(t1)).is_some());
    }

    #[test]
    fn write_class_tool_clears_cache_manually_invoked() {
        let mut cache = ToolResultCache::new(CacheConfig::default());
        cache.put("read_file", "{}", "v".into(), None);
        assert!(matches!(cache.classify("write_file"), ToolClass::Write));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn evicts_oldest_when_over_max_size() {
        let mut config = CacheConfig::default();
        config.max_size = 2;
        let mut cache = ToolResultCache::new(config);
        cache.put("read_file", "\"1\"", "v1".into(), None);
        cache.put("read_file", "\"2\"", "v2".into(), None);
        cache.put("read_file", "\"3\"", "v3".into(), None);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("read_file", "\"1\"", None).is_none());
        assert!(cache.get("read_file", "\"3\"", None).is_some());
    }

    #[test]
    fn classify_buckets_match_config() {
        let cache = ToolResultCache::new(CacheConfig::default());
        assert!(matches!(cache.classify("exec"), ToolClass::Write));
        assert!(matches!(cache.classify("grep"), ToolClass::Cacheable { .. }));
        assert!(matches!(cache.classify("unknown_tool"), ToolClass::Uncached));
    }
}
