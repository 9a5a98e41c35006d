//! Component A: bidirectional mapping between service-reported paths and
//! canonical paths, longest-prefix-match, memoized through a bounded cache.

use std::sync::RwLock;

use crate::config::PathMapping;
use crate::error::{EngineError, Result};

/// Bounded map from `(service|"local") + ":" + path` to its translation.
/// Evicts ~25% of entries (arbitrary key order) when full, matching the
/// approximate-LRU behavior spec.md §5 calls out for the path cache.
pub struct PathCache {
    inner: RwLock<PathCacheInner>,
    capacity: usize,
}

struct PathCacheInner {
    entries: std::collections::HashMap<String, String>,
    hits: u64,
    total: u64,
    evictions: u64,
}

impl PathCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(PathCacheInner {
                entries: std::collections::HashMap::new(),
                hits: 0,
                total: 0,
                evictions: 0,
            }),
            capacity,
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.write().unwrap();
        inner.total += 1;
        if let Some(v) = inner.entries.get(key) {
            inner.hits += 1;
            return Some(v.clone());
        }
        None
    }

    fn put(&self, key: String, value: String) {
        let mut inner = self.inner.write().unwrap();
        if inner.entries.len() >= self.capacity {
            let evict_count = (self.capacity / 4).max(1);
            let victims: Vec<String> = inner.entries.keys().take(evict_count).cloned().collect();
            for victim in victims {
                inner.entries.remove(&victim);
                inner.evictions += 1;
            }
        }
        inner.entries.insert(key, value);
    }

    /// Wholesale invalidation, used on configuration reload.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.entries.clear();
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        let inner = self.inner.read().unwrap();
        (inner.hits, inner.total, inner.evictions)
    }
}

/// One table of `{from_prefix, to_prefix}` mappings, matched longest-prefix
/// first.
#[derive(Default, Clone)]
pub struct PrefixTable {
    mappings: Vec<PathMapping>,
}

impl PrefixTable {
    pub fn new(mut mappings: Vec<PathMapping>) -> Result<Self> {
        for m in &mappings {
            validate_prefix(&m.from_prefix)?;
            validate_prefix(&m.to_prefix)?;
        }
        // Longest `from_prefix` first so the match is unambiguous.
        mappings.sort_by_key(|m| std::cmp::Reverse(m.from_prefix.len()));
        Ok(Self { mappings })
    }

    /// Translate `path` via the longest matching `from_prefix`, replacing it
    /// with the mapping's `to_prefix`. Returns `path` unchanged if nothing
    /// matches.
    fn translate(&self, path: &str) -> String {
        for mapping in &self.mappings {
            if let Some(rest) = strip_prefix_component(path, &mapping.from_prefix) {
                return join_normalized(&mapping.to_prefix, rest);
            }
        }
        path.to_string()
    }
}

fn validate_prefix(prefix: &str) -> Result<()> {
    if !prefix.starts_with('/') || prefix.split('/').any(|part| part == "..") {
        return Err(EngineError::InvalidPath(prefix.to_string()));
    }
    Ok(())
}

/// Strips `prefix` from `path` only on a path-component boundary (so
/// `/media` doesn't spuriously match `/media2/foo`).
fn strip_prefix_component<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let prefix = prefix.trim_end_matches('/');
    if path == prefix {
        return Some("");
    }
    let with_slash = format!("{prefix}/");
    path.strip_prefix(&with_slash)
}

fn join_normalized(to_prefix: &str, rest: &str) -> String {
    let to_prefix = to_prefix.trim_end_matches('/');
    if rest.is_empty() {
        to_prefix.to_string()
    } else {
        format!("{to_prefix}/{rest}")
    }
}

/// Holds the local (canonical <-> host) table and one table per service,
/// consulted by the Service Reconciler, the Duplicate Grouper, and the
/// Consolidator (§4.A).
pub struct PathTranslator {
    local: PrefixTable,
    per_service: std::collections::HashMap<String, PrefixTable>,
    cache: PathCache,
}

impl PathTranslator {
    pub fn new(
        local_mappings: Vec<PathMapping>,
        service_mappings: std::collections::HashMap<String, Vec<PathMapping>>,
        cache_capacity: usize,
    ) -> Result<Self> {
        let local = PrefixTable::new(local_mappings)?;
        let mut per_service = std::collections::HashMap::new();
        for (service, mappings) in service_mappings {
            per_service.insert(service, PrefixTable::new(mappings)?);
        }
        Ok(Self {
            local,
            per_service,
            cache: PathCache::new(cache_capacity),
        })
    }

    /// Translate a service-reported path to its canonical form.
    pub fn to_canonical(&self, service: &str, path: &str) -> String {
        let key = format!("{service}:{path}");
        if let Some(hit) = self.cache.get(&key) {
            return hit;
        }
        let translated = match self.per_service.get(service) {
            Some(table) => table.translate(path),
            None => path.to_string(),
        };
        self.cache.put(key, translated.clone());
        translated
    }

    /// Translate a canonical path to its host-side form.
    pub fn to_host(&self, path: &str) -> String {
        let key = format!("local:{path}");
        if let Some(hit) = self.cache.get(&key) {
            return hit;
        }
        let translated = self.local.translate(path);
        self.cache.put(key, translated.clone());
        translated
    }

    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> (u64, u64, u64) {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(from: &str, to: &str) -> PathMapping {
        PathMapping {
            from_prefix: from.to_string(),
            to_prefix: to.to_string(),
        }
    }

    #[test]
    fn round_trip_through_local_and_service_tables() {
        let translator = PathTranslator::new(
            vec![mapping("/data", "/mnt/user")],
            std::collections::HashMap::from([(
                "sonarr".to_string(),
                vec![mapping("/tv", "/data/tv")],
            )]),
            16,
        )
        .unwrap();

        let canonical = translator.to_canonical("sonarr", "/tv/Show/ep1.mkv");
        assert_eq!(canonical, "/data/tv/Show/ep1.mkv");

        let host = translator.to_host(&canonical);
        assert_eq!(host, "/mnt/user/tv/Show/ep1.mkv");
    }

    #[test]
    fn unmatched_path_is_returned_unchanged() {
        let translator =
            PathTranslator::new(vec![mapping("/data", "/mnt/user")], Default::default(), 16)
                .unwrap();
        assert_eq!(translator.to_host("/other/file.txt"), "/other/file.txt");
    }

    #[test]
    fn longest_prefix_wins() {
        let translator = PathTranslator::new(
            vec![
                mapping("/data", "/mnt/short"),
                mapping("/data/tv", "/mnt/long"),
            ],
            Default::default(),
            16,
        )
        .unwrap();
        assert_eq!(
            translator.to_host("/data/tv/Show/ep1.mkv"),
            "/mnt/long/Show/ep1.mkv"
        );
    }

    #[test]
    fn does_not_match_on_non_component_boundary() {
        let translator =
            PathTranslator::new(vec![mapping("/media", "/mnt/media")], Default::default(), 16)
                .unwrap();
        assert_eq!(
            translator.to_host("/media2/file.txt"),
            "/media2/file.txt"
        );
    }

    #[test]
    fn rejects_relative_prefix() {
        let result = PathTranslator::new(vec![mapping("data", "/mnt")], Default::default(), 16);
        assert!(result.is_err());
    }

    #[test]
    fn cache_hits_are_counted_and_eviction_is_approximate() {
        let translator =
            PathTranslator::new(vec![mapping("/data", "/mnt")], Default::default(), 2)
                .unwrap();
        translator.to_host("/data/a");
        translator.to_host("/data/a");
        let (hits, total, _) = translator.cache_stats();
        assert_eq!(total, 2);
        assert_eq!(hits, 1);

        // Push past capacity to trigger eviction; must not panic.
        translator.to_host("/data/b");
        translator.to_host("/data/c");
        let (_, _, evictions) = translator.cache_stats();
        assert!(evictions >= 1);
    }
}
