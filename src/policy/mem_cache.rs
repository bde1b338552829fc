use std::collections::HashMap;
use std::hash::Hash;

/// Bounded "seen before" cache for extracted links
///
/// Counts how often each key was checked. When the number of distinct keys
/// exceeds the high mark, only the `low_mark` most frequently seen keys are
/// kept, so memory stays flat however large the crawl grows.
#[derive(Debug, Clone)]
pub struct MemCache {
    high_mark: usize,
    low_mark: usize,
    counts: HashMap<String, u64>,
}

impl MemCache {
    /// Creates an empty cache; `low_mark` must be below `high_mark`
    pub fn new(high_mark: usize, low_mark: usize) -> Self {
        debug_assert!(low_mark < high_mark);
        Self {
            high_mark,
            low_mark,
            counts: HashMap::new(),
        }
    }

    /// Records a sighting, returning true if the key was seen before
    pub fn check(&mut self, key: &str) -> bool {
        if let Some(count) = self.counts.get_mut(key) {
            *count += 1;
            return true;
        }

        self.counts.insert(key.to_string(), 1);
        if self.counts.len() > self.high_mark {
            self.prune();
        }
        false
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    fn prune(&mut self) {
        self.counts = top_by_count(std::mem::take(&mut self.counts), self.low_mark);
        tracing::debug!("Pruned link cache to {} entries", self.counts.len());
    }
}

/// Keeps the `keep` entries with the highest counts
pub(crate) fn top_by_count<K: Ord + Hash>(map: HashMap<K, u64>, keep: usize) -> HashMap<K, u64> {
    let mut entries: Vec<(K, u64)> = map.into_iter().collect();
    entries.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    entries.truncate(keep);
    entries.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_reports_repeats() {
        let mut cache = MemCache::new(10, 5);
        assert!(!cache.check("http://example.com/a"));
        assert!(cache.check("http://example.com/a"));
        assert!(!cache.check("http://example.com/b"));
    }

    #[test]
    fn test_prune_keeps_most_frequent() {
        let mut cache = MemCache::new(4, 2);
        for _ in 0..3 {
            cache.check("hot");
        }
        cache.check("warm");
        cache.check("warm");
        cache.check("cold1");
        cache.check("cold2");
        assert_eq!(cache.len(), 4);

        // Fifth distinct key crosses the high mark
        cache.check("cold3");
        assert_eq!(cache.len(), 2);
        assert!(cache.check("hot"));
        assert!(cache.check("warm"));
        assert!(!cache.check("cold1"));
    }
}
