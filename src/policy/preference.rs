use crate::config::{ParseConfig, PreferenceKind};
use crate::policy::mem_cache::top_by_count;
use std::collections::HashMap;

const SEPARATORS: &str = ":/.?&=,;";

/// Strategy assigning download priorities to newly discovered URLs
///
/// Lower values are fetched first; priority 0 is reserved for seeds.
pub trait Preference: Send {
    /// Priority of a newly discovered URL
    fn prioritize(&mut self, url: &str) -> i64;

    /// Called after every parser pass
    fn mark_batch(&mut self) {}
}

/// Builds the configured strategy
pub fn make_preference(kind: PreferenceKind, config: &ParseConfig) -> Box<dyn Preference> {
    match kind {
        PreferenceKind::Breadth => Box::new(BreadthPreference::new()),
        PreferenceKind::Novelty => Box::new(NoveltyPreference::new(
            config.novelty_high_mark,
            config.novelty_low_mark,
        )),
    }
}

/// Approximates breadth-first order: every link found in one pass shares a round
#[derive(Debug, Default)]
pub struct BreadthPreference {
    round: i64,
}

impl BreadthPreference {
    pub fn new() -> Self {
        Self { round: 1 }
    }
}

impl Preference for BreadthPreference {
    fn prioritize(&mut self, _url: &str) -> i64 {
        self.round
    }

    fn mark_batch(&mut self) {
        self.round += 1;
    }
}

/// Prefers URLs whose path prefixes have rarely been seen
///
/// A URL is split into segments on `:/.?&=,;`, the scheme dropped. Every
/// proper prefix adds `depth * times_seen` to the score, so a URL under a
/// well-explored prefix sorts late. Query URLs are pushed back further.
#[derive(Debug)]
pub struct NoveltyPreference {
    high_mark: usize,
    low_mark: usize,
    occurrences: HashMap<Vec<String>, u64>,
}

impl NoveltyPreference {
    pub fn new(high_mark: usize, low_mark: usize) -> Self {
        debug_assert!(low_mark > 0 && low_mark < high_mark);
        Self {
            high_mark,
            low_mark,
            occurrences: HashMap::new(),
        }
    }
}

impl Preference for NoveltyPreference {
    fn prioritize(&mut self, url: &str) -> i64 {
        let segments: Vec<&str> = url
            .split(|c: char| SEPARATORS.contains(c))
            .skip(1)
            .filter(|s| !s.is_empty())
            .collect();

        let mut priority: i64 = 1;
        for depth in 1..segments.len() {
            let head: Vec<String> = segments[..depth].iter().map(|s| s.to_string()).collect();
            let count = self.occurrences.entry(head).or_insert(0);
            priority = priority.saturating_add(depth as i64 * *count as i64);
            *count += 1;
        }

        if self.occurrences.len() > self.high_mark {
            self.occurrences = top_by_count(std::mem::take(&mut self.occurrences), self.low_mark);
        }

        if url.contains('?') {
            priority = priority.saturating_mul(100);
        }

        priority
    }
}
