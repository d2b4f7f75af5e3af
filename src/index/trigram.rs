use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use roaring::RoaringTreemap;

use crate::core::types::RowId;
use crate::core::value::Value;

const PAD_BEGIN: u8 = 0x02;
const PAD_END: u8 = 0x03;

/// Trigram posting index for one field. Strings are padded with begin and
/// end markers before 3-gram extraction; patterns are not, since a
/// substring probe is unanchored.
#[derive(Debug, Default)]
pub struct TrigramIndex {
    grams: HashMap<[u8; 3], RoaringTreemap>,
    max_grams: usize,
    overflowed: bool,
}

impl TrigramIndex {
    pub fn new(max_grams: usize) -> Self {
        TrigramIndex { grams: HashMap::new(), max_grams, overflowed: false }
    }

    /// Whether the gram table blew past its memory bound; an overflowed
    /// index answers no queries.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn add(&mut self, row: RowId, text: &str) {
        if self.overflowed {
            return;
        }
        for gram in padded_grams(text) {
            if !self.grams.contains_key(&gram) && self.grams.len() >= self.max_grams {
                self.overflowed = true;
                self.grams.clear();
                return;
            }
            self.grams.entry(gram).or_default().insert(row.0);
        }
    }

    pub fn remove(&mut self, row: RowId, text: &str) {
        if self.overflowed {
            return;
        }
        for gram in padded_grams(text) {
            if let Some(set) = self.grams.get_mut(&gram) {
                set.remove(row.0);
                if set.is_empty() {
                    self.grams.remove(&gram);
                }
            }
        }
    }

    /// Candidate rows: the intersection of posting sets for every trigram
    /// of the pattern. `None` means the index cannot narrow the scan
    /// (short pattern or overflow); an empty set is a definitive miss.
    pub fn candidates(&self, pattern: &str) -> Option<RoaringTreemap> {
        if self.overflowed {
            return None;
        }
        let grams = pattern_grams(pattern);
        if grams.is_empty() {
            return None;
        }
        let mut result: Option<RoaringTreemap> = None;
        for gram in grams {
            let set = self.grams.get(&gram).cloned().unwrap_or_default();
            result = Some(match result {
                Some(acc) => acc & set,
                None => set,
            });
            if result.as_ref().map(|r| r.is_empty()).unwrap_or(false) {
                break;
            }
        }
        result
    }

    pub fn gram_count(&self) -> usize {
        self.grams.len()
    }
}

fn padded_grams(text: &str) -> Vec<[u8; 3]> {
    let mut bytes = Vec::with_capacity(text.len() + 2);
    bytes.push(PAD_BEGIN);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(PAD_END);
    bytes.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
}

fn pattern_grams(pattern: &str) -> Vec<[u8; 3]> {
    pattern.as_bytes().windows(3).map(|w| [w[0], w[1], w[2]]).collect()
}

/// Session-scoped prefilter manager. A field earns a trigram index only
/// after enough substring queries; idle sessions expire and release the
/// memory.
pub struct TrigramPrefilter {
    activation_threshold: usize,
    idle_expiry: Duration,
    max_grams: usize,
    query_counts: HashMap<String, usize>,
    indexes: HashMap<String, TrigramIndex>,
    cache: LruCache<(String, String), RoaringTreemap>,
    last_query: Instant,
}

impl TrigramPrefilter {
    pub fn new(activation_threshold: usize, idle_expiry: Duration, max_patterns: usize) -> Self {
        let cap = NonZeroUsize::new(max_patterns.max(1)).unwrap();
        TrigramPrefilter {
            activation_threshold,
            idle_expiry,
            max_grams: 1 << 16,
            query_counts: HashMap::new(),
            indexes: HashMap::new(),
            cache: LruCache::new(cap),
            last_query: Instant::now(),
        }
    }

    /// Record a substring query against a field. Returns true once the
    /// field has crossed the activation threshold and has no index yet,
    /// which is the caller's cue to build one.
    pub fn note_query(&mut self, field: &str) -> bool {
        self.expire_if_idle();
        self.last_query = Instant::now();
        let count = self.query_counts.entry(field.to_string()).or_insert(0);
        *count += 1;
        *count >= self.activation_threshold && !self.indexes.contains_key(field)
    }

    pub fn install(&mut self, field: &str, index: TrigramIndex) {
        self.indexes.insert(field.to_string(), index);
    }

    pub fn has_index(&self, field: &str) -> bool {
        self.indexes.contains_key(field)
    }

    /// Fields with a live index; document churn must be forwarded for
    /// these so candidates never go stale.
    pub fn indexed_fields(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    pub fn max_grams(&self) -> usize {
        self.max_grams
    }

    pub fn candidates(&mut self, field: &str, pattern: &str) -> Option<RoaringTreemap> {
        let key = (field.to_string(), pattern.to_string());
        if let Some(hit) = self.cache.get(&key) {
            return Some(hit.clone());
        }
        let result = self.indexes.get(field)?.candidates(pattern)?;
        self.cache.put(key, result.clone());
        Some(result)
    }

    /// Keep live indexes current under document churn.
    pub fn add_document(&mut self, row: RowId, field: &str, value: &Value) {
        if let (Some(index), Some(text)) = (self.indexes.get_mut(field), value.as_str()) {
            index.add(row, text);
        }
        self.cache.clear();
    }

    pub fn remove_document(&mut self, row: RowId, field: &str, value: &Value) {
        if let (Some(index), Some(text)) = (self.indexes.get_mut(field), value.as_str()) {
            index.remove(row, text);
        }
        self.cache.clear();
    }

    fn expire_if_idle(&mut self) {
        if self.last_query.elapsed() > self.idle_expiry {
            self.indexes.clear();
            self.query_counts.clear();
            self.cache.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(texts: &[&str]) -> TrigramIndex {
        let mut index = TrigramIndex::new(1 << 16);
        for (i, text) in texts.iter().enumerate() {
            index.add(RowId(i as u64), text);
        }
        index
    }

    #[test]
    fn test_candidates_contain_all_true_matches() {
        let index = index_with(&["streaming engine", "batch engine", "stream"]);
        let rows: Vec<u64> = index.candidates("eng").unwrap().iter().collect();
        assert_eq!(rows, vec![0, 1]);
        let rows: Vec<u64> = index.candidates("stream").unwrap().iter().collect();
        assert_eq!(rows, vec![0, 2]);
    }

    #[test]
    fn test_short_pattern_gives_no_prefilter() {
        let index = index_with(&["abc"]);
        assert!(index.candidates("ab").is_none());
    }

    #[test]
    fn test_remove_updates_postings() {
        let mut index = index_with(&["hello world", "hello there"]);
        index.remove(RowId(0), "hello world");
        let rows: Vec<u64> = index.candidates("hello").unwrap().iter().collect();
        assert_eq!(rows, vec![1]);
        assert!(index.candidates("world").unwrap().is_empty());
    }

    #[test]
    fn test_overflow_disables_index() {
        let mut index = TrigramIndex::new(4);
        index.add(RowId(0), "abcdefghij");
        assert!(index.overflowed());
        assert!(index.candidates("abc").is_none());
    }

    #[test]
    fn test_activation_threshold() {
        let mut pre = TrigramPrefilter::new(3, Duration::from_secs(300), 8);
        assert!(!pre.note_query("name"));
        assert!(!pre.note_query("name"));
        assert!(pre.note_query("name")); // third query crosses the threshold
        pre.install("name", index_with(&["alpha"]));
        assert!(!pre.note_query("name")); // already built
        assert!(pre.candidates("name", "alp").is_some());
    }
}
