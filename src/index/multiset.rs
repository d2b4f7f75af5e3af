use std::collections::HashMap;

use crate::core::value::Value;

/// Sorted multiset with reference counts. Running state for `$min` and
/// `$max`: a delete is an O(log k) removal instead of a rescan of the
/// group's contributors.
#[derive(Debug, Clone, Default)]
pub struct RefCountedMultiSet {
    counts: HashMap<Value, u64>,
    sorted: Vec<Value>,
    total: u64,
}

impl RefCountedMultiSet {
    pub fn new() -> Self {
        RefCountedMultiSet { counts: HashMap::new(), sorted: Vec::new(), total: 0 }
    }

    pub fn add(&mut self, value: Value) {
        self.total += 1;
        let count = self.counts.entry(value.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            let pos = self.sorted.binary_search(&value).unwrap_or_else(|p| p);
            self.sorted.insert(pos, value);
        }
    }

    /// Decrement a value's count; silently ignores values never added.
    pub fn remove(&mut self, value: &Value) {
        let Some(count) = self.counts.get_mut(value) else {
            return;
        };
        self.total -= 1;
        *count -= 1;
        if *count == 0 {
            self.counts.remove(value);
            if let Ok(pos) = self.sorted.binary_search(value) {
                self.sorted.remove(pos);
            }
        }
    }

    pub fn min(&self) -> Option<&Value> {
        self.sorted.first()
    }

    pub fn max(&self) -> Option<&Value> {
        self.sorted.last()
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.counts.contains_key(value)
    }

    pub fn count(&self, value: &Value) -> u64 {
        self.counts.get(value).copied().unwrap_or(0)
    }

    /// Number of distinct values.
    pub fn distinct_len(&self) -> usize {
        self.sorted.len()
    }

    /// Total references across all values.
    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Distinct values in canonical order.
    pub fn iter_sorted(&self) -> impl Iterator<Item = &Value> {
        self.sorted.iter()
    }
}
