use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use roaring::RoaringTreemap;

use crate::core::path;
use crate::core::types::RowId;
use crate::core::value::{Document, Value};
use crate::index::zonemap::ZoneMap;

/// Per-field inverted index: value → row-id set, plus the sorted distinct
/// values for range scans and a reverse map for cheap removal. One
/// dimension exists per field path per collection, built lazily on first
/// reference.
#[derive(Debug)]
pub struct Dimension {
    pub path: String,
    by_value: BTreeMap<Value, RoaringTreemap>,
    row_to_value: HashMap<u64, Value>,
    zone_map: ZoneMap,
    total_rows: u64,
    array_rows: u64,
}

impl Dimension {
    pub fn new(path: &str, chunk_rows: usize) -> Self {
        Dimension {
            path: path.to_string(),
            by_value: BTreeMap::new(),
            row_to_value: HashMap::new(),
            zone_map: ZoneMap::new(chunk_rows),
            total_rows: 0,
            array_rows: 0,
        }
    }

    /// Index the value this path resolves to. A missing field indexes as
    /// null, matching equality-with-null semantics.
    pub fn add_document(&mut self, row: RowId, doc: &Document) {
        let value = path::resolve(doc, &self.path).unwrap_or(Value::Null);
        if matches!(value, Value::Array(_)) {
            self.array_rows += 1;
        }
        self.zone_map.add(row.0, &value);
        self.by_value.entry(value.clone()).or_default().insert(row.0);
        self.row_to_value.insert(row.0, value);
        self.total_rows += 1;
    }

    pub fn remove_document(&mut self, row: RowId) {
        let Some(value) = self.row_to_value.remove(&row.0) else {
            return;
        };
        if matches!(value, Value::Array(_)) {
            self.array_rows -= 1;
        }
        self.zone_map.remove(row.0, &value);
        if let Some(set) = self.by_value.get_mut(&value) {
            set.remove(row.0);
            if set.is_empty() {
                self.by_value.remove(&value);
            }
        }
        self.total_rows -= 1;
    }

    pub fn value_of(&self, row: RowId) -> Option<&Value> {
        self.row_to_value.get(&row.0)
    }

    pub fn equal(&self, value: &Value) -> RoaringTreemap {
        self.by_value.get(value).cloned().unwrap_or_default()
    }

    /// Rows whose value falls in the given range under the canonical
    /// order. `None` bounds are open-ended.
    pub fn range(
        &self,
        lo: Option<&Value>,
        hi: Option<&Value>,
        lo_inclusive: bool,
        hi_inclusive: bool,
    ) -> RoaringTreemap {
        let lower = match lo {
            Some(v) if lo_inclusive => Bound::Included(v.clone()),
            Some(v) => Bound::Excluded(v.clone()),
            None => Bound::Unbounded,
        };
        let upper = match hi {
            Some(v) if hi_inclusive => Bound::Included(v.clone()),
            Some(v) => Bound::Excluded(v.clone()),
            None => Bound::Unbounded,
        };
        let mut out = RoaringTreemap::new();
        for set in self.by_value.range((lower, upper)).map(|(_, set)| set) {
            out |= set;
        }
        out
    }

    pub fn sorted_values(&self) -> impl Iterator<Item = &Value> {
        self.by_value.keys()
    }

    pub fn distinct_count(&self) -> usize {
        self.by_value.len()
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    /// Fraction of distinct values over total rows; 1.0 means unique.
    pub fn selectivity(&self) -> f64 {
        if self.total_rows == 0 {
            return 1.0;
        }
        self.by_value.len() as f64 / self.total_rows as f64
    }

    /// Whether any indexed row holds an array at this path. Array fields
    /// have element-membership match semantics the point index cannot
    /// answer, so the planner falls back to scanning.
    pub fn has_array_values(&self) -> bool {
        self.array_rows > 0
    }

    pub fn zone_map(&self) -> &ZoneMap {
        &self.zone_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(json: &str) -> Document {
        Document::from_json(&serde_json::from_str(json).unwrap()).unwrap()
    }

    fn dim_with(docs: &[&str]) -> Dimension {
        let mut dim = Dimension::new("v", 1024);
        for (i, json) in docs.iter().enumerate() {
            dim.add_document(RowId(i as u64), &doc(json));
        }
        dim
    }

    #[test]
    fn test_equal_and_missing_as_null() {
        let dim = dim_with(&[r#"{"v": 1}"#, r#"{"v": 2}"#, r#"{"v": 1}"#, r#"{"x": 9}"#]);
        assert_eq!(dim.equal(&Value::Int(1)).iter().collect::<Vec<u64>>(), vec![0, 2]);
        assert_eq!(dim.equal(&Value::Null).iter().collect::<Vec<u64>>(), vec![3]);
        assert_eq!(dim.distinct_count(), 3);
    }

    #[test]
    fn test_range_scan() {
        let dim = dim_with(&[r#"{"v": 10}"#, r#"{"v": 20}"#, r#"{"v": 30}"#, r#"{"v": 40}"#]);
        let rows = dim.range(Some(&Value::Int(20)), Some(&Value::Int(40)), true, false);
        assert_eq!(rows.iter().collect::<Vec<u64>>(), vec![1, 2]);
        let open = dim.range(None, Some(&Value::Int(20)), false, true);
        assert_eq!(open.iter().collect::<Vec<u64>>(), vec![0, 1]);
    }

    #[test]
    fn test_removal_keeps_index_tight() {
        let mut dim = dim_with(&[r#"{"v": 1}"#, r#"{"v": 1}"#]);
        dim.remove_document(RowId(0));
        assert_eq!(dim.equal(&Value::Int(1)).iter().collect::<Vec<u64>>(), vec![1]);
        dim.remove_document(RowId(1));
        assert_eq!(dim.distinct_count(), 0);
        assert_eq!(dim.total_rows(), 0);
        // Removing an unknown row is a no-op.
        dim.remove_document(RowId(7));
    }

    #[test]
    fn test_array_flag_and_selectivity() {
        let dim = dim_with(&[r#"{"v": [1, 2]}"#, r#"{"v": 3}"#]);
        assert!(dim.has_array_values());
        let unique = dim_with(&[r#"{"v": 1}"#, r#"{"v": 2}"#]);
        assert_eq!(unique.selectivity(), 1.0);
    }
}
