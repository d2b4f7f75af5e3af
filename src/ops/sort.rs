use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value as Json;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::path;
use crate::core::types::{Delta, DeltaBatch, DeltaOp, Rid};
use crate::core::value::{Document, Value};
use crate::index::ostree::OsTree;
use crate::ops::{Operator, delta_after};

/// Field-ordered sort specification: `{field: 1 | -1, ...}` in spec
/// order.
#[derive(Debug, Clone)]
pub struct SortSpec {
    pub fields: Vec<(String, bool)>, // (path, ascending)
}

impl SortSpec {
    pub fn compile(json: &Json) -> Result<SortSpec> {
        let map = json.as_object().ok_or_else(|| {
            Error::new(ErrorKind::Parse, "$sort requires an object".to_string())
        })?;
        if map.is_empty() {
            return Err(Error::new(ErrorKind::Parse, "$sort may not be empty".to_string()));
        }
        let mut fields = Vec::with_capacity(map.len());
        for (field, dir) in map {
            match dir.as_i64() {
                Some(1) => fields.push((field.clone(), true)),
                Some(-1) => fields.push((field.clone(), false)),
                _ => {
                    return Err(Error::new(
                        ErrorKind::Parse,
                        format!("sort direction for '{}' must be 1 or -1", field),
                    ));
                }
            }
        }
        Ok(SortSpec { fields })
    }

    pub fn key_of(&self, doc: &Document) -> Vec<Value> {
        self.fields
            .iter()
            .map(|(field, _)| path::resolve(doc, field).unwrap_or(Value::Null))
            .collect()
    }

    pub fn compare_keys(&self, a: &[Value], b: &[Value]) -> Ordering {
        for (i, (_, ascending)) in self.fields.iter().enumerate() {
            let ord = a[i].cmp(&b[i]);
            let ord = if *ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Buffering `$sort`, with the skip/limit of an adjacent run folded in.
/// Membership deltas pass through; ordering is realized at materialize
/// time. Stability ties break on insertion order.
#[derive(Debug)]
pub struct SortOp {
    spec: SortSpec,
    skip: usize,
    limit: Option<usize>,
    docs: HashMap<Rid, (Document, u64)>,
    next_arrival: u64,
}

impl SortOp {
    pub fn new(spec: SortSpec, skip: usize, limit: Option<usize>) -> Self {
        SortOp { spec, skip, limit, docs: HashMap::new(), next_arrival: 0 }
    }
}

impl Operator for SortOp {
    fn name(&self) -> &'static str {
        "sort"
    }

    fn push(&mut self, batch: DeltaBatch) -> Result<DeltaBatch> {
        for delta in &batch.deltas {
            match delta.op {
                DeltaOp::Insert => {
                    let arrival = self.next_arrival;
                    self.next_arrival += 1;
                    if self
                        .docs
                        .insert(delta.rid, (delta_after(delta)?.clone(), arrival))
                        .is_some()
                    {
                        return Err(Error::new(
                            ErrorKind::Internal,
                            format!("sort buffer already holds rid {:?}", delta.rid),
                        ));
                    }
                }
                DeltaOp::Delete => {
                    if self.docs.remove(&delta.rid).is_none() {
                        return Err(Error::new(
                            ErrorKind::Internal,
                            format!("sort buffer delete for unknown rid {:?}", delta.rid),
                        ));
                    }
                }
                DeltaOp::Update => {
                    let Some(slot) = self.docs.get_mut(&delta.rid) else {
                        return Err(Error::new(
                            ErrorKind::Internal,
                            format!("sort buffer update for unknown rid {:?}", delta.rid),
                        ));
                    };
                    slot.0 = delta_after(delta)?.clone();
                }
            }
        }
        Ok(batch)
    }

    fn snapshot(&self) -> Option<Vec<Document>> {
        let mut entries: Vec<(Vec<Value>, u64, &Document)> = self
            .docs
            .values()
            .map(|(doc, arrival)| (self.spec.key_of(doc), *arrival, doc))
            .collect();
        entries.sort_by(|a, b| self.spec.compare_keys(&a.0, &b.0).then(a.1.cmp(&b.1)));
        let iter = entries.into_iter().skip(self.skip);
        let docs: Vec<Document> = match self.limit {
            Some(k) => iter.take(k).map(|(_, _, d)| d.clone()).collect(),
            None => iter.map(|(_, _, d)| d.clone()).collect(),
        };
        Some(docs)
    }

    fn reset(&mut self) {
        self.docs.clear();
        self.next_arrival = 0;
    }
}

/// Standalone `$limit` / `$skip`: a window over the effective output in
/// insertion order, book-kept with an order-statistics tree keyed by
/// rid.
#[derive(Debug)]
pub struct WindowOp {
    kind: &'static str,
    skip: usize,
    limit: Option<usize>,
    tree: OsTree<Document>,
    window: Vec<(Rid, Document)>,
}

impl WindowOp {
    pub fn limit(k: usize) -> Self {
        WindowOp { kind: "limit", skip: 0, limit: Some(k), tree: OsTree::new(), window: Vec::new() }
    }

    pub fn skip(n: usize) -> Self {
        WindowOp { kind: "skip", skip: n, limit: None, tree: OsTree::new(), window: Vec::new() }
    }

    /// A composed skip+limit window, as produced by the fuser.
    pub fn window(skip: usize, limit: Option<usize>) -> Self {
        WindowOp { kind: "window", skip, limit, tree: OsTree::new(), window: Vec::new() }
    }

    fn current_window(&self) -> Vec<(Rid, Document)> {
        let end = match self.limit {
            Some(k) => (self.skip + k).min(self.tree.len()),
            None => self.tree.len(),
        };
        (self.skip..end)
            .filter_map(|i| self.tree.select(i))
            .map(|(_, rid, doc)| (rid, doc.clone()))
            .collect()
    }
}

impl Operator for WindowOp {
    fn name(&self) -> &'static str {
        self.kind
    }

    fn push(&mut self, batch: DeltaBatch) -> Result<DeltaBatch> {
        let seq = batch.deltas.last().map(|d| d.seq).unwrap_or(0);
        for delta in &batch.deltas {
            match delta.op {
                DeltaOp::Insert => {
                    self.tree.insert(Value::Null, delta.rid, delta_after(delta)?.clone());
                }
                DeltaOp::Delete => {
                    if self.tree.remove(&Value::Null, delta.rid).is_none() {
                        return Err(Error::new(
                            ErrorKind::Internal,
                            format!("window delete for unknown rid {:?}", delta.rid),
                        ));
                    }
                }
                DeltaOp::Update => {
                    if !self.tree.contains(&Value::Null, delta.rid) {
                        return Err(Error::new(
                            ErrorKind::Internal,
                            format!("window update for unknown rid {:?}", delta.rid),
                        ));
                    }
                    self.tree.insert(Value::Null, delta.rid, delta_after(delta)?.clone());
                }
            }
        }

        // Diff the window before/after the batch into output deltas.
        let next = self.current_window();
        let mut out = DeltaBatch::new();
        let prev: HashMap<Rid, &Document> =
            self.window.iter().map(|(rid, doc)| (*rid, doc)).collect();
        let now: HashMap<Rid, &Document> = next.iter().map(|(rid, doc)| (*rid, doc)).collect();
        for (rid, doc) in &self.window {
            if !now.contains_key(rid) {
                out.push(Delta::delete(*rid, doc.clone(), seq));
            }
        }
        for (rid, doc) in &next {
            match prev.get(rid) {
                None => out.push(Delta::insert(*rid, doc.clone(), seq)),
                Some(old) if *old != doc => {
                    out.push(Delta::update(*rid, (*old).clone(), doc.clone(), seq));
                }
                Some(_) => {}
            }
        }
        self.window = next;
        Ok(out)
    }

    fn snapshot(&self) -> Option<Vec<Document>> {
        Some(self.window.iter().map(|(_, doc)| doc.clone()).collect())
    }

    fn reset(&mut self) {
        self.tree.clear();
        self.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RowId;

    fn doc(json: &str) -> Document {
        Document::from_json(&serde_json::from_str(json).unwrap()).unwrap()
    }

    fn rid(n: u64) -> Rid {
        Rid::source(RowId(n))
    }

    fn spec(json: &str) -> SortSpec {
        SortSpec::compile(&serde_json::from_str(json).unwrap()).unwrap()
    }

    fn inserts(docs: &[&str]) -> DeltaBatch {
        let mut batch = DeltaBatch::new();
        for (i, json) in docs.iter().enumerate() {
            batch.push(Delta::insert(rid(i as u64), doc(json), i as u64));
        }
        batch
    }

    #[test]
    fn test_sort_snapshot_descending() {
        let mut op = SortOp::new(spec(r#"{"x": -1}"#), 0, None);
        op.push(inserts(&[r#"{"x": 5}"#, r#"{"x": 1}"#, r#"{"x": 9}"#])).unwrap();
        assert_eq!(
            op.snapshot().unwrap(),
            vec![doc(r#"{"x": 9}"#), doc(r#"{"x": 5}"#), doc(r#"{"x": 1}"#)]
        );
    }

    #[test]
    fn test_sort_multi_key_and_stability() {
        let mut op = SortOp::new(spec(r#"{"a": 1, "b": -1}"#), 0, None);
        op.push(inserts(&[
            r#"{"a": 1, "b": 1, "tag": "first"}"#,
            r#"{"a": 1, "b": 1, "tag": "second"}"#,
            r#"{"a": 1, "b": 9}"#,
            r#"{"a": 0, "b": 0}"#,
        ]))
        .unwrap();
        let out = op.snapshot().unwrap();
        assert_eq!(out[0], doc(r#"{"a": 0, "b": 0}"#));
        assert_eq!(out[1], doc(r#"{"a": 1, "b": 9}"#));
        // Equal keys keep insertion order.
        assert_eq!(out[2], doc(r#"{"a": 1, "b": 1, "tag": "first"}"#));
        assert_eq!(out[3], doc(r#"{"a": 1, "b": 1, "tag": "second"}"#));
    }

    #[test]
    fn test_sort_with_skip_and_limit() {
        let mut op = SortOp::new(spec(r#"{"x": 1}"#), 1, Some(2));
        op.push(inserts(&[r#"{"x": 4}"#, r#"{"x": 1}"#, r#"{"x": 3}"#, r#"{"x": 2}"#])).unwrap();
        assert_eq!(op.snapshot().unwrap(), vec![doc(r#"{"x": 2}"#), doc(r#"{"x": 3}"#)]);
    }

    #[test]
    fn test_sort_delete_updates_order() {
        let mut op = SortOp::new(spec(r#"{"x": 1}"#), 0, None);
        op.push(inserts(&[r#"{"x": 2}"#, r#"{"x": 1}"#])).unwrap();
        let mut batch = DeltaBatch::new();
        batch.push(Delta::delete(rid(1), doc(r#"{"x": 1}"#), 5));
        op.push(batch).unwrap();
        assert_eq!(op.snapshot().unwrap(), vec![doc(r#"{"x": 2}"#)]);
    }

    #[test]
    fn test_limit_window_emits_diffs() {
        let mut op = WindowOp::limit(2);
        let out = op.push(inserts(&[r#"{"v": 1}"#, r#"{"v": 2}"#, r#"{"v": 3}"#])).unwrap();
        // Only the first two are in the window.
        assert_eq!(out.len(), 2);
        assert_eq!(op.snapshot().unwrap(), vec![doc(r#"{"v": 1}"#), doc(r#"{"v": 2}"#)]);

        // Deleting a window member pulls the next row in.
        let mut batch = DeltaBatch::new();
        batch.push(Delta::delete(rid(0), doc(r#"{"v": 1}"#), 9));
        let out = op.push(batch).unwrap();
        let kinds: Vec<DeltaOp> = out.deltas.iter().map(|d| d.op).collect();
        assert!(kinds.contains(&DeltaOp::Delete));
        assert!(kinds.contains(&DeltaOp::Insert));
        assert_eq!(op.snapshot().unwrap(), vec![doc(r#"{"v": 2}"#), doc(r#"{"v": 3}"#)]);
    }

    #[test]
    fn test_skip_window() {
        let mut op = WindowOp::skip(2);
        op.push(inserts(&[r#"{"v": 1}"#, r#"{"v": 2}"#, r#"{"v": 3}"#, r#"{"v": 4}"#])).unwrap();
        assert_eq!(op.snapshot().unwrap(), vec![doc(r#"{"v": 3}"#), doc(r#"{"v": 4}"#)]);
    }
}
