use std::cmp::Ordering;
use std::collections::HashMap;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Delta, DeltaBatch, DeltaOp, Rid};
use crate::core::value::{Document, Value};
use crate::ops::sort::SortSpec;
use crate::ops::{Operator, delta_after, delta_before};

#[derive(Debug)]
struct Entry {
    keys: Vec<Value>,
    arrival: u64,
    doc: Document,
}

/// Fused `$sort` + `$limit`: a bounded stable buffer of the k best rows
/// under a field-ordered sort spec, ties broken by insertion order.
///
/// Inserts compare against the current worst; a delete that hits the
/// buffer refills by rescanning the full input mirror, which is
/// acceptable because the buffer is small and deletes into it are rare.
#[derive(Debug)]
pub struct TopKOp {
    spec: SortSpec,
    skip: usize,
    k: usize, // skip + limit
    inputs: HashMap<Rid, Entry>,
    next_arrival: u64,
    buffer: Vec<Rid>,
    window: Vec<(Rid, Document)>,
}

impl TopKOp {
    pub fn new(spec: SortSpec, skip: usize, limit: usize) -> Self {
        TopKOp {
            spec,
            skip,
            k: skip + limit,
            inputs: HashMap::new(),
            next_arrival: 0,
            buffer: Vec::new(),
            window: Vec::new(),
        }
    }

    fn compare(&self, a: &Entry, b: &Entry) -> Ordering {
        self.spec.compare_keys(&a.keys, &b.keys).then(a.arrival.cmp(&b.arrival))
    }

    fn compare_rids(&self, a: Rid, b: Rid) -> Ordering {
        self.compare(&self.inputs[&a], &self.inputs[&b])
    }

    fn insert_rid(&mut self, rid: Rid) {
        if self.k == 0 {
            return;
        }
        if self.buffer.len() < self.k {
            let pos = self
                .buffer
                .binary_search_by(|other| self.compare_rids(*other, rid))
                .unwrap_or_else(|p| p);
            self.buffer.insert(pos, rid);
            return;
        }
        let worst = *self.buffer.last().expect("buffer is nonempty when full");
        if self.compare_rids(rid, worst) == Ordering::Less {
            self.buffer.pop();
            let pos = self
                .buffer
                .binary_search_by(|other| self.compare_rids(*other, rid))
                .unwrap_or_else(|p| p);
            self.buffer.insert(pos, rid);
        }
    }

    fn rebuild(&mut self) {
        let mut rids: Vec<Rid> = self.inputs.keys().copied().collect();
        rids.sort_by(|a, b| self.compare_rids(*a, *b));
        rids.truncate(self.k);
        self.buffer = rids;
    }

    fn current_window(&self) -> Vec<(Rid, Document)> {
        self.buffer
            .iter()
            .skip(self.skip)
            .map(|rid| (*rid, self.inputs[rid].doc.clone()))
            .collect()
    }
}

impl Operator for TopKOp {
    fn name(&self) -> &'static str {
        "topk"
    }

    fn push(&mut self, batch: DeltaBatch) -> Result<DeltaBatch> {
        let seq = batch.deltas.last().map(|d| d.seq).unwrap_or(0);
        let mut needs_rebuild = false;
        for delta in &batch.deltas {
            match delta.op {
                DeltaOp::Insert => {
                    let doc = delta_after(delta)?.clone();
                    let entry = Entry {
                        keys: self.spec.key_of(&doc),
                        arrival: self.next_arrival,
                        doc,
                    };
                    self.next_arrival += 1;
                    if self.inputs.insert(delta.rid, entry).is_some() {
                        return Err(Error::new(
                            ErrorKind::Internal,
                            format!("top-k input already holds rid {:?}", delta.rid),
                        ));
                    }
                    if !needs_rebuild {
                        self.insert_rid(delta.rid);
                    }
                }
                DeltaOp::Delete => {
                    let _ = delta_before(delta)?;
                    if self.inputs.remove(&delta.rid).is_none() {
                        return Err(Error::new(
                            ErrorKind::Internal,
                            format!("top-k delete for unknown rid {:?}", delta.rid),
                        ));
                    }
                    if let Some(pos) = self.buffer.iter().position(|r| *r == delta.rid) {
                        self.buffer.remove(pos);
                        needs_rebuild = true;
                    }
                }
                DeltaOp::Update => {
                    let Some(entry) = self.inputs.get_mut(&delta.rid) else {
                        return Err(Error::new(
                            ErrorKind::Internal,
                            format!("top-k update for unknown rid {:?}", delta.rid),
                        ));
                    };
                    let doc = delta_after(delta)?.clone();
                    entry.keys = self.spec.key_of(&doc);
                    entry.doc = doc;
                    needs_rebuild = true;
                }
            }
        }
        if needs_rebuild {
            self.rebuild();
        }

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
        self.inputs.clear();
        self.buffer.clear();
        self.window.clear();
        self.next_arrival = 0;
    }
}

/// Per-group bounded Top-K: one buffer per group key, used when a sorted
/// limit applies within groups rather than globally.
#[derive(Debug)]
pub struct GroupedTopK {
    spec: SortSpec,
    k: usize,
    groups: HashMap<Value, GroupBuffer>,
    next_arrival: u64,
}

#[derive(Debug, Default)]
struct GroupBuffer {
    entries: HashMap<Rid, (Vec<Value>, u64, Document)>,
    buffer: Vec<Rid>,
}

impl GroupedTopK {
    pub fn new(spec: SortSpec, k: usize) -> Self {
        GroupedTopK { spec, k, groups: HashMap::new(), next_arrival: 0 }
    }

    pub fn insert(&mut self, group: Value, rid: Rid, doc: Document) {
        let keys = self.spec.key_of(&doc);
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        let slot = self.groups.entry(group).or_default();
        slot.entries.insert(rid, (keys, arrival, doc));
        Self::rebuild_buffer(&self.spec, self.k, slot);
    }

    pub fn remove(&mut self, group: &Value, rid: Rid) {
        let Some(slot) = self.groups.get_mut(group) else {
            return;
        };
        slot.entries.remove(&rid);
        if slot.entries.is_empty() {
            self.groups.remove(group);
            return;
        }
        Self::rebuild_buffer(&self.spec, self.k, slot);
    }

    fn rebuild_buffer(spec: &SortSpec, k: usize, slot: &mut GroupBuffer) {
        let mut rids: Vec<Rid> = slot.entries.keys().copied().collect();
        rids.sort_by(|a, b| {
            let (ka, aa, _) = &slot.entries[a];
            let (kb, ab, _) = &slot.entries[b];
            spec.compare_keys(ka, kb).then(aa.cmp(ab))
        });
        rids.truncate(k);
        slot.buffer = rids;
    }

    /// The current top-k documents of one group, in order.
    pub fn top(&self, group: &Value) -> Vec<&Document> {
        self.groups
            .get(group)
            .map(|slot| slot.buffer.iter().map(|rid| &slot.entries[rid].2).collect())
            .unwrap_or_default()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}
