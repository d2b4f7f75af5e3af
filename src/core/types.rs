use serde::{Deserialize, Serialize};

use crate::core::value::Document;

/// Dense identity of a document within one collection. Assigned on first
/// insertion and stable for the document's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl RowId {
    pub fn new(id: u64) -> Self {
        RowId(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for RowId {
    fn from(id: u64) -> Self {
        RowId(id)
    }
}

/// Identity of a row flowing between pipeline stages. Source rows carry
/// `sub == 0`; cardinality-changing stages (unwind, group) synthesize
/// children with their own base and a nonzero sub index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rid {
    pub base: u64,
    pub sub: u32,
}

impl Rid {
    pub fn source(row: RowId) -> Self {
        Rid { base: row.0, sub: 0 }
    }

    pub fn child(base: u64, sub: u32) -> Self {
        Rid { base, sub }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOp {
    Insert,
    Update,
    Delete,
}

/// One change event. Insert carries `after`, delete carries `before`,
/// update carries both; `seq` advances monotonically per collection.
#[derive(Debug, Clone)]
pub struct Delta {
    pub op: DeltaOp,
    pub rid: Rid,
    pub before: Option<Document>,
    pub after: Option<Document>,
    pub seq: u64,
}

impl Delta {
    pub fn insert(rid: Rid, doc: Document, seq: u64) -> Self {
        Delta { op: DeltaOp::Insert, rid, before: None, after: Some(doc), seq }
    }

    pub fn delete(rid: Rid, doc: Document, seq: u64) -> Self {
        Delta { op: DeltaOp::Delete, rid, before: Some(doc), after: None, seq }
    }

    pub fn update(rid: Rid, before: Document, after: Document, seq: u64) -> Self {
        Delta { op: DeltaOp::Update, rid, before: Some(before), after: Some(after), seq }
    }
}

/// An ordered run of deltas. Order among deltas sharing a rid is
/// significant; order across distinct rids is not observable.
#[derive(Debug, Clone, Default)]
pub struct DeltaBatch {
    pub deltas: Vec<Delta>,
}

impl DeltaBatch {
    pub fn new() -> Self {
        DeltaBatch { deltas: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        DeltaBatch { deltas: Vec::with_capacity(capacity) }
    }

    pub fn push(&mut self, delta: Delta) {
        self.deltas.push(delta);
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn clear(&mut self) {
        self.deltas.clear();
    }
}
