use crate::core::error::Result;
use crate::core::types::{Delta, DeltaBatch, DeltaOp};
use crate::core::value::Document;
use crate::ops::{Operator, delta_after, delta_before};
use crate::query::predicate::Predicate;

/// Incremental `$match`. Stateless: inserts and deletes pass through iff
/// the predicate holds; an update maps to one of pass-through update,
/// insert-only, delete-only, or drop, depending on which sides match.
#[derive(Debug)]
pub struct FilterOp {
    predicate: Predicate,
}

impl FilterOp {
    pub fn new(predicate: Predicate) -> Self {
        FilterOp { predicate }
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }
}

impl Operator for FilterOp {
    fn name(&self) -> &'static str {
        "match"
    }

    fn push(&mut self, batch: DeltaBatch) -> Result<DeltaBatch> {
        let mut out = DeltaBatch::with_capacity(batch.len());
        for delta in batch.deltas {
            match delta.op {
                DeltaOp::Insert => {
                    if self.predicate.matches(delta_after(&delta)?) {
                        out.push(delta);
                    }
                }
                DeltaOp::Delete => {
                    if self.predicate.matches(delta_before(&delta)?) {
                        out.push(delta);
                    }
                }
                DeltaOp::Update => {
                    let before = delta_before(&delta)?;
                    let after = delta_after(&delta)?;
                    match (self.predicate.matches(before), self.predicate.matches(after)) {
                        (true, true) => out.push(delta),
                        (false, true) => {
                            let entered = Delta::insert(delta.rid, after.clone(), delta.seq);
                            out.push(entered);
                        }
                        (true, false) => {
                            let left = Delta::delete(delta.rid, before.clone(), delta.seq);
                            out.push(left);
                        }
                        (false, false) => {}
                    }
                }
            }
        }
        Ok(out)
    }

    fn transform(&self, doc: &Document) -> Vec<Document> {
        if self.predicate.matches(doc) {
            vec![doc.clone()]
        } else {
            Vec::new()
        }
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Rid, RowId};

    fn doc(json: &str) -> Document {
        Document::from_json(&serde_json::from_str(json).unwrap()).unwrap()
    }

    fn op(json: &str) -> FilterOp {
        FilterOp::new(Predicate::compile(&serde_json::from_str(json).unwrap()).unwrap())
    }

    fn rid(n: u64) -> Rid {
        Rid::source(RowId(n))
    }

    #[test]
    fn test_insert_and_delete_filtering() {
        let mut f = op(r#"{"age": {"$gte": 18}}"#);
        let mut batch = DeltaBatch::new();
        batch.push(Delta::insert(rid(0), doc(r#"{"age": 17}"#), 0));
        batch.push(Delta::insert(rid(1), doc(r#"{"age": 21}"#), 1));
        batch.push(Delta::delete(rid(2), doc(r#"{"age": 30}"#), 2));
        let out = f.push(batch).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out.deltas[0].rid, rid(1));
        assert_eq!(out.deltas[1].op, DeltaOp::Delete);
    }

    #[test]
    fn test_update_entering_the_view_emits_insert_only() {
        let mut f = op(r#"{"age": {"$gte": 18}}"#);
        let mut batch = DeltaBatch::new();
        batch.push(Delta::update(rid(0), doc(r#"{"age": 17}"#), doc(r#"{"age": 19}"#), 1));
        let out = f.push(batch).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.deltas[0].op, DeltaOp::Insert);
        assert_eq!(out.deltas[0].after, Some(doc(r#"{"age": 19}"#)));
    }

    #[test]
    fn test_update_leaving_the_view_emits_delete_only() {
        let mut f = op(r#"{"age": {"$gte": 18}}"#);
        let mut batch = DeltaBatch::new();
        batch.push(Delta::update(rid(0), doc(r#"{"age": 20}"#), doc(r#"{"age": 10}"#), 1));
        let out = f.push(batch).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.deltas[0].op, DeltaOp::Delete);
    }

    #[test]
    fn test_update_staying_in_or_out() {
        let mut f = op(r#"{"age": {"$gte": 18}}"#);
        let mut batch = DeltaBatch::new();
        batch.push(Delta::update(rid(0), doc(r#"{"age": 20}"#), doc(r#"{"age": 25}"#), 1));
        batch.push(Delta::update(rid(1), doc(r#"{"age": 5}"#), doc(r#"{"age": 6}"#), 2));
        let out = f.push(batch).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.deltas[0].op, DeltaOp::Update);
    }
}
