use std::collections::BTreeMap;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{DeltaBatch, DeltaOp, Rid};
use crate::core::value::Document;
use crate::ops::Operator;
use crate::ops::filter::FilterOp;
use crate::ops::fused::FusedOp;
use crate::ops::group::GroupOp;
use crate::ops::project::{ProjectOp, Shape};
use crate::ops::sort::{SortOp, WindowOp};
use crate::ops::topk::TopKOp;
use crate::ops::unwind::UnwindOp;
use crate::pipeline::fuser::PlanNode;
use crate::pipeline::stage::Stage;

/// The installed pipeline as a chain of incremental operators, rooted at
/// the collection's delta feed. Each node owns its downstream state
/// exclusively; delta batches flow front to back.
#[derive(Debug)]
pub struct OperatorGraph {
    ops: Vec<Box<dyn Operator>>,
    // Mirror of the source inputs, the materialization base when no
    // state-bearing operator exists in the chain.
    mirror: BTreeMap<Rid, Document>,
}

impl OperatorGraph {
    pub fn build(plan: Vec<PlanNode>) -> Self {
        let ops: Vec<Box<dyn Operator>> = plan
            .into_iter()
            .map(|node| -> Box<dyn Operator> {
                match node {
                    PlanNode::Fused(steps) => Box::new(FusedOp::new(steps)),
                    PlanNode::TopK { spec, skip, limit } => {
                        Box::new(TopKOp::new(spec, skip, limit))
                    }
                    PlanNode::Sort { spec, skip, limit } => {
                        Box::new(SortOp::new(spec, skip, limit))
                    }
                    PlanNode::Stage(stage) => match stage {
                        Stage::Match(pred) => Box::new(FilterOp::new(pred)),
                        Stage::Project(projection) => {
                            Box::new(ProjectOp::new(Shape::Project(projection)))
                        }
                        Stage::AddFields(assignments) => {
                            Box::new(ProjectOp::new(Shape::AddFields(assignments)))
                        }
                        Stage::Unwind { path, preserve_null_and_empty } => {
                            Box::new(UnwindOp::new(path, preserve_null_and_empty))
                        }
                        Stage::Group { key, accumulators } => {
                            Box::new(GroupOp::new(key, accumulators))
                        }
                        Stage::Sort(spec) => Box::new(SortOp::new(spec, 0, None)),
                        Stage::Limit(k) => Box::new(WindowOp::limit(k)),
                        Stage::Skip(n) => Box::new(WindowOp::skip(n)),
                    },
                }
            })
            .collect();
        OperatorGraph { ops, mirror: BTreeMap::new() }
    }

    pub fn operator_count(&self) -> usize {
        self.ops.len()
    }

    /// Feed one batch through the whole chain.
    pub fn push(&mut self, batch: DeltaBatch) -> Result<()> {
        for delta in &batch.deltas {
            match delta.op {
                DeltaOp::Insert => {
                    let doc = delta.after.clone().ok_or_else(|| {
                        Error::new(ErrorKind::Internal, "insert without after image".to_string())
                    })?;
                    if self.mirror.insert(delta.rid, doc).is_some() {
                        return Err(Error::new(
                            ErrorKind::Internal,
                            format!("duplicate insert for rid {:?}", delta.rid),
                        ));
                    }
                }
                DeltaOp::Delete => {
                    if self.mirror.remove(&delta.rid).is_none() {
                        return Err(Error::new(
                            ErrorKind::Internal,
                            format!("delete for unknown rid {:?}", delta.rid),
                        ));
                    }
                }
                DeltaOp::Update => {
                    let doc = delta.after.clone().ok_or_else(|| {
                        Error::new(ErrorKind::Internal, "update without after image".to_string())
                    })?;
                    if self.mirror.insert(delta.rid, doc).is_none() {
                        return Err(Error::new(
                            ErrorKind::Internal,
                            format!("update for unknown rid {:?}", delta.rid),
                        ));
                    }
                }
            }
        }

        let mut current = batch;
        for op in self.ops.iter_mut() {
            if current.is_empty() {
                break;
            }
            current = op.push(current)?;
        }
        Ok(())
    }

    /// Current pipeline output without re-executing upstream stages: the
    /// deepest state-bearing operator supplies its snapshot and any
    /// pass-through stages after it replay per document.
    pub fn materialize(&self) -> Vec<Document> {
        let last_stateful = self.ops.iter().rposition(|op| op.snapshot().is_some());
        let (mut docs, start) = match last_stateful {
            Some(i) => (self.ops[i].snapshot().unwrap_or_default(), i + 1),
            None => (self.mirror.values().cloned().collect(), 0),
        };
        for op in &self.ops[start..] {
            docs = docs.iter().flat_map(|doc| op.transform(doc)).collect();
        }
        docs
    }

    pub fn reset(&mut self) {
        for op in self.ops.iter_mut() {
            op.reset();
        }
        self.mirror.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::types::{Delta, RowId};
    use crate::pipeline::fuser::fuse;
    use crate::pipeline::stage::classify;

    fn doc(json: &str) -> Document {
        Document::from_json(&serde_json::from_str(json).unwrap()).unwrap()
    }

    fn graph(pipeline: &str) -> OperatorGraph {
        let stages: Vec<serde_json::Value> = serde_json::from_str(pipeline).unwrap();
        let classified = classify(&stages).unwrap();
        OperatorGraph::build(fuse(classified, &Config::default()).unwrap())
    }

    fn rid(n: u64) -> Rid {
        Rid::source(RowId(n))
    }

    fn push_inserts(g: &mut OperatorGraph, docs: &[&str]) {
        let mut batch = DeltaBatch::new();
        for (i, json) in docs.iter().enumerate() {
            batch.push(Delta::insert(rid(i as u64), doc(json), i as u64));
        }
        g.push(batch).unwrap();
    }

    const D1: [&str; 3] = [r#"{"c": "a", "v": 10}"#, r#"{"c": "b", "v": 20}"#, r#"{"c": "a", "v": 30}"#];

    #[test]
    fn test_projection_passthrough() {
        let mut g = graph(r#"[{"$project": {"v": 1, "_id": 0}}]"#);
        push_inserts(&mut g, &D1);
        assert_eq!(
            g.materialize(),
            vec![doc(r#"{"v": 10}"#), doc(r#"{"v": 20}"#), doc(r#"{"v": 30}"#)]
        );
    }

    #[test]
    fn test_grouped_sum_with_incremental_delete() {
        let mut g = graph(r#"[{"$group": {"_id": "$c", "s": {"$sum": "$v"}}}]"#);
        push_inserts(&mut g, &D1);
        assert_eq!(
            g.materialize(),
            vec![doc(r#"{"_id": "a", "s": 40}"#), doc(r#"{"_id": "b", "s": 20}"#)]
        );

        let mut batch = DeltaBatch::new();
        batch.push(Delta::delete(rid(0), doc(D1[0]), 3));
        g.push(batch).unwrap();
        assert_eq!(
            g.materialize(),
            vec![doc(r#"{"_id": "a", "s": 30}"#), doc(r#"{"_id": "b", "s": 20}"#)]
        );
    }

    #[test]
    fn test_unwind_scenarios() {
        let data = [r#"{"a": [1, 2, 3]}"#, r#"{"a": []}"#, r#"{"a": null}"#];
        let mut g = graph(r#"[{"$unwind": "$a"}]"#);
        push_inserts(&mut g, &data);
        assert_eq!(
            g.materialize(),
            vec![doc(r#"{"a": 1}"#), doc(r#"{"a": 2}"#), doc(r#"{"a": 3}"#)]
        );

        let mut g = graph(r#"[{"$unwind": {"path": "$a", "preserveNullAndEmptyArrays": true}}]"#);
        push_inserts(&mut g, &data);
        assert_eq!(
            g.materialize(),
            vec![doc(r#"{"a": 1}"#), doc(r#"{"a": 2}"#), doc(r#"{"a": 3}"#), doc(r#"{}"#), doc(r#"{}"#)]
        );
    }

    #[test]
    fn test_topk_scenario() {
        let data = [r#"{"x": 5}"#, r#"{"x": 1}"#, r#"{"x": 9}"#, r#"{"x": 3}"#, r#"{"x": 7}"#];
        let mut g = graph(r#"[{"$sort": {"x": -1}}, {"$limit": 2}]"#);
        push_inserts(&mut g, &data);
        assert_eq!(g.materialize(), vec![doc(r#"{"x": 9}"#), doc(r#"{"x": 7}"#)]);
    }

    #[test]
    fn test_sort_then_match_keeps_order() {
        let mut g = graph(r#"[{"$sort": {"v": 1}}, {"$match": {"v": {"$gt": 10}}}]"#);
        push_inserts(&mut g, &D1);
        assert_eq!(g.materialize(), vec![doc(D1[1]), doc(D1[2])]);
    }

    #[test]
    fn test_match_group_chain_under_updates() {
        let mut g = graph(
            r#"[
                {"$match": {"v": {"$gte": 15}}},
                {"$group": {"_id": "$c", "n": {"$sum": 1}}}
            ]"#,
        );
        push_inserts(&mut g, &D1);
        assert_eq!(
            g.materialize(),
            vec![doc(r#"{"_id": "b", "n": 1}"#), doc(r#"{"_id": "a", "n": 1}"#)]
        );

        // Row 0 rises into the view and lands in group "a".
        let mut batch = DeltaBatch::new();
        batch.push(Delta::update(rid(0), doc(D1[0]), doc(r#"{"c": "a", "v": 99}"#), 4));
        g.push(batch).unwrap();
        assert_eq!(
            g.materialize(),
            vec![doc(r#"{"_id": "b", "n": 1}"#), doc(r#"{"_id": "a", "n": 2}"#)]
        );
    }

    #[test]
    fn test_insert_then_delete_restores_output() {
        let mut g = graph(r#"[{"$group": {"_id": "$c", "s": {"$sum": "$v"}}}]"#);
        push_inserts(&mut g, &D1);
        let before = g.materialize();

        let mut batch = DeltaBatch::new();
        batch.push(Delta::insert(rid(99), doc(r#"{"c": "z", "v": 1}"#), 10));
        g.push(batch).unwrap();
        assert_ne!(g.materialize(), before);

        let mut batch = DeltaBatch::new();
        batch.push(Delta::delete(rid(99), doc(r#"{"c": "z", "v": 1}"#), 11));
        g.push(batch).unwrap();
        assert_eq!(g.materialize(), before);
    }

    #[test]
    fn test_invariant_violation_surfaces() {
        let mut g = graph(r#"[{"$group": {"_id": "$c"}}]"#);
        push_inserts(&mut g, &[r#"{"c": 1}"#]);
        let mut batch = DeltaBatch::new();
        batch.push(Delta::delete(rid(7), doc(r#"{"c": 1}"#), 5));
        assert!(g.push(batch).is_err());
    }
}
