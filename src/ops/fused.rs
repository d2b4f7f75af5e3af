use crate::bitmap::live_set::LiveSet;
use crate::core::error::Result;
use crate::core::types::{Delta, DeltaBatch, DeltaOp};
use crate::core::value::Document;
use crate::expr::ast::Expr;
use crate::expr::column::{Column, eval_vector};
use crate::ops::project::Shape;
use crate::ops::sort::WindowOp;
use crate::ops::{Operator, delta_after, delta_before};
use crate::query::predicate::{CmpOp, Predicate};

/// One step of a fused linear run.
#[derive(Debug)]
pub enum FusedStep {
    Match(Predicate),
    Shape(Shape),
    Skip(usize),
    Limit(usize),
}

/// Batches below this size take the scalar path; vectorization overhead
/// does not pay off.
const MIN_VECTOR_BATCH: usize = 8;

/// A maximal run of match/project/addFields (with trailing skip/limit)
/// collapsed into one operator. All-insert batches evaluate match masks
/// column-wise through the numeric kernels; everything else runs the
/// same per-document transforms the unfused operators would, so the
/// fused run is observationally identical to the stages it replaces.
#[derive(Debug)]
pub struct FusedOp {
    transforms: Vec<FusedStep>,
    window: Option<WindowOp>,
}

impl FusedOp {
    pub fn new(steps: Vec<FusedStep>) -> Self {
        let mut transforms = Vec::new();
        let mut skip = 0usize;
        let mut limit: Option<usize> = None;
        let mut windowed = false;
        for step in steps {
            match step {
                FusedStep::Skip(n) => {
                    windowed = true;
                    skip += n;
                    limit = limit.map(|l| l.saturating_sub(n));
                }
                FusedStep::Limit(k) => {
                    windowed = true;
                    limit = Some(limit.map(|l| l.min(k)).unwrap_or(k));
                }
                other => transforms.push(other),
            }
        }
        let window = windowed.then(|| WindowOp::window(skip, limit));
        FusedOp { transforms, window }
    }

    fn apply_transforms(&self, doc: &Document) -> Option<Document> {
        let mut current = doc.clone();
        for step in &self.transforms {
            match step {
                FusedStep::Match(pred) => {
                    if !pred.matches(&current) {
                        return None;
                    }
                }
                FusedStep::Shape(shape) => current = shape.apply(&current),
                FusedStep::Skip(_) | FusedStep::Limit(_) => {}
            }
        }
        Some(current)
    }

    fn transform_delta(&self, delta: &Delta) -> Result<Option<Delta>> {
        Ok(match delta.op {
            DeltaOp::Insert => self
                .apply_transforms(delta_after(delta)?)
                .map(|doc| Delta::insert(delta.rid, doc, delta.seq)),
            DeltaOp::Delete => self
                .apply_transforms(delta_before(delta)?)
                .map(|doc| Delta::delete(delta.rid, doc, delta.seq)),
            DeltaOp::Update => {
                let before = self.apply_transforms(delta_before(delta)?);
                let after = self.apply_transforms(delta_after(delta)?);
                match (before, after) {
                    (Some(b), Some(a)) => Some(Delta::update(delta.rid, b, a, delta.seq)),
                    (None, Some(a)) => Some(Delta::insert(delta.rid, a, delta.seq)),
                    (Some(b), None) => Some(Delta::delete(delta.rid, b, delta.seq)),
                    (None, None) => None,
                }
            }
        })
    }

    /// All-insert fast path: run match masks vectorized, then shape the
    /// survivors.
    fn transform_inserts_vectorized(&self, batch: &DeltaBatch) -> Result<DeltaBatch> {
        let mut working: Vec<(usize, Document)> = batch
            .deltas
            .iter()
            .enumerate()
            .map(|(i, d)| Ok((i, delta_after(d)?.clone())))
            .collect::<Result<_>>()?;

        for step in &self.transforms {
            match step {
                FusedStep::Match(pred) => {
                    let refs: Vec<&Document> = working.iter().map(|(_, d)| d).collect();
                    let mask = predicate_mask(pred, &refs);
                    let mut lane = 0;
                    working.retain(|_| {
                        let keep = mask.test(lane);
                        lane += 1;
                        keep
                    });
                }
                FusedStep::Shape(shape) => {
                    for (_, doc) in working.iter_mut() {
                        *doc = shape.apply(doc);
                    }
                }
                FusedStep::Skip(_) | FusedStep::Limit(_) => {}
            }
        }

        let mut out = DeltaBatch::with_capacity(working.len());
        for (i, doc) in working {
            let source = &batch.deltas[i];
            out.push(Delta::insert(source.rid, doc, source.seq));
        }
        Ok(out)
    }
}

impl Operator for FusedOp {
    fn name(&self) -> &'static str {
        "fused"
    }

    fn push(&mut self, batch: DeltaBatch) -> Result<DeltaBatch> {
        let all_inserts = batch.deltas.iter().all(|d| d.op == DeltaOp::Insert);
        let transformed = if all_inserts && batch.len() >= MIN_VECTOR_BATCH {
            self.transform_inserts_vectorized(&batch)?
        } else {
            let mut out = DeltaBatch::with_capacity(batch.len());
            for delta in &batch.deltas {
                if let Some(mapped) = self.transform_delta(delta)? {
                    out.push(mapped);
                }
            }
            out
        };
        match &mut self.window {
            Some(window) => window.push(transformed),
            None => Ok(transformed),
        }
    }

    fn snapshot(&self) -> Option<Vec<Document>> {
        self.window.as_ref().and_then(|w| w.snapshot())
    }

    fn transform(&self, doc: &Document) -> Vec<Document> {
        self.apply_transforms(doc).into_iter().collect()
    }

    fn reset(&mut self) {
        if let Some(window) = &mut self.window {
            window.reset();
        }
    }
}

/// Evaluate a predicate over a batch of documents into a keep-mask.
/// Numeric comparisons ride the column kernels; every other shape falls
/// back to per-document evaluation, so the mask always agrees with
/// `Predicate::matches`.
fn predicate_mask(pred: &Predicate, docs: &[&Document]) -> LiveSet {
    let len = docs.len();
    match pred {
        Predicate::True => {
            let mut mask = LiveSet::new();
            mask.resize_len(len);
            for i in 0..len {
                mask.set(i);
            }
            mask
        }
        Predicate::And(list) => {
            let mut mask: Option<LiveSet> = None;
            for child in list {
                let m = predicate_mask(child, docs);
                mask = Some(match mask {
                    None => m,
                    Some(acc) => acc.and(&m),
                });
            }
            mask.unwrap_or_else(|| predicate_mask(&Predicate::True, docs))
        }
        Predicate::Or(list) => {
            let mut mask = LiveSet::new();
            mask.resize_len(len);
            for child in list {
                mask.or_assign(&predicate_mask(child, docs));
            }
            mask
        }
        Predicate::Not(inner) => {
            let mut mask = predicate_mask(inner, docs);
            mask.resize_len(len);
            mask.not_inplace();
            mask
        }
        Predicate::Nor(list) => {
            let mut mask = LiveSet::new();
            mask.resize_len(len);
            for child in list {
                mask.or_assign(&predicate_mask(child, docs));
            }
            mask.not_inplace();
            mask
        }
        Predicate::Cmp { path, op, value } if value.is_numeric() => {
            let column = eval_vector(&Expr::FieldPath(path.clone()), docs);
            if let Column::Numeric { values, nulls } = column {
                let target = value.as_f64().unwrap_or(f64::NAN);
                let mut mask = LiveSet::new();
                mask.resize_len(len);
                for (i, v) in values.iter().enumerate() {
                    let hit = if nulls.test(i) {
                        // Missing or null lane: only $ne matches a number.
                        matches!(op, CmpOp::Ne)
                    } else {
                        match op {
                            CmpOp::Eq => *v == target,
                            CmpOp::Ne => *v != target,
                            CmpOp::Gt => *v > target,
                            CmpOp::Gte => *v >= target,
                            CmpOp::Lt => *v < target,
                            CmpOp::Lte => *v <= target,
                        }
                    };
                    if hit {
                        mask.set(i);
                    }
                }
                return mask;
            }
            scalar_mask(pred, docs)
        }
        _ => scalar_mask(pred, docs),
    }
}

fn scalar_mask(pred: &Predicate, docs: &[&Document]) -> LiveSet {
    let mut mask = LiveSet::new();
    mask.resize_len(docs.len());
    for (i, doc) in docs.iter().enumerate() {
        if pred.matches(doc) {
            mask.set(i);
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Rid, RowId};
    use crate::ops::project::Projection;

    fn doc(json: &str) -> Document {
        Document::from_json(&serde_json::from_str(json).unwrap()).unwrap()
    }

    fn rid(n: u64) -> Rid {
        Rid::source(RowId(n))
    }

    fn pred(json: &str) -> Predicate {
        Predicate::compile(&serde_json::from_str(json).unwrap()).unwrap()
    }

    fn projection(json: &str) -> Shape {
        Shape::Project(Projection::compile(&serde_json::from_str(json).unwrap()).unwrap())
    }

    fn inserts(docs: &[String]) -> DeltaBatch {
        let mut batch = DeltaBatch::new();
        for (i, json) in docs.iter().enumerate() {
            batch.push(Delta::insert(rid(i as u64), doc(json), i as u64));
        }
        batch
    }

    fn fused_match_project() -> FusedOp {
        FusedOp::new(vec![
            FusedStep::Match(pred(r#"{"v": {"$gte": 10}}"#)),
            FusedStep::Shape(projection(r#"{"v": 1, "_id": 0}"#)),
        ])
    }

    #[test]
    fn test_vectorized_matches_scalar_path() {
        let docs: Vec<String> = (0..64).map(|i| format!(r#"{{"v": {}, "x": "k{}"}}"#, i, i)).collect();

        let mut vectorized = fused_match_project();
        let big = vectorized.push(inserts(&docs)).unwrap();

        let mut scalar = fused_match_project();
        let mut small_out = Vec::new();
        for chunk in docs.chunks(2) {
            // Two-delta batches stay under the vectorization threshold.
            let out = scalar.push(inserts(chunk)).unwrap();
            small_out.extend(out.deltas);
        }
        let big_docs: Vec<&Document> = big.deltas.iter().filter_map(|d| d.after.as_ref()).collect();
        let small_docs: Vec<&Document> =
            small_out.iter().filter_map(|d| d.after.as_ref()).collect();
        assert_eq!(big_docs, small_docs);
        assert_eq!(big_docs.len(), 54);
    }

    #[test]
    fn test_mask_agrees_with_predicate_on_mixed_types() {
        let owned: Vec<Document> = [
            r#"{"v": 5}"#,
            r#"{"v": "5"}"#,
            r#"{}"#,
            r#"{"v": null}"#,
            r#"{"v": 5.0}"#,
        ]
        .iter()
        .map(|j| doc(j))
        .collect();
        let refs: Vec<&Document> = owned.iter().collect();
        for p in [
            pred(r#"{"v": 5}"#),
            pred(r#"{"v": {"$ne": 5}}"#),
            pred(r#"{"v": {"$gt": 4}}"#),
            pred(r#"{"v": {"$lte": 5}}"#),
        ] {
            let mask = predicate_mask(&p, &refs);
            for (i, d) in refs.iter().enumerate() {
                assert_eq!(mask.test(i), p.matches(d), "pred {:?} lane {}", p, i);
            }
        }
    }

    #[test]
    fn test_trailing_window_composition() {
        let mut op = FusedOp::new(vec![
            FusedStep::Match(pred(r#"{"v": {"$gte": 0}}"#)),
            FusedStep::Skip(1),
            FusedStep::Limit(2),
        ]);
        let docs: Vec<String> = (0..5).map(|i| format!(r#"{{"v": {}}}"#, i)).collect();
        op.push(inserts(&docs)).unwrap();
        assert_eq!(
            op.snapshot().unwrap(),
            vec![doc(r#"{"v": 1}"#), doc(r#"{"v": 2}"#)]
        );
    }

    #[test]
    fn test_update_through_fused_run() {
        let mut op = fused_match_project();
        let mut batch = DeltaBatch::new();
        batch.push(Delta::update(rid(0), doc(r#"{"v": 5}"#), doc(r#"{"v": 50}"#), 1));
        let out = op.push(batch).unwrap();
        assert_eq!(out.deltas[0].op, DeltaOp::Insert);
        assert_eq!(out.deltas[0].after, Some(doc(r#"{"v": 50}"#)));
    }
}
