use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use roaring::RoaringTreemap;

use crate::index::dimension::Dimension;
use crate::index::zonemap::SkipOp;
use crate::query::predicate::{CmpOp, Predicate};

/// How to evaluate a predicate against the whole store.
#[derive(Debug)]
pub enum ScanPlan {
    /// Evaluate the predicate per document, chunk-skipping where a zone
    /// map rules a chunk out.
    Full,
    /// Index-derived candidate rows. When `exact` is false the predicate
    /// must still be verified per candidate.
    Candidates { rows: RoaringTreemap, exact: bool },
}

pub type DimensionMap = HashMap<String, Arc<RwLock<Dimension>>>;

/// Choose an access path for a predicate given the dimensions that are
/// already built. Conjunctions intersect their children's candidate
/// sets; disjunctions only narrow when every branch narrows.
pub fn plan(pred: &Predicate, dims: &DimensionMap) -> ScanPlan {
    match pred {
        Predicate::Cmp { path, op, value } => {
            let Some(dim) = dims.get(path) else {
                return ScanPlan::Full;
            };
            let dim = dim.read();
            if dim.has_array_values() {
                // Membership semantics over array fields need the scan.
                return ScanPlan::Full;
            }
            match op {
                CmpOp::Eq => ScanPlan::Candidates { rows: dim.equal(value), exact: true },
                CmpOp::Gt => ScanPlan::Candidates {
                    rows: dim.range(Some(value), None, false, false),
                    exact: false,
                },
                CmpOp::Gte => ScanPlan::Candidates {
                    rows: dim.range(Some(value), None, true, false),
                    exact: false,
                },
                CmpOp::Lt => ScanPlan::Candidates {
                    rows: dim.range(None, Some(value), false, false),
                    exact: false,
                },
                CmpOp::Lte => ScanPlan::Candidates {
                    rows: dim.range(None, Some(value), false, true),
                    exact: false,
                },
                // Inequality is rarely selective; scan.
                CmpOp::Ne => ScanPlan::Full,
            }
        }
        Predicate::In { path, values, negate, .. } => {
            if *negate {
                return ScanPlan::Full;
            }
            let Some(dim) = dims.get(path) else {
                return ScanPlan::Full;
            };
            let dim = dim.read();
            if dim.has_array_values() {
                return ScanPlan::Full;
            }
            let mut rows = RoaringTreemap::new();
            for value in values {
                rows |= dim.equal(value);
            }
            ScanPlan::Candidates { rows, exact: true }
        }
        Predicate::And(list) => {
            let mut acc: Option<RoaringTreemap> = None;
            let mut all_indexed = true;
            let mut all_exact = true;
            for child in list {
                match plan(child, dims) {
                    ScanPlan::Candidates { rows, exact } => {
                        acc = Some(match acc {
                            None => rows,
                            Some(prev) => prev & rows,
                        });
                        all_exact &= exact;
                    }
                    // An un-indexed sibling forces verification of the
                    // full predicate over the candidates.
                    ScanPlan::Full => all_indexed = false,
                }
            }
            match acc {
                Some(rows) => ScanPlan::Candidates { rows, exact: all_exact && all_indexed },
                None => ScanPlan::Full,
            }
        }
        Predicate::Or(list) => {
            let mut rows = RoaringTreemap::new();
            let mut all_exact = true;
            for child in list {
                match plan(child, dims) {
                    ScanPlan::Candidates { rows: r, exact } => {
                        rows |= r;
                        all_exact &= exact;
                    }
                    ScanPlan::Full => return ScanPlan::Full,
                }
            }
            ScanPlan::Candidates { rows, exact: all_exact }
        }
        _ => ScanPlan::Full,
    }
}

/// Zone-map skip test for a full scan: the single comparison this
/// predicate narrows to, if any.
pub fn skippable_cmp(pred: &Predicate) -> Option<(&str, SkipOp<'_>)> {
    match pred {
        Predicate::Cmp { path, op, value } => {
            let skip = match op {
                CmpOp::Eq => SkipOp::Eq(value),
                CmpOp::Ne => SkipOp::Ne(value),
                CmpOp::Gt => SkipOp::Gt(value),
                CmpOp::Gte => SkipOp::Ge(value),
                CmpOp::Lt => SkipOp::Lt(value),
                CmpOp::Lte => SkipOp::Le(value),
            };
            Some((path.as_str(), skip))
        }
        Predicate::In { path, values, negate: false, .. } => {
            Some((path.as_str(), SkipOp::In(values)))
        }
        Predicate::And(list) => list.iter().find_map(skippable_cmp),
        _ => None,
    }
}

/// Plain-substring regex probes in the predicate, for the trigram
/// prefilter session tracker.
pub fn literal_substrings(pred: &Predicate, out: &mut Vec<(String, String)>) {
    match pred {
        Predicate::Regex { path, literal: Some(lit), .. } => {
            out.push((path.clone(), lit.clone()));
        }
        Predicate::And(list) | Predicate::Or(list) | Predicate::Nor(list) => {
            for p in list {
                literal_substrings(p, out);
            }
        }
        Predicate::Not(inner) => literal_substrings(inner, out),
        _ => {}
    }
}
