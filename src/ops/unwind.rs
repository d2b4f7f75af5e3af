use std::collections::HashMap;

use serde_json::Value as Json;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::path;
use crate::core::types::{Delta, DeltaBatch, DeltaOp, Rid};
use crate::core::value::{Document, Value};
use crate::ops::{Operator, delta_after, delta_before};

/// Incremental `$unwind`. An insert of a document whose path holds an
/// m-element array becomes m inserts of synthesized documents, tagged
/// with child rids; a delete re-derives the same children from the
/// before image and retracts them, so the one-to-m identity holds across
/// the document's lifetime.
#[derive(Debug)]
pub struct UnwindOp {
    path: String,
    preserve_null_and_empty: bool,
    // Stable child-rid base per input rid; needed so stacked
    // cardinality-changing stages never collide.
    ids: HashMap<Rid, u64>,
    next_base: u64,
}

enum Expansion {
    Elements(Vec<Value>),
    Preserve,
    Drop,
}

impl UnwindOp {
    pub fn new(path: String, preserve_null_and_empty: bool) -> Self {
        UnwindOp { path, preserve_null_and_empty, ids: HashMap::new(), next_base: 0 }
    }

    /// `$unwind` accepts either a `"$path"` string or an options object.
    pub fn compile(json: &Json) -> Result<UnwindOp> {
        let (path, preserve) = parse_unwind_spec(json)?;
        Ok(UnwindOp::new(path, preserve))
    }

    fn expansion(&self, doc: &Document) -> Expansion {
        match path::resolve(doc, &self.path) {
            Some(Value::Array(items)) if !items.is_empty() => Expansion::Elements(items),
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if self.preserve_null_and_empty {
                    Expansion::Preserve
                } else {
                    Expansion::Drop
                }
            }
            // A scalar unwinds to itself.
            Some(single) => Expansion::Elements(vec![single]),
        }
    }

    fn children(&self, base: u64, doc: &Document) -> Vec<(Rid, Document)> {
        match self.expansion(doc) {
            Expansion::Drop => Vec::new(),
            Expansion::Preserve => {
                let mut child = doc.clone();
                path::remove(&mut child, &self.path);
                vec![(Rid::child(base, 0), child)]
            }
            Expansion::Elements(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, element)| {
                    let mut child = doc.clone();
                    path::set(&mut child, &self.path, element);
                    (Rid::child(base, i as u32 + 1), child)
                })
                .collect(),
        }
    }

    fn intern(&mut self, rid: Rid) -> u64 {
        if let Some(base) = self.ids.get(&rid) {
            return *base;
        }
        let base = self.next_base;
        self.next_base += 1;
        self.ids.insert(rid, base);
        base
    }
}

impl Operator for UnwindOp {
    fn name(&self) -> &'static str {
        "unwind"
    }

    fn push(&mut self, batch: DeltaBatch) -> Result<DeltaBatch> {
        let mut out = DeltaBatch::with_capacity(batch.len());
        for delta in batch.deltas {
            match delta.op {
                DeltaOp::Insert => {
                    let base = self.intern(delta.rid);
                    for (rid, child) in self.children(base, delta_after(&delta)?) {
                        out.push(Delta::insert(rid, child, delta.seq));
                    }
                }
                DeltaOp::Delete => {
                    let Some(base) = self.ids.remove(&delta.rid) else {
                        return Err(Error::new(
                            ErrorKind::Internal,
                            format!("unwind delete for unknown rid {:?}", delta.rid),
                        ));
                    };
                    for (rid, child) in self.children(base, delta_before(&delta)?) {
                        out.push(Delta::delete(rid, child, delta.seq));
                    }
                }
                DeltaOp::Update => {
                    // Cardinality may change: retract the old children and
                    // emit the new set under the same base.
                    let base = self.intern(delta.rid);
                    for (rid, child) in self.children(base, delta_before(&delta)?) {
                        out.push(Delta::delete(rid, child, delta.seq));
                    }
                    for (rid, child) in self.children(base, delta_after(&delta)?) {
                        out.push(Delta::insert(rid, child, delta.seq));
                    }
                }
            }
        }
        Ok(out)
    }

    fn transform(&self, doc: &Document) -> Vec<Document> {
        self.children(0, doc).into_iter().map(|(_, child)| child).collect()
    }

    fn reset(&mut self) {
        self.ids.clear();
        self.next_base = 0;
    }
}

/// Parse an `$unwind` stage body into `(path, preserveNullAndEmptyArrays)`.
pub fn parse_unwind_spec(json: &Json) -> Result<(String, bool)> {
    match json {
        Json::String(s) => Ok((parse_unwind_path(s)?, false)),
        Json::Object(map) => {
            let path_json = map.get("path").and_then(|p| p.as_str()).ok_or_else(|| {
                Error::new(ErrorKind::Parse, "$unwind requires a 'path' string".to_string())
            })?;
            let preserve = map
                .get("preserveNullAndEmptyArrays")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            Ok((parse_unwind_path(path_json)?, preserve))
        }
        _ => Err(Error::new(
            ErrorKind::Parse,
            "$unwind requires a path string or options object".to_string(),
        )),
    }
}

fn parse_unwind_path(s: &str) -> Result<String> {
    s.strip_prefix('$')
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .ok_or_else(|| {
            Error::new(ErrorKind::Parse, format!("$unwind path must start with '$', got '{}'", s))
        })
}
