use serde_json::Value as Json;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::path;
use crate::core::types::{Delta, DeltaBatch, DeltaOp};
use crate::core::value::Document;
use crate::expr::ast::Expr;
use crate::expr::parse::parse_expr;
use crate::expr::scalar::eval_scalar;
use crate::ops::{Operator, delta_after, delta_before};

/// Inclusion/exclusion/computed projection shape.
#[derive(Debug, Clone)]
pub struct Projection {
    exclude_mode: bool,
    include_id: bool,
    included: Vec<String>,
    computed: Vec<(String, Expr)>,
    excluded: Vec<String>,
}

impl Projection {
    pub fn compile(json: &Json) -> Result<Projection> {
        let map = json.as_object().ok_or_else(|| {
            Error::new(ErrorKind::Parse, "$project requires an object".to_string())
        })?;
        if map.is_empty() {
            return Err(Error::new(ErrorKind::Parse, "$project may not be empty".to_string()));
        }
        let mut include_id = true;
        let mut included = Vec::new();
        let mut computed = Vec::new();
        let mut excluded = Vec::new();
        for (field, spec) in map {
            let is_falsy = matches!(spec, Json::Bool(false))
                || spec.as_i64() == Some(0)
                || spec.as_f64() == Some(0.0);
            let is_truthy_flag =
                matches!(spec, Json::Bool(true)) || spec.as_i64().map(|i| i != 0).unwrap_or(false);
            if field == "_id" {
                if is_falsy {
                    include_id = false;
                } else if !is_truthy_flag {
                    computed.push((field.clone(), parse_expr(spec)?));
                }
                continue;
            }
            if is_falsy {
                excluded.push(field.clone());
            } else if is_truthy_flag {
                included.push(field.clone());
            } else {
                computed.push((field.clone(), parse_expr(spec)?));
            }
        }
        let inclusive = !included.is_empty() || !computed.is_empty();
        if inclusive && !excluded.is_empty() {
            return Err(Error::new(
                ErrorKind::Parse,
                "$project cannot mix inclusion and exclusion".to_string(),
            ));
        }
        Ok(Projection {
            exclude_mode: !inclusive,
            include_id,
            included,
            computed,
            excluded,
        })
    }

    pub fn apply(&self, doc: &Document) -> Document {
        if self.exclude_mode {
            let mut out = doc.clone();
            if !self.include_id {
                out.fields.remove("_id");
            }
            for field in &self.excluded {
                path::remove(&mut out, field);
            }
            return out;
        }
        let mut out = Document::new();
        if self.include_id {
            if let Some(id) = doc.get("_id") {
                out.set("_id", id.clone());
            }
        }
        for field in &self.included {
            path::copy_into(&mut out, doc, field);
        }
        for (field, expr) in &self.computed {
            path::set(&mut out, field, eval_scalar(expr, doc, doc));
        }
        out
    }

    /// Expressions the fuser must vet, paired with their target fields.
    pub fn computed(&self) -> &[(String, Expr)] {
        &self.computed
    }

    pub fn is_simple(&self) -> bool {
        self.computed.iter().all(|(_, e)| e.is_simple())
    }

    pub fn token_count(&self) -> usize {
        self.included.len()
            + self.excluded.len()
            + self.computed.iter().map(|(_, e)| e.token_count()).sum::<usize>()
    }
}

#[derive(Debug, Clone)]
pub enum Shape {
    Project(Projection),
    AddFields(Vec<(String, Expr)>),
}

impl Shape {
    pub fn apply(&self, doc: &Document) -> Document {
        match self {
            Shape::Project(projection) => projection.apply(doc),
            Shape::AddFields(assignments) => {
                let mut out = doc.clone();
                for (field, expr) in assignments {
                    let value = eval_scalar(expr, doc, doc);
                    path::set(&mut out, field, value);
                }
                out
            }
        }
    }

    pub fn is_simple(&self) -> bool {
        match self {
            Shape::Project(p) => p.is_simple(),
            Shape::AddFields(a) => a.iter().all(|(_, e)| e.is_simple()),
        }
    }

    pub fn token_count(&self) -> usize {
        match self {
            Shape::Project(p) => p.token_count(),
            Shape::AddFields(a) => a.iter().map(|(_, e)| e.token_count()).sum::<usize>(),
        }
    }
}

pub fn compile_add_fields(json: &Json) -> Result<Vec<(String, Expr)>> {
    let map = json.as_object().ok_or_else(|| {
        Error::new(ErrorKind::Parse, "$addFields requires an object".to_string())
    })?;
    if map.is_empty() {
        return Err(Error::new(ErrorKind::Parse, "$addFields may not be empty".to_string()));
    }
    let mut out = Vec::with_capacity(map.len());
    for (field, spec) in map {
        if field.starts_with('$') {
            return Err(Error::new(
                ErrorKind::Parse,
                format!("'{}' is not a valid field name", field),
            ));
        }
        out.push((field.clone(), parse_expr(spec)?));
    }
    Ok(out)
}

/// Incremental `$project` / `$addFields`. Stateless under the purity of
/// its expressions: each side of a delta is reshaped independently.
#[derive(Debug)]
pub struct ProjectOp {
    shape: Shape,
}

impl ProjectOp {
    pub fn new(shape: Shape) -> Self {
        ProjectOp { shape }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }
}

impl Operator for ProjectOp {
    fn name(&self) -> &'static str {
        "project"
    }

    fn push(&mut self, batch: DeltaBatch) -> Result<DeltaBatch> {
        let mut out = DeltaBatch::with_capacity(batch.len());
        for delta in batch.deltas {
            match delta.op {
                DeltaOp::Insert => {
                    let shaped = self.shape.apply(delta_after(&delta)?);
                    out.push(Delta::insert(delta.rid, shaped, delta.seq));
                }
                DeltaOp::Delete => {
                    let shaped = self.shape.apply(delta_before(&delta)?);
                    out.push(Delta::delete(delta.rid, shaped, delta.seq));
                }
                DeltaOp::Update => {
                    let before = self.shape.apply(delta_before(&delta)?);
                    let after = self.shape.apply(delta_after(&delta)?);
                    out.push(Delta::update(delta.rid, before, after, delta.seq));
                }
            }
        }
        Ok(out)
    }

    fn transform(&self, doc: &Document) -> Vec<Document> {
        vec![self.shape.apply(doc)]
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(json: &str) -> Document {
        Document::from_json(&serde_json::from_str(json).unwrap()).unwrap()
    }

    fn projection(json: &str) -> Projection {
        Projection::compile(&serde_json::from_str(json).unwrap()).unwrap()
    }

    #[test]
    fn test_inclusion() {
        let p = projection(r#"{"v": 1, "_id": 0}"#);
        assert_eq!(p.apply(&doc(r#"{"_id": 9, "c": "a", "v": 10}"#)), doc(r#"{"v": 10}"#));
    }

    #[test]
    fn test_id_kept_by_default() {
        let p = projection(r#"{"v": 1}"#);
        assert_eq!(p.apply(&doc(r#"{"_id": 9, "v": 10, "x": 1}"#)), doc(r#"{"_id": 9, "v": 10}"#));
    }

    #[test]
    fn test_exclusion_mode() {
        let p = projection(r#"{"secret": 0}"#);
        assert_eq!(p.apply(&doc(r#"{"a": 1, "secret": 2}"#)), doc(r#"{"a": 1}"#));
    }

    #[test]
    fn test_computed_field() {
        let p = projection(r#"{"double": {"$multiply": ["$v", 2]}, "_id": 0}"#);
        assert_eq!(p.apply(&doc(r#"{"v": 21}"#)), doc(r#"{"double": 42}"#));
    }

    #[test]
    fn test_nested_path_inclusion() {
        let p = projection(r#"{"a.b": 1, "_id": 0}"#);
        assert_eq!(p.apply(&doc(r#"{"a": {"b": 1, "c": 2}, "z": 3}"#)), doc(r#"{"a": {"b": 1}}"#));
    }

    #[test]
    fn test_mixed_modes_rejected() {
        let err = Projection::compile(&serde_json::from_str(r#"{"a": 1, "b": 0}"#).unwrap());
        assert!(err.is_err());
    }

    #[test]
    fn test_add_fields_keeps_originals() {
        let shape = Shape::AddFields(
            compile_add_fields(&serde_json::from_str(r#"{"sum": {"$add": ["$a", "$b"]}}"#).unwrap())
                .unwrap(),
        );
        assert_eq!(
            shape.apply(&doc(r#"{"a": 1, "b": 2}"#)),
            doc(r#"{"a": 1, "b": 2, "sum": 3}"#)
        );
    }

    #[test]
    fn test_update_reshapes_both_sides() {
        use crate::core::types::{Rid, RowId};
        let mut op = ProjectOp::new(Shape::Project(projection(r#"{"v": 1, "_id": 0}"#)));
        let mut batch = DeltaBatch::new();
        batch.push(Delta::update(
            Rid::source(RowId(0)),
            doc(r#"{"v": 1, "x": 1}"#),
            doc(r#"{"v": 2, "x": 1}"#),
            1,
        ));
        let out = op.push(batch).unwrap();
        assert_eq!(out.deltas[0].before, Some(doc(r#"{"v": 1}"#)));
        assert_eq!(out.deltas[0].after, Some(doc(r#"{"v": 2}"#)));
    }
}
