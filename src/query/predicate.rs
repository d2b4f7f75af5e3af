use regex::Regex;
use serde_json::Value as Json;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::path;
use crate::core::value::{Document, Value};
use crate::expr::ast::Expr;
use crate::expr::parse::parse_expr;
use crate::expr::scalar::eval_scalar;
use crate::index::bloom::BloomFilter;

/// `$in` lists at least this long get a bloom prefilter in front of the
/// exact membership scan.
const BLOOM_MIN_IN_LIST: usize = 16;
const BLOOM_FPR: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Compiled `$match` predicate tree.
#[derive(Debug, Clone)]
pub enum Predicate {
    True,
    Cmp { path: String, op: CmpOp, value: Value },
    In { path: String, values: Vec<Value>, bloom: Option<BloomFilter>, negate: bool },
    Exists { path: String, expected: bool },
    Regex { path: String, regex: Regex, literal: Option<String> },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Nor(Vec<Predicate>),
    Not(Box<Predicate>),
    Expr(Expr),
}

impl Predicate {
    pub fn compile(json: &Json) -> Result<Predicate> {
        let map = json.as_object().ok_or_else(|| {
            Error::new(ErrorKind::Parse, "$match requires an object".to_string())
        })?;
        let mut clauses = Vec::with_capacity(map.len());
        for (key, spec) in map {
            match key.as_str() {
                "$and" => clauses.push(Predicate::And(compile_list(spec, "$and")?)),
                "$or" => clauses.push(Predicate::Or(compile_list(spec, "$or")?)),
                "$nor" => clauses.push(Predicate::Nor(compile_list(spec, "$nor")?)),
                "$expr" => clauses.push(Predicate::Expr(parse_expr(spec)?)),
                other if other.starts_with('$') => {
                    return Err(Error::new(
                        ErrorKind::Unsupported,
                        format!("match operator '{}' is outside the incremental set", other),
                    ));
                }
                field => clauses.push(compile_field(field, spec)?),
            }
        }
        Ok(match clauses.len() {
            0 => Predicate::True,
            1 => clauses.pop().unwrap(),
            _ => Predicate::And(clauses),
        })
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Predicate::True => true,
            Predicate::Cmp { path, op, value } => {
                let resolved = path::resolve(doc, path);
                match op {
                    CmpOp::Eq => eq_matches(resolved.as_ref(), value),
                    CmpOp::Ne => !eq_matches(resolved.as_ref(), value),
                    _ => ordered_matches(resolved.as_ref(), *op, value),
                }
            }
            Predicate::In { path, values, bloom, negate } => {
                let resolved = path::resolve(doc, path);
                let hit = in_matches(resolved.as_ref(), values, bloom.as_ref());
                hit != *negate
            }
            Predicate::Exists { path, expected } => {
                path::resolve(doc, path).is_some() == *expected
            }
            Predicate::Regex { path, regex, .. } => match path::resolve(doc, path) {
                Some(Value::Str(s)) => regex.is_match(&s),
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|v| matches!(v, Value::Str(s) if regex.is_match(s))),
                _ => false,
            },
            Predicate::And(list) => list.iter().all(|p| p.matches(doc)),
            Predicate::Or(list) => list.iter().any(|p| p.matches(doc)),
            Predicate::Nor(list) => !list.iter().any(|p| p.matches(doc)),
            Predicate::Not(inner) => !inner.matches(doc),
            Predicate::Expr(expr) => eval_scalar(expr, doc, doc).is_truthy(),
        }
    }

    /// Field paths the predicate probes, for dimension registration.
    pub fn referenced_paths(&self, out: &mut Vec<String>) {
        match self {
            Predicate::Cmp { path, .. }
            | Predicate::In { path, .. }
            | Predicate::Exists { path, .. }
            | Predicate::Regex { path, .. } => {
                if !out.contains(path) {
                    out.push(path.clone());
                }
            }
            Predicate::And(list) | Predicate::Or(list) | Predicate::Nor(list) => {
                for p in list {
                    p.referenced_paths(out);
                }
            }
            Predicate::Not(inner) => inner.referenced_paths(out),
            Predicate::Expr(expr) => expr.referenced_paths(out),
            Predicate::True => {}
        }
    }

    /// Simple comparison/logical shape, eligible for fusion.
    pub fn is_simple(&self) -> bool {
        match self {
            Predicate::True | Predicate::Cmp { .. } | Predicate::In { .. } | Predicate::Exists { .. } => true,
            Predicate::And(list) | Predicate::Or(list) | Predicate::Nor(list) => {
                list.iter().all(Predicate::is_simple)
            }
            Predicate::Not(inner) => inner.is_simple(),
            Predicate::Expr(expr) => expr.is_simple(),
            Predicate::Regex { .. } => false,
        }
    }

    pub fn token_count(&self) -> usize {
        match self {
            Predicate::True => 1,
            Predicate::Cmp { .. } | Predicate::Exists { .. } | Predicate::Regex { .. } => 2,
            Predicate::In { values, .. } => 2 + values.len(),
            Predicate::And(list) | Predicate::Or(list) | Predicate::Nor(list) => {
                1 + list.iter().map(Predicate::token_count).sum::<usize>()
            }
            Predicate::Not(inner) => 1 + inner.token_count(),
            Predicate::Expr(expr) => expr.token_count(),
        }
    }
}

fn compile_list(spec: &Json, name: &str) -> Result<Vec<Predicate>> {
    let items = spec.as_array().ok_or_else(|| {
        Error::new(ErrorKind::Parse, format!("{} requires an array", name))
    })?;
    items.iter().map(Predicate::compile).collect()
}

fn compile_field(field: &str, spec: &Json) -> Result<Predicate> {
    if let Some(map) = spec.as_object() {
        let operator_keys = map.keys().any(|k| k.starts_with('$'));
        if operator_keys {
            let mut clauses = Vec::with_capacity(map.len());
            for (op_name, arg) in map {
                clauses.push(compile_field_op(field, op_name, arg)?);
            }
            return Ok(match clauses.len() {
                1 => clauses.pop().unwrap(),
                _ => Predicate::And(clauses),
            });
        }
    }
    // Shorthand: {field: literal} is equality.
    Ok(Predicate::Cmp {
        path: field.to_string(),
        op: CmpOp::Eq,
        value: Value::from_json(spec),
    })
}

fn compile_field_op(field: &str, op_name: &str, arg: &Json) -> Result<Predicate> {
    let cmp = |op: CmpOp| Predicate::Cmp {
        path: field.to_string(),
        op,
        value: Value::from_json(arg),
    };
    Ok(match op_name {
        "$eq" => cmp(CmpOp::Eq),
        "$ne" => cmp(CmpOp::Ne),
        "$gt" => cmp(CmpOp::Gt),
        "$gte" => cmp(CmpOp::Gte),
        "$lt" => cmp(CmpOp::Lt),
        "$lte" => cmp(CmpOp::Lte),
        "$in" | "$nin" => {
            let values: Vec<Value> = arg
                .as_array()
                .ok_or_else(|| {
                    Error::new(ErrorKind::Parse, format!("{} requires an array", op_name))
                })?
                .iter()
                .map(Value::from_json)
                .collect();
            let bloom = if values.len() >= BLOOM_MIN_IN_LIST {
                let mut filter = BloomFilter::new(values.len(), BLOOM_FPR);
                for v in &values {
                    filter.insert(v);
                }
                Some(filter)
            } else {
                None
            };
            Predicate::In {
                path: field.to_string(),
                values,
                bloom,
                negate: op_name == "$nin",
            }
        }
        "$exists" => Predicate::Exists {
            path: field.to_string(),
            expected: arg.as_bool().unwrap_or(true),
        },
        "$regex" => {
            let pattern = arg.as_str().ok_or_else(|| {
                Error::new(ErrorKind::Parse, "$regex requires a string".to_string())
            })?;
            let regex = Regex::new(pattern)
                .map_err(|e| Error::new(ErrorKind::Parse, format!("bad $regex: {}", e)))?;
            Predicate::Regex {
                path: field.to_string(),
                regex,
                literal: literal_substring(pattern),
            }
        }
        "$not" => Predicate::Not(Box::new(compile_field(field, arg)?)),
        other => {
            return Err(Error::new(
                ErrorKind::Unsupported,
                format!("match operator '{}' is outside the incremental set", other),
            ));
        }
    })
}

/// A pattern with no metacharacters is a plain substring probe, which
/// the trigram prefilter can narrow.
fn literal_substring(pattern: &str) -> Option<String> {
    const META: &[char] = &['.', '*', '+', '?', '(', ')', '[', ']', '{', '}', '^', '$', '|', '\\'];
    if pattern.contains(META) {
        None
    } else {
        Some(pattern.to_string())
    }
}

/// Equality against a field, with array-membership semantics: an array
/// field matches when it equals the target or contains it. A missing
/// field equals null.
fn eq_matches(resolved: Option<&Value>, target: &Value) -> bool {
    match resolved {
        None => matches!(target, Value::Null),
        Some(value) => {
            if value == target {
                return true;
            }
            match value {
                Value::Array(items) if !matches!(target, Value::Array(_)) => {
                    items.contains(target)
                }
                _ => false,
            }
        }
    }
}

/// Ordered comparison within the same type bracket; a missing field or a
/// cross-type comparison never matches. Array fields match when any
/// element does.
fn ordered_matches(resolved: Option<&Value>, op: CmpOp, target: &Value) -> bool {
    let Some(value) = resolved else {
        return false;
    };
    let candidates: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };
    candidates.iter().any(|c| {
        if !same_bracket(c, target) {
            return false;
        }
        match op {
            CmpOp::Gt => *c > target,
            CmpOp::Gte => *c >= target,
            CmpOp::Lt => *c < target,
            CmpOp::Lte => *c <= target,
            _ => false,
        }
    })
}

fn same_bracket(a: &Value, b: &Value) -> bool {
    fn bracket(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Int(_) | Value::Float(_) => 1,
            Value::Str(_) => 2,
            Value::Array(_) => 3,
            Value::Object(_) => 4,
            Value::Bool(_) => 5,
            Value::Timestamp(_) => 6,
        }
    }
    bracket(a) == bracket(b)
}

fn in_matches(resolved: Option<&Value>, values: &[Value], bloom: Option<&BloomFilter>) -> bool {
    let probe = |candidate: &Value| {
        if let Some(filter) = bloom {
            if !filter.might_contain(candidate) {
                return false;
            }
        }
        values.contains(candidate)
    };
    match resolved {
        None => values.contains(&Value::Null),
        Some(Value::Array(items)) => {
            probe(&Value::Array(items.clone())) || items.iter().any(probe)
        }
        Some(single) => probe(single),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(json: &str) -> Document {
        Document::from_json(&serde_json::from_str(json).unwrap()).unwrap()
    }

    fn pred(json: &str) -> Predicate {
        Predicate::compile(&serde_json::from_str(json).unwrap()).unwrap()
    }

    #[test]
    fn test_equality_shorthand() {
        let p = pred(r#"{"c": "a"}"#);
        assert!(p.matches(&doc(r#"{"c": "a", "v": 1}"#)));
        assert!(!p.matches(&doc(r#"{"c": "b"}"#)));
    }

    #[test]
    fn test_missing_equals_null() {
        let p = pred(r#"{"c": null}"#);
        assert!(p.matches(&doc(r#"{"x": 1}"#)));
        assert!(p.matches(&doc(r#"{"c": null}"#)));
        assert!(!p.matches(&doc(r#"{"c": 0}"#)));
    }

    #[test]
    fn test_range_operators_are_type_bracketed() {
        let p = pred(r#"{"age": {"$gte": 18}}"#);
        assert!(p.matches(&doc(r#"{"age": 18}"#)));
        assert!(!p.matches(&doc(r#"{"age": 17}"#)));
        assert!(!p.matches(&doc(r#"{"age": "19"}"#))); // string never beats a number
        assert!(!p.matches(&doc(r#"{}"#)));

        let lt = pred(r#"{"age": {"$lt": 5}}"#);
        assert!(!lt.matches(&doc(r#"{}"#))); // missing is not less-than
    }

    #[test]
    fn test_combined_field_operators() {
        let p = pred(r#"{"v": {"$gt": 5, "$lt": 10}}"#);
        assert!(p.matches(&doc(r#"{"v": 7}"#)));
        assert!(!p.matches(&doc(r#"{"v": 10}"#)));
    }

    #[test]
    fn test_array_membership_equality() {
        let p = pred(r#"{"tags": "red"}"#);
        assert!(p.matches(&doc(r#"{"tags": ["blue", "red"]}"#)));
        assert!(!p.matches(&doc(r#"{"tags": ["blue"]}"#)));
    }

    #[test]
    fn test_in_and_nin() {
        let p = pred(r#"{"c": {"$in": ["a", "b"]}}"#);
        assert!(p.matches(&doc(r#"{"c": "a"}"#)));
        assert!(!p.matches(&doc(r#"{"c": "z"}"#)));

        let n = pred(r#"{"c": {"$nin": ["a", "b"]}}"#);
        assert!(!n.matches(&doc(r#"{"c": "a"}"#)));
        assert!(n.matches(&doc(r#"{"c": "z"}"#)));
    }

    #[test]
    fn test_large_in_list_uses_bloom() {
        let values: Vec<String> = (0..40).map(|i| format!("\"v{}\"", i)).collect();
        let p = pred(&format!(r#"{{"c": {{"$in": [{}]}}}}"#, values.join(",")));
        match &p {
            Predicate::In { bloom, .. } => assert!(bloom.is_some()),
            other => panic!("expected $in, got {:?}", other),
        }
        assert!(p.matches(&doc(r#"{"c": "v7"}"#)));
        assert!(!p.matches(&doc(r#"{"c": "nope"}"#)));
    }

    #[test]
    fn test_logical_connectives() {
        let p = pred(r#"{"$or": [{"a": 1}, {"b": {"$gt": 5}}]}"#);
        assert!(p.matches(&doc(r#"{"a": 1}"#)));
        assert!(p.matches(&doc(r#"{"b": 9}"#)));
        assert!(!p.matches(&doc(r#"{"a": 2, "b": 1}"#)));

        let nor = pred(r#"{"$nor": [{"a": 1}, {"b": 1}]}"#);
        assert!(nor.matches(&doc(r#"{"a": 2}"#)));
        assert!(!nor.matches(&doc(r#"{"b": 1}"#)));

        let not = pred(r#"{"a": {"$not": {"$gt": 5}}}"#);
        assert!(not.matches(&doc(r#"{"a": 3}"#)));
        assert!(not.matches(&doc(r#"{}"#)));
        assert!(!not.matches(&doc(r#"{"a": 9}"#)));
    }

    #[test]
    fn test_exists() {
        let p = pred(r#"{"a": {"$exists": true}}"#);
        assert!(p.matches(&doc(r#"{"a": null}"#)));
        assert!(!p.matches(&doc(r#"{"b": 1}"#)));
    }

    #[test]
    fn test_regex_and_literal_extraction() {
        let p = pred(r#"{"name": {"$regex": "eng"}}"#);
        assert!(p.matches(&doc(r#"{"name": "engineering"}"#)));
        assert!(!p.matches(&doc(r#"{"name": "sales"}"#)));
        match &p {
            Predicate::Regex { literal, .. } => assert_eq!(literal.as_deref(), Some("eng")),
            other => panic!("expected regex, got {:?}", other),
        }
        let anchored = pred(r#"{"name": {"$regex": "^eng"}}"#);
        match &anchored {
            Predicate::Regex { literal, .. } => assert!(literal.is_none()),
            other => panic!("expected regex, got {:?}", other),
        }
    }

    #[test]
    fn test_expr_predicate() {
        let p = pred(r#"{"$expr": {"$gt": ["$spent", "$budget"]}}"#);
        assert!(p.matches(&doc(r#"{"spent": 10, "budget": 5}"#)));
        assert!(!p.matches(&doc(r#"{"spent": 1, "budget": 5}"#)));
    }

    #[test]
    fn test_unsupported_operator_errors() {
        let err = Predicate::compile(&serde_json::from_str(r#"{"$where": "this.a > 1"}"#).unwrap())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unsupported);
    }
}
