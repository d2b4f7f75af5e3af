use crate::bitmap::live_set::LiveSet;
use crate::core::path;
use crate::core::value::{Document, Value};
use crate::expr::ast::{Expr, OpKind};
use crate::expr::scalar::eval_scalar;
use crate::kernel::{boolean, numeric};

/// A column of evaluated expression results over a batch of documents.
/// Numeric and boolean columns route through the vectorized kernels; the
/// `Any` representation is the untyped fallback.
#[derive(Debug, Clone)]
pub enum Column {
    Numeric { values: Vec<f64>, nulls: LiveSet },
    Boolean { bits: LiveSet, nulls: LiveSet, len: usize },
    Any(Vec<Value>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric { values, .. } => values.len(),
            Column::Boolean { len, .. } => *len,
            Column::Any(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lane value; numeric lanes with integral values come back as ints,
    /// in line with the scalar evaluator's int preservation.
    pub fn value_at(&self, i: usize) -> Value {
        match self {
            Column::Numeric { values, nulls } => {
                if nulls.test(i) {
                    Value::Null
                } else {
                    let f = values[i];
                    match f.fract() == 0.0 && f.is_finite() && f.abs() < 9e15 {
                        true => Value::Int(f as i64),
                        false => Value::from_finite(f),
                    }
                }
            }
            Column::Boolean { bits, nulls, .. } => {
                if nulls.test(i) { Value::Null } else { Value::Bool(bits.test(i)) }
            }
            Column::Any(values) => values.get(i).cloned().unwrap_or(Value::Null),
        }
    }

    /// Lane truthiness for filter masks; null lanes are false.
    pub fn truthy_mask(&self) -> LiveSet {
        let mut mask = LiveSet::new();
        mask.resize_len(self.len());
        match self {
            Column::Boolean { bits, nulls, len } => {
                for i in 0..*len {
                    if bits.test(i) && !nulls.test(i) {
                        mask.set(i);
                    }
                }
            }
            Column::Numeric { values, nulls } => {
                for (i, v) in values.iter().enumerate() {
                    if !nulls.test(i) && *v != 0.0 && !v.is_nan() {
                        mask.set(i);
                    }
                }
            }
            Column::Any(values) => {
                for (i, v) in values.iter().enumerate() {
                    if v.is_truthy() {
                        mask.set(i);
                    }
                }
            }
        }
        mask
    }

    fn to_numeric(&self) -> Option<(Vec<f64>, LiveSet)> {
        match self {
            Column::Numeric { values, nulls } => Some((values.clone(), nulls.clone())),
            Column::Any(values) => {
                let mut out = vec![0.0f64; values.len()];
                let mut nulls = LiveSet::new();
                nulls.resize_len(values.len());
                for (i, v) in values.iter().enumerate() {
                    match v.as_f64() {
                        Some(f) => out[i] = f,
                        None => nulls.set(i),
                    }
                }
                Some((out, nulls))
            }
            Column::Boolean { .. } => None,
        }
    }
}

/// Evaluate an expression over a batch of documents, vectorizing the
/// arithmetic/comparison/logical core and falling back to per-row scalar
/// evaluation for everything else.
pub fn eval_vector(expr: &Expr, docs: &[&Document]) -> Column {
    match expr {
        Expr::Literal(v) => match v {
            Value::Int(_) | Value::Float(_) => {
                let f = v.as_f64().unwrap();
                let mut nulls = LiveSet::new();
                nulls.resize_len(docs.len());
                Column::Numeric { values: vec![f; docs.len()], nulls }
            }
            other => Column::Any(vec![other.clone(); docs.len()]),
        },
        Expr::FieldPath(p) => {
            let values: Vec<Value> = docs
                .iter()
                .map(|d| path::resolve(d, p).unwrap_or(Value::Null))
                .collect();
            typed_from_values(values)
        }
        Expr::Op(kind, args) => eval_vector_op(*kind, args, docs),
        other => fallback(other, docs),
    }
}

fn typed_from_values(values: Vec<Value>) -> Column {
    let all_numeric = values.iter().all(|v| v.is_numeric() || matches!(v, Value::Null));
    let any_numeric = values.iter().any(Value::is_numeric);
    if all_numeric && any_numeric {
        let mut out = vec![0.0f64; values.len()];
        let mut nulls = LiveSet::new();
        nulls.resize_len(values.len());
        for (i, v) in values.iter().enumerate() {
            match v.as_f64() {
                Some(f) => out[i] = f,
                None => nulls.set(i),
            }
        }
        return Column::Numeric { values: out, nulls };
    }
    Column::Any(values)
}

fn fallback(expr: &Expr, docs: &[&Document]) -> Column {
    Column::Any(docs.iter().map(|d| eval_scalar(expr, d, d)).collect())
}

fn eval_vector_op(kind: OpKind, args: &[Expr], docs: &[&Document]) -> Column {
    use OpKind::*;
    match kind {
        Add | Subtract | Multiply | Divide | Mod | Pow | Eq | Ne | Gt | Gte | Lt | Lte
            if args.len() == 2 =>
        {
            let left = eval_vector(&args[0], docs);
            let right = eval_vector(&args[1], docs);
            match (kind, left.to_numeric(), right.to_numeric()) {
                (Add, Some((a, an)), Some((b, bn))) => numeric_col(numeric::binary(numeric::BinaryOp::Add, &a, &an, &b, &bn)),
                (Subtract, Some((a, an)), Some((b, bn))) => numeric_col(numeric::binary(numeric::BinaryOp::Sub, &a, &an, &b, &bn)),
                (Multiply, Some((a, an)), Some((b, bn))) => numeric_col(numeric::binary(numeric::BinaryOp::Mul, &a, &an, &b, &bn)),
                (Divide, Some((a, an)), Some((b, bn))) => numeric_col(numeric::binary(numeric::BinaryOp::Div, &a, &an, &b, &bn)),
                (Mod, Some((a, an)), Some((b, bn))) => numeric_col(numeric::binary(numeric::BinaryOp::Mod, &a, &an, &b, &bn)),
                (Pow, Some((a, an)), Some((b, bn))) => numeric_col(numeric::binary(numeric::BinaryOp::Pow, &a, &an, &b, &bn)),
                (Eq | Ne | Gt | Gte | Lt | Lte, _, _) => compare_columns(kind, &left, &right),
                _ => per_row(kind, args, docs),
            }
        }
        Abs | Ceil | Floor | Round | Sqrt if args.len() == 1 => {
            let input = eval_vector(&args[0], docs);
            match input.to_numeric() {
                Some((a, an)) => {
                    let op = match kind {
                        Abs => numeric::UnaryOp::Abs,
                        Ceil => numeric::UnaryOp::Ceil,
                        Floor => numeric::UnaryOp::Floor,
                        Round => numeric::UnaryOp::Round,
                        _ => numeric::UnaryOp::Sqrt,
                    };
                    numeric_col(numeric::unary(op, &a, &an))
                }
                None => per_row(kind, args, docs),
            }
        }
        And | Or if args.len() == 2 => {
            let left = eval_vector(&args[0], docs);
            let right = eval_vector(&args[1], docs);
            let len = left.len();
            let (la, ln) = (left.truthy_mask(), LiveSet::new());
            let (ra, rn) = (right.truthy_mask(), LiveSet::new());
            let (bits, nulls) = if matches!(kind, And) {
                boolean::and(&la, &ln, &ra, &rn)
            } else {
                boolean::or(&la, &ln, &ra, &rn)
            };
            Column::Boolean { bits, nulls, len }
        }
        Not if args.len() == 1 => {
            let input = eval_vector(&args[0], docs);
            let len = input.len();
            let mut mask = input.truthy_mask();
            mask.resize_len(len);
            let (bits, nulls) = boolean::not(&mask, &LiveSet::new());
            Column::Boolean { bits, nulls, len }
        }
        _ => per_row(kind, args, docs),
    }
}

fn numeric_col((values, nulls): (Vec<f64>, LiveSet)) -> Column {
    Column::Numeric { values, nulls }
}

fn compare_columns(kind: OpKind, left: &Column, right: &Column) -> Column {
    let len = left.len();
    let mut bits = LiveSet::new();
    bits.resize_len(len);
    for i in 0..len {
        let ord = left.value_at(i).cmp(&right.value_at(i));
        let hit = match kind {
            OpKind::Eq => ord == std::cmp::Ordering::Equal,
            OpKind::Ne => ord != std::cmp::Ordering::Equal,
            OpKind::Gt => ord == std::cmp::Ordering::Greater,
            OpKind::Gte => ord != std::cmp::Ordering::Less,
            OpKind::Lt => ord == std::cmp::Ordering::Less,
            _ => ord != std::cmp::Ordering::Greater,
        };
        if hit {
            bits.set(i);
        }
    }
    let mut nulls = LiveSet::new();
    nulls.resize_len(len);
    Column::Boolean { bits, nulls, len }
}

fn per_row(kind: OpKind, args: &[Expr], docs: &[&Document]) -> Column {
    let expr = Expr::Op(kind, args.to_vec());
    fallback(&expr, docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse::parse_expr;

    fn docs(jsons: &[&str]) -> Vec<Document> {
        jsons
            .iter()
            .map(|j| Document::from_json(&serde_json::from_str(j).unwrap()).unwrap())
            .collect()
    }

    fn run(expr_json: &str, doc_jsons: &[&str]) -> Column {
        let expr = parse_expr(&serde_json::from_str(expr_json).unwrap()).unwrap();
        let owned = docs(doc_jsons);
        let refs: Vec<&Document> = owned.iter().collect();
        eval_vector(&expr, &refs)
    }

    #[test]
    fn test_vectorized_arithmetic_matches_scalar() {
        let col = run(r#"{"$add": ["$a", 1]}"#, &[r#"{"a": 1}"#, r#"{"a": 2.5}"#, r#"{}"#]);
        assert_eq!(col.value_at(0), Value::Int(2));
        assert_eq!(col.value_at(1), Value::Float(3.5));
        assert_eq!(col.value_at(2), Value::Null); // missing lane is null
    }

    #[test]
    fn test_vectorized_comparison_mask() {
        let col = run(r#"{"$gte": ["$v", 20]}"#, &[r#"{"v": 10}"#, r#"{"v": 20}"#, r#"{"v": 30}"#]);
        let mask = col.truthy_mask();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_logical_combination() {
        let col = run(
            r#"{"$and": [{"$gt": ["$v", 5]}, {"$lt": ["$v", 25]}]}"#,
            &[r#"{"v": 1}"#, r#"{"v": 10}"#, r#"{"v": 30}"#],
        );
        assert_eq!(col.truthy_mask().iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_division_by_zero_lane_is_null() {
        let col = run(r#"{"$divide": ["$a", "$b"]}"#, &[r#"{"a": 6, "b": 3}"#, r#"{"a": 6, "b": 0}"#]);
        assert_eq!(col.value_at(0), Value::Int(2));
        assert_eq!(col.value_at(1), Value::Null);
    }

    #[test]
    fn test_string_falls_back_to_any() {
        let col = run(r#"{"$toUpper": "$s"}"#, &[r#"{"s": "a"}"#, r#"{"s": "b"}"#]);
        assert_eq!(col.value_at(1), Value::Str("B".to_string()));
    }
}
