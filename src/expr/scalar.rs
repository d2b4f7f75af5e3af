use std::collections::BTreeSet;

use chrono::Duration;

use crate::core::path;
use crate::core::value::{Document, Value};
use crate::expr::ast::{Expr, OpKind};
use crate::expr::datetime;

/// Scalar expression evaluation against one document. Runtime type
/// mismatches produce null rather than aborting; division and modulo by
/// zero produce null.
pub fn eval_scalar(expr: &Expr, doc: &Document, root: &Document) -> Value {
    let mut vars: Vec<(String, Value)> = Vec::new();
    eval(expr, doc, root, &mut vars)
}

fn eval(expr: &Expr, doc: &Document, root: &Document, vars: &mut Vec<(String, Value)>) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::FieldPath(p) => path::resolve(doc, p).unwrap_or(Value::Null),
        Expr::Root => root.as_value(),
        Expr::Current => doc.as_value(),
        Expr::Variable(name) => vars
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null),
        Expr::ArrayShape(items) => {
            Value::Array(items.iter().map(|e| eval(e, doc, root, vars)).collect())
        }
        Expr::ObjectShape(fields) => {
            let mut out = Document::new();
            for (name, e) in fields {
                out.set(name, eval(e, doc, root, vars));
            }
            out.into_value()
        }
        Expr::Filter { input, var, cond } => {
            let Value::Array(items) = eval(input, doc, root, vars) else {
                return Value::Null;
            };
            let mut out = Vec::new();
            for item in items {
                vars.push((var.clone(), item.clone()));
                let keep = eval(cond, doc, root, vars).is_truthy();
                vars.pop();
                if keep {
                    out.push(item);
                }
            }
            Value::Array(out)
        }
        Expr::Map { input, var, body } => {
            let Value::Array(items) = eval(input, doc, root, vars) else {
                return Value::Null;
            };
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                vars.push((var.clone(), item));
                out.push(eval(body, doc, root, vars));
                vars.pop();
            }
            Value::Array(out)
        }
        Expr::Switch { branches, default } => {
            for (case, then) in branches {
                if eval(case, doc, root, vars).is_truthy() {
                    return eval(then, doc, root, vars);
                }
            }
            match default {
                Some(d) => eval(d, doc, root, vars),
                None => Value::Null,
            }
        }
        Expr::Op(kind, args) => {
            let values: Vec<Value> = args.iter().map(|a| eval(a, doc, root, vars)).collect();
            eval_op(*kind, &values)
        }
    }
}

fn eval_op(kind: OpKind, args: &[Value]) -> Value {
    use OpKind::*;
    match kind {
        Add => eval_add(args),
        Subtract => eval_subtract(&args[0], &args[1]),
        Multiply => fold_numeric(args, |a, b| a.checked_mul(b), |a, b| a * b),
        Divide => eval_divide(&args[0], &args[1]),
        Mod => eval_mod(&args[0], &args[1]),
        Abs => unary_numeric(&args[0], |i| i.checked_abs(), |f| f.abs()),
        Ceil => unary_numeric(&args[0], Some, |f| f.ceil()),
        Floor => unary_numeric(&args[0], Some, |f| f.floor()),
        Round => eval_round(args),
        Sqrt => match args[0].as_f64() {
            Some(f) if f >= 0.0 => Value::from_finite(f.sqrt()),
            _ => Value::Null,
        },
        Pow => eval_pow(&args[0], &args[1]),

        Eq => Value::Bool(args[0] == args[1]),
        Ne => Value::Bool(args[0] != args[1]),
        Gt => Value::Bool(args[0] > args[1]),
        Gte => Value::Bool(args[0] >= args[1]),
        Lt => Value::Bool(args[0] < args[1]),
        Lte => Value::Bool(args[0] <= args[1]),
        Cmp => Value::Int(match args[0].cmp(&args[1]) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        }),

        And => Value::Bool(args.iter().all(Value::is_truthy)),
        Or => Value::Bool(args.iter().any(Value::is_truthy)),
        Not => Value::Bool(!args[0].is_truthy()),

        Cond => {
            if args[0].is_truthy() { args[1].clone() } else { args[2].clone() }
        }
        IfNull => args
            .iter()
            .find(|v| !matches!(v, Value::Null))
            .cloned()
            .unwrap_or(Value::Null),

        Concat => {
            let mut out = String::new();
            for arg in args {
                match arg {
                    Value::Str(s) => out.push_str(s),
                    _ => return Value::Null,
                }
            }
            Value::Str(out)
        }
        Substr => eval_substr(args),
        ToLower => map_str(&args[0], |s| s.to_lowercase()),
        ToUpper => map_str(&args[0], |s| s.to_uppercase()),
        Trim => eval_trim(args, true, true),
        Ltrim => eval_trim(args, true, false),
        Rtrim => eval_trim(args, false, true),
        Split => eval_split(&args[0], &args[1]),
        StrLen => match &args[0] {
            Value::Str(s) => Value::Int(s.chars().count() as i64),
            _ => Value::Null,
        },

        Size => match &args[0] {
            Value::Array(items) => Value::Int(items.len() as i64),
            _ => Value::Null,
        },
        ArrayElemAt => eval_elem_at(&args[0], &args[1]),
        ConcatArrays => {
            let mut out = Vec::new();
            for arg in args {
                match arg {
                    Value::Array(items) => out.extend(items.iter().cloned()),
                    _ => return Value::Null,
                }
            }
            Value::Array(out)
        }
        In => match &args[1] {
            Value::Array(items) => Value::Bool(items.contains(&args[0])),
            _ => Value::Null,
        },
        IndexOfArray => eval_index_of(args),
        ReverseArray => match &args[0] {
            Value::Array(items) => Value::Array(items.iter().rev().cloned().collect()),
            _ => Value::Null,
        },
        Slice => eval_slice(args),

        SetEquals => eval_set_equals(args),
        SetIntersection => eval_set_fold(args, |acc, s| acc.intersection(s).cloned().collect()),
        SetUnion => eval_set_fold(args, |acc, s| acc.union(s).cloned().collect()),
        SetDifference => match (to_set(&args[0]), to_set(&args[1])) {
            (Some(a), Some(b)) => Value::Array(a.difference(&b).cloned().collect()),
            _ => Value::Null,
        },
        SetIsSubset => match (to_set(&args[0]), to_set(&args[1])) {
            (Some(a), Some(b)) => Value::Bool(a.is_subset(&b)),
            _ => Value::Null,
        },
        AnyElementTrue => match &args[0] {
            Value::Array(items) => Value::Bool(items.iter().any(Value::is_truthy)),
            _ => Value::Null,
        },
        AllElementsTrue => match &args[0] {
            Value::Array(items) => Value::Bool(items.iter().all(Value::is_truthy)),
            _ => Value::Null,
        },

        Year => date_part(&args[0], datetime::year),
        Month => date_part(&args[0], datetime::month),
        DayOfMonth => date_part(&args[0], datetime::day_of_month),
        DayOfWeek => date_part(&args[0], datetime::day_of_week),
        DayOfYear => date_part(&args[0], datetime::day_of_year),
        Week => date_part(&args[0], datetime::iso_week),
        Hour => date_part(&args[0], datetime::hour),
        Minute => date_part(&args[0], datetime::minute),
        Second => date_part(&args[0], datetime::second),
        Millisecond => date_part(&args[0], datetime::millisecond),
        DateToString => {
            let Value::Timestamp(ts) = &args[0] else {
                return Value::Null;
            };
            let spec = match args.get(1) {
                Some(Value::Str(s)) => s.as_str(),
                None => "%Y-%m-%dT%H:%M:%S.%LZ",
                Some(_) => return Value::Null,
            };
            Value::Str(datetime::format(ts, spec))
        }
    }
}

fn date_part(v: &Value, f: fn(&chrono::DateTime<chrono::Utc>) -> i64) -> Value {
    match v {
        Value::Timestamp(ts) => Value::Int(f(ts)),
        _ => Value::Null,
    }
}

fn map_str(v: &Value, f: impl Fn(&str) -> String) -> Value {
    match v {
        Value::Str(s) => Value::Str(f(s)),
        _ => Value::Null,
    }
}

/// Variadic add. One timestamp operand shifts by the numeric operands
/// taken as milliseconds; otherwise purely numeric, ints preserved.
fn eval_add(args: &[Value]) -> Value {
    let ts_count = args.iter().filter(|v| matches!(v, Value::Timestamp(_))).count();
    if ts_count > 1 {
        return Value::Null;
    }
    if ts_count == 1 {
        let mut millis = 0i64;
        let mut base = None;
        for arg in args {
            match arg {
                Value::Timestamp(ts) => base = Some(*ts),
                other => match other.as_f64() {
                    Some(f) => millis += f as i64,
                    None => return Value::Null,
                },
            }
        }
        return Value::Timestamp(base.unwrap() + Duration::milliseconds(millis));
    }
    fold_numeric(args, |a, b| a.checked_add(b), |a, b| a + b)
}

fn eval_subtract(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Timestamp(x), Value::Timestamp(y)) => {
            Value::Int(x.timestamp_millis() - y.timestamp_millis())
        }
        (Value::Timestamp(x), other) => match other.as_f64() {
            Some(f) => Value::Timestamp(*x - Duration::milliseconds(f as i64)),
            None => Value::Null,
        },
        _ => fold_numeric(&[a.clone(), b.clone()], |x, y| x.checked_sub(y), |x, y| x - y),
    }
}

/// Fold numeric operands, staying in i64 while the checked op allows and
/// every operand is an int.
fn fold_numeric(
    args: &[Value],
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Value {
    let mut acc_int: Option<i64> = None;
    let mut acc_float: Option<f64> = None;
    for arg in args {
        match (arg, acc_int, acc_float) {
            (Value::Int(i), None, None) => acc_int = Some(*i),
            (Value::Float(f), None, None) => acc_float = Some(*f),
            (Value::Int(i), Some(acc), None) => match int_op(acc, *i) {
                Some(next) => acc_int = Some(next),
                None => {
                    acc_int = None;
                    acc_float = Some(float_op(acc as f64, *i as f64));
                }
            },
            (Value::Float(f), Some(acc), None) => {
                acc_int = None;
                acc_float = Some(float_op(acc as f64, *f));
            }
            (other, _, Some(acc)) => match other.as_f64() {
                Some(f) => acc_float = Some(float_op(acc, f)),
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    match (acc_int, acc_float) {
        (Some(i), _) => Value::Int(i),
        (_, Some(f)) => Value::from_finite(f),
        _ => Value::Null,
    }
}

fn unary_numeric(v: &Value, int_op: fn(i64) -> Option<i64>, float_op: fn(f64) -> f64) -> Value {
    match v {
        Value::Int(i) => match int_op(*i) {
            Some(out) => Value::Int(out),
            None => Value::from_finite(float_op(*i as f64)),
        },
        Value::Float(f) => Value::from_finite(float_op(*f)),
        _ => Value::Null,
    }
}

fn eval_divide(a: &Value, b: &Value) -> Value {
    match (a.as_f64(), b.as_f64()) {
        (Some(_), Some(y)) if y == 0.0 => Value::Null,
        (Some(x), Some(y)) => Value::from_finite(x / y),
        _ => Value::Null,
    }
}

fn eval_mod(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Int(_), Value::Int(0)) => Value::Null,
        (Value::Int(x), Value::Int(y)) => Value::Int(x % y),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(_), Some(y)) if y == 0.0 => Value::Null,
            (Some(x), Some(y)) => Value::from_finite(x % y),
            _ => Value::Null,
        },
    }
}

fn eval_pow(a: &Value, b: &Value) -> Value {
    if let (Value::Int(base), Value::Int(exp)) = (a, b) {
        if *exp >= 0 && *exp <= u32::MAX as i64 {
            if let Some(out) = base.checked_pow(*exp as u32) {
                return Value::Int(out);
            }
        }
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Value::from_finite(x.powf(y)),
        _ => Value::Null,
    }
}

fn eval_round(args: &[Value]) -> Value {
    let place = match args.get(1) {
        Some(v) => match v.as_i64() {
            Some(p) => p,
            None => return Value::Null,
        },
        None => 0,
    };
    match &args[0] {
        Value::Int(i) if place >= 0 => Value::Int(*i),
        v => match v.as_f64() {
            Some(f) => {
                let scale = 10f64.powi(place.clamp(-15, 15) as i32);
                Value::from_finite((f * scale).round() / scale)
            }
            None => Value::Null,
        },
    }
}

fn eval_substr(args: &[Value]) -> Value {
    let Value::Str(s) = &args[0] else {
        return Value::Null;
    };
    let (Some(start), Some(len)) = (args[1].as_i64(), args[2].as_i64()) else {
        return Value::Null;
    };
    let chars: Vec<char> = s.chars().collect();
    let start = start.max(0) as usize;
    if start >= chars.len() {
        return Value::Str(String::new());
    }
    let end = if len < 0 {
        chars.len()
    } else {
        (start + len as usize).min(chars.len())
    };
    Value::Str(chars[start..end].iter().collect())
}

fn eval_trim(args: &[Value], left: bool, right: bool) -> Value {
    let Value::Str(s) = &args[0] else {
        return Value::Null;
    };
    let chars: Option<Vec<char>> = match args.get(1) {
        Some(Value::Str(cs)) => Some(cs.chars().collect()),
        Some(_) => return Value::Null,
        None => None,
    };
    let should_trim = |c: char| match &chars {
        Some(set) => set.contains(&c),
        None => c.is_whitespace(),
    };
    let mut out = s.as_str();
    if left {
        out = out.trim_start_matches(&should_trim);
    }
    if right {
        out = out.trim_end_matches(&should_trim);
    }
    Value::Str(out.to_string())
}

fn eval_split(s: &Value, delim: &Value) -> Value {
    match (s, delim) {
        (Value::Str(s), Value::Str(d)) if !d.is_empty() => {
            Value::Array(s.split(d.as_str()).map(|p| Value::Str(p.to_string())).collect())
        }
        _ => Value::Null,
    }
}

/// Out-of-bounds in either direction is null.
fn eval_elem_at(arr: &Value, idx: &Value) -> Value {
    let (Value::Array(items), Some(i)) = (arr, idx.as_i64()) else {
        return Value::Null;
    };
    let index = if i < 0 { items.len() as i64 + i } else { i };
    if index < 0 || index >= items.len() as i64 {
        return Value::Null;
    }
    items[index as usize].clone()
}

fn eval_index_of(args: &[Value]) -> Value {
    let Value::Array(items) = &args[0] else {
        return Value::Null;
    };
    let search = &args[1];
    let start = args.get(2).and_then(Value::as_i64).unwrap_or(0).max(0) as usize;
    let end = args
        .get(3)
        .and_then(Value::as_i64)
        .map(|e| (e.max(0) as usize).min(items.len()))
        .unwrap_or(items.len());
    for (i, item) in items.iter().enumerate().take(end).skip(start) {
        if item == search {
            return Value::Int(i as i64);
        }
    }
    Value::Int(-1)
}

fn eval_slice(args: &[Value]) -> Value {
    let Value::Array(items) = &args[0] else {
        return Value::Null;
    };
    match args.len() {
        2 => {
            let Some(n) = args[1].as_i64() else {
                return Value::Null;
            };
            if n >= 0 {
                Value::Array(items.iter().take(n as usize).cloned().collect())
            } else {
                let skip = items.len().saturating_sub((-n) as usize);
                Value::Array(items[skip..].to_vec())
            }
        }
        _ => {
            let (Some(pos), Some(n)) = (args[1].as_i64(), args[2].as_i64()) else {
                return Value::Null;
            };
            if n <= 0 {
                return Value::Null;
            }
            let start = if pos < 0 {
                items.len().saturating_sub((-pos) as usize)
            } else {
                (pos as usize).min(items.len())
            };
            Value::Array(items[start..].iter().take(n as usize).cloned().collect())
        }
    }
}

fn to_set(v: &Value) -> Option<BTreeSet<Value>> {
    match v {
        Value::Array(items) => Some(items.iter().cloned().collect()),
        _ => None,
    }
}

fn eval_set_equals(args: &[Value]) -> Value {
    let mut first: Option<BTreeSet<Value>> = None;
    for arg in args {
        let Some(set) = to_set(arg) else {
            return Value::Null;
        };
        match &first {
            None => first = Some(set),
            Some(f) if *f == set => {}
            Some(_) => return Value::Bool(false),
        }
    }
    Value::Bool(true)
}

fn eval_set_fold(
    args: &[Value],
    fold: fn(&BTreeSet<Value>, &BTreeSet<Value>) -> BTreeSet<Value>,
) -> Value {
    let mut acc: Option<BTreeSet<Value>> = None;
    for arg in args {
        let Some(set) = to_set(arg) else {
            return Value::Null;
        };
        acc = Some(match acc {
            None => set,
            Some(a) => fold(&a, &set),
        });
    }
    Value::Array(acc.unwrap_or_default().into_iter().collect())
}
