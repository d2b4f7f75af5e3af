use serde_json::Value as Json;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::value::Value;
use crate::expr::ast::{Expr, OpKind};

/// Parse an expression descriptor: a literal, a `$`-prefixed field path,
/// a `$$`-prefixed system variable, or a single-key operator mapping.
pub fn parse_expr(json: &Json) -> Result<Expr> {
    match json {
        Json::String(s) => parse_string(s),
        Json::Array(items) => {
            let exprs: Result<Vec<Expr>> = items.iter().map(parse_expr).collect();
            Ok(Expr::ArrayShape(exprs?))
        }
        Json::Object(map) => {
            if map.len() == 1 {
                let (key, args) = map.iter().next().unwrap();
                if let Some(op) = key.strip_prefix('$') {
                    return parse_operator(op, args);
                }
            }
            // A plain object is a shape whose values are expressions.
            let mut fields = Vec::with_capacity(map.len());
            for (key, value) in map {
                if key.starts_with('$') {
                    return Err(Error::new(
                        ErrorKind::Parse,
                        format!("operator '{}' must be the only key of its object", key),
                    ));
                }
                fields.push((key.clone(), parse_expr(value)?));
            }
            Ok(Expr::ObjectShape(fields))
        }
        other => Ok(Expr::Literal(Value::from_json(other))),
    }
}

fn parse_string(s: &str) -> Result<Expr> {
    if let Some(var) = s.strip_prefix("$$") {
        return match var {
            "ROOT" => Ok(Expr::Root),
            "CURRENT" => Ok(Expr::Current),
            name => Ok(Expr::Variable(name.to_string())),
        };
    }
    if let Some(path) = s.strip_prefix('$') {
        if path.is_empty() {
            return Err(Error::new(ErrorKind::Parse, "empty field path".to_string()));
        }
        return Ok(Expr::FieldPath(path.to_string()));
    }
    Ok(Expr::Literal(Value::Str(s.to_string())))
}

fn op_kind(name: &str) -> Option<OpKind> {
    use OpKind::*;
    Some(match name {
        "add" => Add,
        "subtract" => Subtract,
        "multiply" => Multiply,
        "divide" => Divide,
        "mod" => Mod,
        "abs" => Abs,
        "ceil" => Ceil,
        "floor" => Floor,
        "round" => Round,
        "sqrt" => Sqrt,
        "pow" => Pow,
        "eq" => Eq,
        "ne" => Ne,
        "gt" => Gt,
        "gte" => Gte,
        "lt" => Lt,
        "lte" => Lte,
        "cmp" => Cmp,
        "and" => And,
        "or" => Or,
        "not" => Not,
        "cond" => Cond,
        "ifNull" => IfNull,
        "concat" => Concat,
        "substr" | "substrCP" => Substr,
        "toLower" => ToLower,
        "toUpper" => ToUpper,
        "trim" => Trim,
        "ltrim" => Ltrim,
        "rtrim" => Rtrim,
        "split" => Split,
        "strLenCP" | "strLenBytes" => StrLen,
        "size" => Size,
        "arrayElemAt" => ArrayElemAt,
        "concatArrays" => ConcatArrays,
        "in" => In,
        "indexOfArray" => IndexOfArray,
        "reverseArray" => ReverseArray,
        "slice" => Slice,
        "setEquals" => SetEquals,
        "setIntersection" => SetIntersection,
        "setUnion" => SetUnion,
        "setDifference" => SetDifference,
        "setIsSubset" => SetIsSubset,
        "anyElementTrue" => AnyElementTrue,
        "allElementsTrue" => AllElementsTrue,
        "year" => Year,
        "month" => Month,
        "dayOfMonth" => DayOfMonth,
        "dayOfWeek" => DayOfWeek,
        "dayOfYear" => DayOfYear,
        "week" | "isoWeek" => Week,
        "hour" => Hour,
        "minute" => Minute,
        "second" => Second,
        "millisecond" => Millisecond,
        "dateToString" => DateToString,
        _ => return None,
    })
}

/// Exact or minimum arity per operator; `None` means variadic (at least
/// one argument).
fn arity(op: OpKind) -> (usize, Option<usize>) {
    use OpKind::*;
    match op {
        Abs | Ceil | Floor | Sqrt | Not | ToLower | ToUpper | Size | ReverseArray | StrLen
        | AnyElementTrue | AllElementsTrue | Year | Month | DayOfMonth | DayOfWeek | DayOfYear
        | Week | Hour | Minute | Second | Millisecond => (1, Some(1)),
        Round => (1, Some(2)),
        Subtract | Divide | Mod | Pow | Eq | Ne | Gt | Gte | Lt | Lte | Cmp | ArrayElemAt | In
        | Split | SetDifference | SetIsSubset => (2, Some(2)),
        IfNull => (2, None),
        Cond => (3, Some(3)),
        Substr => (3, Some(3)),
        Slice => (2, Some(3)),
        IndexOfArray => (2, Some(4)),
        Trim | Ltrim | Rtrim => (1, Some(2)),
        Add | Multiply | And | Or | Concat | ConcatArrays | SetEquals | SetIntersection
        | SetUnion => (1, None),
        DateToString => (1, Some(2)),
    }
}

fn parse_operator(name: &str, args: &Json) -> Result<Expr> {
    match name {
        "literal" => return Ok(Expr::Literal(Value::from_json(args))),
        "filter" => return parse_filter(args),
        "map" => return parse_map(args),
        "switch" => return parse_switch(args),
        _ => {}
    }

    let Some(kind) = op_kind(name) else {
        return Err(Error::new(
            ErrorKind::Unsupported,
            format!("operator '${}' is outside the incremental set", name),
        ));
    };

    let parsed = match name {
        // Named-argument forms.
        "cond" if args.is_object() => parse_cond_object(args)?,
        "trim" | "ltrim" | "rtrim" if args.is_object() => parse_trim_object(kind, args)?,
        "dateToString" if args.is_object() => parse_date_to_string(args)?,
        _ => {
            let list = match args {
                Json::Array(items) => items.iter().map(parse_expr).collect::<Result<Vec<_>>>()?,
                single => vec![parse_expr(single)?],
            };
            Expr::Op(kind, list)
        }
    };

    if let Expr::Op(kind, ref list) = parsed {
        let (min, max) = arity(kind);
        if list.len() < min || max.map(|m| list.len() > m).unwrap_or(false) {
            return Err(Error::new(
                ErrorKind::Parse,
                format!(
                    "${} expects {} argument(s), got {}",
                    name,
                    match max {
                        Some(m) if m == min => format!("{}", min),
                        Some(m) => format!("{}..{}", min, m),
                        None => format!("at least {}", min),
                    },
                    list.len()
                ),
            ));
        }
    }
    Ok(parsed)
}

fn get_field<'a>(map: &'a serde_json::Map<String, Json>, op: &str, key: &str) -> Result<&'a Json> {
    map.get(key).ok_or_else(|| {
        Error::new(ErrorKind::Parse, format!("${} requires a '{}' field", op, key))
    })
}

fn parse_cond_object(args: &Json) -> Result<Expr> {
    let map = args.as_object().unwrap();
    Ok(Expr::Op(
        OpKind::Cond,
        vec![
            parse_expr(get_field(map, "cond", "if")?)?,
            parse_expr(get_field(map, "cond", "then")?)?,
            parse_expr(get_field(map, "cond", "else")?)?,
        ],
    ))
}

fn parse_trim_object(kind: OpKind, args: &Json) -> Result<Expr> {
    let map = args.as_object().unwrap();
    let mut list = vec![parse_expr(get_field(map, "trim", "input")?)?];
    if let Some(chars) = map.get("chars") {
        list.push(parse_expr(chars)?);
    }
    Ok(Expr::Op(kind, list))
}

fn parse_date_to_string(args: &Json) -> Result<Expr> {
    let map = args.as_object().unwrap();
    let date = parse_expr(get_field(map, "dateToString", "date")?)?;
    let mut list = vec![date];
    if let Some(format) = map.get("format") {
        list.push(parse_expr(format)?);
    }
    Ok(Expr::Op(OpKind::DateToString, list))
}

fn parse_filter(args: &Json) -> Result<Expr> {
    let map = args
        .as_object()
        .ok_or_else(|| Error::new(ErrorKind::Parse, "$filter requires an object".to_string()))?;
    let input = parse_expr(get_field(map, "filter", "input")?)?;
    let cond = parse_expr(get_field(map, "filter", "cond")?)?;
    let var = map
        .get("as")
        .and_then(|v| v.as_str())
        .unwrap_or("this")
        .to_string();
    Ok(Expr::Filter { input: Box::new(input), var, cond: Box::new(cond) })
}

fn parse_map(args: &Json) -> Result<Expr> {
    let map = args
        .as_object()
        .ok_or_else(|| Error::new(ErrorKind::Parse, "$map requires an object".to_string()))?;
    let input = parse_expr(get_field(map, "map", "input")?)?;
    let body = parse_expr(get_field(map, "map", "in")?)?;
    let var = map
        .get("as")
        .and_then(|v| v.as_str())
        .unwrap_or("this")
        .to_string();
    Ok(Expr::Map { input: Box::new(input), var, body: Box::new(body) })
}

fn parse_switch(args: &Json) -> Result<Expr> {
    let map = args
        .as_object()
        .ok_or_else(|| Error::new(ErrorKind::Parse, "$switch requires an object".to_string()))?;
    let branches_json = get_field(map, "switch", "branches")?
        .as_array()
        .ok_or_else(|| Error::new(ErrorKind::Parse, "$switch branches must be an array".to_string()))?;
    let mut branches = Vec::with_capacity(branches_json.len());
    for branch in branches_json {
        let branch_map = branch.as_object().ok_or_else(|| {
            Error::new(ErrorKind::Parse, "$switch branch must be an object".to_string())
        })?;
        branches.push((
            parse_expr(get_field(branch_map, "switch", "case")?)?,
            parse_expr(get_field(branch_map, "switch", "then")?)?,
        ));
    }
    let default = match map.get("default") {
        Some(d) => Some(Box::new(parse_expr(d)?)),
        None => None,
    };
    Ok(Expr::Switch { branches, default })
}
