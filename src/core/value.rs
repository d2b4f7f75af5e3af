use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, TimeZone, Utc};

use crate::core::error::{Error, ErrorKind, Result};

/// A document field value. Ints and floats are kept apart so that integer
/// sums stay exact, but they compare and hash as one numeric domain.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

/// Cross-type rank for the canonical order:
/// null < numbers < strings < arrays < objects < booleans < timestamps.
fn type_rank(v: &Value) -> u8 {
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

/// Numeric comparison with NaN equal to NaN and NaN above every number.
fn cmp_numeric(a: &Value, b: &Value) -> Ordering {
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        return x.cmp(y);
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    match (x.is_nan(), y.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness used by conditional operators: null/missing, false, 0
    /// and NaN are falsy, everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0 && !f.is_nan(),
            _ => true,
        }
    }

    /// Wrap a float result, folding NaN and infinities to null.
    pub fn from_finite(f: f64) -> Value {
        if f.is_finite() { Value::Float(f) } else { Value::Null }
    }

    /// Build a value from a JSON node. Integers stay integers; an object
    /// of the shape `{"$date": <rfc3339 | millis>}` becomes a timestamp.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    if u <= i64::MAX as u64 { Value::Int(u as i64) } else { Value::Float(u as f64) }
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(inner) = map.get("$date") {
                        if let Some(ts) = parse_date_wrapper(inner) {
                            return Value::Timestamp(ts);
                        }
                    }
                }
                let mut fields = BTreeMap::new();
                for (k, v) in map {
                    fields.insert(k.clone(), Value::from_json(v));
                }
                Value::Object(fields)
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => {
                serde_json::Number::from_f64(*f)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(ts) => {
                let mut map = serde_json::Map::new();
                map.insert("$date".to_string(), serde_json::Value::String(ts.to_rfc3339()));
                serde_json::Value::Object(map)
            }
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(fields) => {
                let mut map = serde_json::Map::new();
                for (k, v) in fields {
                    map.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }
}

fn parse_date_wrapper(inner: &serde_json::Value) -> Option<DateTime<Utc>> {
    match inner {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => {
            let millis = n.as_i64()?;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let (ra, rb) = (type_rank(self), type_rank(other));
        if ra != rb {
            return ra.cmp(&rb);
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Object(a), Value::Object(b)) => {
                // Sorted key sequence first, then values in key order.
                let keys = a.keys().cmp(b.keys());
                if keys != Ordering::Equal {
                    return keys;
                }
                for (x, y) in a.values().zip(b.values()) {
                    let ord = x.cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            }
            _ => cmp_numeric(self, other),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => state.write_u8(0),
            Value::Bool(b) => {
                state.write_u8(5);
                b.hash(state);
            }
            Value::Int(i) => {
                state.write_u8(1);
                i.hash(state);
            }
            Value::Float(f) => {
                state.write_u8(1);
                // Must agree with numeric equality: 1.0 hashes like 1.
                if f.is_nan() {
                    i64::MAX.hash(state);
                    state.write_u8(255);
                } else if f.fract() == 0.0 && *f >= -(2u64.pow(63) as f64) && *f < 2u64.pow(63) as f64 {
                    (*f as i64).hash(state);
                } else {
                    let bits = if *f == 0.0 { 0u64 } else { f.to_bits() };
                    bits.hash(state);
                }
            }
            Value::Str(s) => {
                state.write_u8(2);
                s.hash(state);
            }
            Value::Timestamp(ts) => {
                state.write_u8(6);
                ts.timestamp_millis().hash(state);
            }
            Value::Array(items) => {
                state.write_u8(3);
                state.write_usize(items.len());
                for item in items {
                    item.hash(state);
                }
            }
            Value::Object(fields) => {
                state.write_u8(4);
                state.write_usize(fields.len());
                for (k, v) in fields {
                    k.hash(state);
                    v.hash(state);
                }
            }
        }
    }
}

/// A document: an unordered map from field names to values. The map is
/// kept sorted so structural comparison is canonical by construction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Document {
    pub fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Document { fields: BTreeMap::new() }
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn from_value(value: Value) -> Result<Document> {
        match value {
            Value::Object(fields) => Ok(Document { fields }),
            other => Err(Error::new(
                ErrorKind::InvalidInput,
                format!("expected a document, got {}", other.type_name()),
            )),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Result<Document> {
        match Value::from_json(json) {
            Value::Object(fields) => Ok(Document { fields }),
            other => Err(Error::new(
                ErrorKind::InvalidInput,
                format!("expected a JSON object, got {}", other.type_name()),
            )),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.as_value().to_json()
    }
}
