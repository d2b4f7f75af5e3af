use std::collections::{BTreeMap, HashMap};

use serde_json::Value as Json;

use crate::bitmap::live_set::LiveSet;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Delta, DeltaBatch, DeltaOp, Rid};
use crate::core::value::{Document, Value};
use crate::expr::ast::Expr;
use crate::expr::parse::parse_expr;
use crate::expr::scalar::eval_scalar;
use crate::index::multiset::RefCountedMultiSet;
use crate::index::ostree::OsTree;
use crate::kernel::reduce::KahanSum;
use crate::ops::{Operator, delta_after, delta_before};

/// Accumulator specification of one output field.
#[derive(Debug, Clone)]
pub enum AccSpec {
    Sum(Expr),
    Avg(Expr),
    Min(Expr),
    Max(Expr),
    Push(Expr),
    AddToSet(Expr),
    First(Expr),
    Last(Expr),
}

impl AccSpec {
    pub fn compile(json: &Json) -> Result<AccSpec> {
        let map = json.as_object().filter(|m| m.len() == 1).ok_or_else(|| {
            Error::new(
                ErrorKind::Parse,
                "accumulator must be a single-key operator object".to_string(),
            )
        })?;
        let (name, arg) = map.iter().next().unwrap();
        let expr = parse_expr(arg)?;
        Ok(match name.as_str() {
            "$sum" => AccSpec::Sum(expr),
            "$avg" => AccSpec::Avg(expr),
            "$min" => AccSpec::Min(expr),
            "$max" => AccSpec::Max(expr),
            "$push" => AccSpec::Push(expr),
            "$addToSet" => AccSpec::AddToSet(expr),
            "$first" => AccSpec::First(expr),
            "$last" => AccSpec::Last(expr),
            other => {
                return Err(Error::new(
                    ErrorKind::Unsupported,
                    format!("accumulator '{}' is outside the incremental set", other),
                ));
            }
        })
    }

    fn expr(&self) -> &Expr {
        match self {
            AccSpec::Sum(e)
            | AccSpec::Avg(e)
            | AccSpec::Min(e)
            | AccSpec::Max(e)
            | AccSpec::Push(e)
            | AccSpec::AddToSet(e)
            | AccSpec::First(e)
            | AccSpec::Last(e) => e,
        }
    }

    fn fresh_state(&self) -> AccState {
        match self {
            AccSpec::Sum(_) => AccState::Sum(NumericSum::default()),
            AccSpec::Avg(_) => AccState::Avg(NumericSum::default()),
            AccSpec::Min(_) => AccState::Min(RefCountedMultiSet::new()),
            AccSpec::Max(_) => AccState::Max(RefCountedMultiSet::new()),
            AccSpec::Push(_) => AccState::Push(BTreeMap::new()),
            AccSpec::AddToSet(_) => AccState::AddToSet(BTreeMap::new()),
            AccSpec::First(_) => AccState::First(OsTree::new()),
            AccSpec::Last(_) => AccState::Last(OsTree::new()),
        }
    }
}

/// Running sum split into an exact integer part and a compensated float
/// part, so integer-only groups materialize as integers and deletes are
/// exact subtractions.
#[derive(Debug, Clone, Copy, Default)]
struct NumericSum {
    int_sum: i128,
    float_sum: KahanSum,
    numeric_count: u64,
    float_count: u64,
}

impl NumericSum {
    fn apply(&mut self, value: &Value, sign: i64) {
        match value {
            Value::Int(i) => {
                self.int_sum += *i as i128 * sign as i128;
                self.numeric_count = self.numeric_count.wrapping_add_signed(sign);
            }
            Value::Float(f) => {
                if sign > 0 {
                    self.float_sum.add(*f);
                } else {
                    self.float_sum.sub(*f);
                }
                self.float_count = self.float_count.wrapping_add_signed(sign);
                self.numeric_count = self.numeric_count.wrapping_add_signed(sign);
            }
            // Non-numeric contributions are ignored, symmetrically on
            // insert and delete.
            _ => {}
        }
    }

    fn sum_value(&self) -> Value {
        if self.float_count == 0 {
            match i64::try_from(self.int_sum) {
                Ok(i) => Value::Int(i),
                Err(_) => Value::Float(self.int_sum as f64),
            }
        } else {
            Value::from_finite(self.int_sum as f64 + self.float_sum.value())
        }
    }

    fn avg_value(&self) -> Value {
        if self.numeric_count == 0 {
            return Value::Null;
        }
        let total = self.int_sum as f64 + self.float_sum.value();
        Value::from_finite(total / self.numeric_count as f64)
    }
}

#[derive(Debug)]
enum AccState {
    Sum(NumericSum),
    Avg(NumericSum),
    Min(RefCountedMultiSet),
    Max(RefCountedMultiSet),
    Push(BTreeMap<Rid, Value>),
    AddToSet(BTreeMap<Value, u64>),
    First(OsTree<Value>),
    Last(OsTree<Value>),
}

impl AccState {
    fn apply(&mut self, value: Value, rid: Rid, sign: i64) {
        match self {
            AccState::Sum(s) | AccState::Avg(s) => s.apply(&value, sign),
            AccState::Min(set) | AccState::Max(set) => {
                if !matches!(value, Value::Null) {
                    if sign > 0 {
                        set.add(value);
                    } else {
                        set.remove(&value);
                    }
                }
            }
            AccState::Push(list) => {
                if sign > 0 {
                    list.insert(rid, value);
                } else {
                    list.remove(&rid);
                }
            }
            AccState::AddToSet(counts) => {
                if sign > 0 {
                    *counts.entry(value).or_insert(0) += 1;
                } else if let Some(count) = counts.get_mut(&value) {
                    *count -= 1;
                    if *count == 0 {
                        counts.remove(&value);
                    }
                }
            }
            AccState::First(tree) | AccState::Last(tree) => {
                if sign > 0 {
                    tree.insert(Value::Null, rid, value);
                } else {
                    tree.remove(&Value::Null, rid);
                }
            }
        }
    }

    fn value(&self) -> Value {
        match self {
            AccState::Sum(s) => s.sum_value(),
            AccState::Avg(s) => s.avg_value(),
            AccState::Min(set) => set.min().cloned().unwrap_or(Value::Null),
            AccState::Max(set) => set.max().cloned().unwrap_or(Value::Null),
            AccState::Push(list) => Value::Array(list.values().cloned().collect()),
            AccState::AddToSet(counts) => Value::Array(counts.keys().cloned().collect()),
            AccState::First(tree) => {
                tree.first().map(|(_, _, v)| v.clone()).unwrap_or(Value::Null)
            }
            AccState::Last(tree) => tree.last().map(|(_, _, v)| v.clone()).unwrap_or(Value::Null),
        }
    }
}

/// Parse a `$group` stage body into its key expression and accumulator
/// specs.
pub fn parse_group_spec(json: &Json) -> Result<(Expr, Vec<(String, AccSpec)>)> {
    let map = json.as_object().ok_or_else(|| {
        Error::new(ErrorKind::Parse, "$group requires an object".to_string())
    })?;
    let id = map.get("_id").ok_or_else(|| {
        Error::new(ErrorKind::Parse, "$group requires an _id expression".to_string())
    })?;
    let key_expr = parse_expr(id)?;
    let mut acc_specs = Vec::new();
    for (field, spec) in map {
        if field == "_id" {
            continue;
        }
        acc_specs.push((field.clone(), AccSpec::compile(spec)?));
    }
    Ok((key_expr, acc_specs))
}

#[derive(Debug)]
struct GroupState {
    ordinal: u64,
    count: u64,
    contributing: LiveSet,
    next_local: u64,
    accs: Vec<AccState>,
}

/// Incremental `$group`. One state record per live group key; inserts
/// and deletes flow into each accumulator with a +1/−1 sign, and a batch
/// emits one output delta per group whose materialization changed.
#[derive(Debug)]
pub struct GroupOp {
    key_expr: Expr,
    acc_specs: Vec<(String, AccSpec)>,
    groups: HashMap<Value, GroupState>,
    // Ordinals survive group drops so a re-created key keeps its rid.
    ordinals: HashMap<Value, u64>,
    next_ordinal: u64,
    members: HashMap<Rid, u64>,
}

impl GroupOp {
    pub fn new(key_expr: Expr, acc_specs: Vec<(String, AccSpec)>) -> Self {
        GroupOp {
            key_expr,
            acc_specs,
            groups: HashMap::new(),
            ordinals: HashMap::new(),
            next_ordinal: 0,
            members: HashMap::new(),
        }
    }

    /// Compile a `$group` stage body: `{_id: expr, field: accumulator}`.
    pub fn compile(json: &Json) -> Result<GroupOp> {
        let (key_expr, acc_specs) = parse_group_spec(json)?;
        Ok(GroupOp::new(key_expr, acc_specs))
    }

    pub fn key_expr(&self) -> &Expr {
        &self.key_expr
    }

    fn ordinal_for(&mut self, key: &Value) -> u64 {
        if let Some(ordinal) = self.ordinals.get(key) {
            return *ordinal;
        }
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.ordinals.insert(key.clone(), ordinal);
        ordinal
    }

    fn group_doc(&self, key: &Value) -> Option<Document> {
        let state = self.groups.get(key)?;
        if state.count == 0 {
            return None;
        }
        let mut doc = Document::new();
        doc.set("_id", key.clone());
        for ((field, _), acc) in self.acc_specs.iter().zip(state.accs.iter()) {
            doc.set(field, acc.value());
        }
        Some(doc)
    }

    fn absorb(
        &mut self,
        doc: &Document,
        rid: Rid,
        sign: i64,
        touched: &mut Vec<(Value, Option<Document>)>,
    ) -> Result<()> {
        let key = eval_scalar(&self.key_expr, doc, doc);
        if !touched.iter().any(|(k, _)| k == &key) {
            let before = self.group_doc(&key);
            touched.push((key.clone(), before));
        }

        if sign > 0 {
            if self.members.contains_key(&rid) {
                return Err(Error::new(
                    ErrorKind::Internal,
                    format!("rid {:?} inserted into group state twice", rid),
                ));
            }
            let ordinal = self.ordinal_for(&key);
            let specs = &self.acc_specs;
            let state = self.groups.entry(key.clone()).or_insert_with(|| GroupState {
                ordinal,
                count: 0,
                contributing: LiveSet::new(),
                next_local: 0,
                accs: specs.iter().map(|(_, s)| s.fresh_state()).collect(),
            });
            let local = state.next_local;
            state.next_local += 1;
            self.members.insert(rid, local);
            state.contributing.set(local as usize);
            state.count += 1;
            for ((_, spec), acc) in self.acc_specs.iter().zip(state.accs.iter_mut()) {
                let value = eval_scalar(spec.expr(), doc, doc);
                acc.apply(value, rid, 1);
            }
        } else {
            let Some(local) = self.members.remove(&rid) else {
                return Err(Error::new(
                    ErrorKind::Internal,
                    format!("rid {:?} removed from group state but never inserted", rid),
                ));
            };
            let Some(state) = self.groups.get_mut(&key) else {
                return Err(Error::new(
                    ErrorKind::Internal,
                    format!("group for key {:?} vanished", key),
                ));
            };
            if !state.contributing.test(local as usize) {
                return Err(Error::new(
                    ErrorKind::Internal,
                    format!("rid {:?} does not contribute to its group", rid),
                ));
            }
            state.contributing.clear(local as usize);
            state.count -= 1;
            for ((_, spec), acc) in self.acc_specs.iter().zip(state.accs.iter_mut()) {
                let value = eval_scalar(spec.expr(), doc, doc);
                acc.apply(value, rid, -1);
            }
        }
        Ok(())
    }
}

impl Operator for GroupOp {
    fn name(&self) -> &'static str {
        "group"
    }

    fn push(&mut self, batch: DeltaBatch) -> Result<DeltaBatch> {
        // Before-images per touched group, captured on first touch so one
        // batch nets out to at most one emitted delta per group.
        let mut touched: Vec<(Value, Option<Document>)> = Vec::new();
        let seq = batch.deltas.last().map(|d| d.seq).unwrap_or(0);
        for delta in &batch.deltas {
            match delta.op {
                DeltaOp::Insert => self.absorb(delta_after(delta)?, delta.rid, 1, &mut touched)?,
                DeltaOp::Delete => self.absorb(delta_before(delta)?, delta.rid, -1, &mut touched)?,
                DeltaOp::Update => {
                    self.absorb(delta_before(delta)?, delta.rid, -1, &mut touched)?;
                    self.absorb(delta_after(delta)?, delta.rid, 1, &mut touched)?;
                }
            }
        }

        let mut out = DeltaBatch::new();
        for (key, before) in touched {
            let after = self.group_doc(&key);
            let ordinal = self.ordinal_for(&key);
            let rid = Rid::child(ordinal, 0);
            match (before, after) {
                (None, Some(doc)) => out.push(Delta::insert(rid, doc, seq)),
                (Some(doc), None) => {
                    self.groups.remove(&key);
                    out.push(Delta::delete(rid, doc, seq));
                }
                (Some(b), Some(a)) => {
                    if b != a {
                        out.push(Delta::update(rid, b, a, seq));
                    }
                }
                (None, None) => {
                    self.groups.remove(&key);
                }
            }
        }
        Ok(out)
    }

    fn snapshot(&self) -> Option<Vec<Document>> {
        let mut entries: Vec<(u64, Document)> = self
            .groups
            .keys()
            .filter_map(|key| {
                let doc = self.group_doc(key)?;
                Some((self.groups[key].ordinal, doc))
            })
            .collect();
        entries.sort_by_key(|(ordinal, _)| *ordinal);
        Some(entries.into_iter().map(|(_, doc)| doc).collect())
    }

    fn reset(&mut self) {
        self.groups.clear();
        self.ordinals.clear();
        self.members.clear();
        self.next_ordinal = 0;
    }
}
