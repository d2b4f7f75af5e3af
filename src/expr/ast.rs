use crate::core::value::Value;

/// Operators the incremental engine evaluates natively. Anything outside
/// this set forces the pipeline onto the one-shot fallback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    // arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Abs,
    Ceil,
    Floor,
    Round,
    Sqrt,
    Pow,
    // comparison
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Cmp,
    // logical
    And,
    Or,
    Not,
    // conditional
    Cond,
    IfNull,
    // string
    Concat,
    Substr,
    ToLower,
    ToUpper,
    Trim,
    Ltrim,
    Rtrim,
    Split,
    StrLen,
    // array
    Size,
    ArrayElemAt,
    ConcatArrays,
    In,
    IndexOfArray,
    ReverseArray,
    Slice,
    // set
    SetEquals,
    SetIntersection,
    SetUnion,
    SetDifference,
    SetIsSubset,
    AnyElementTrue,
    AllElementsTrue,
    // date
    Year,
    Month,
    DayOfMonth,
    DayOfWeek,
    DayOfYear,
    Week,
    Hour,
    Minute,
    Second,
    Millisecond,
    DateToString,
}

impl OpKind {
    /// Whether the vectorized fuser can compile this operator.
    pub fn is_simple(&self) -> bool {
        use OpKind::*;
        matches!(
            self,
            Add | Subtract | Multiply | Divide | Mod | Abs | Ceil | Floor | Round | Sqrt | Pow
                | Eq | Ne | Gt | Gte | Lt | Lte | Cmp | And | Or | Not | Cond | IfNull
        )
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    FieldPath(String),
    Root,
    Current,
    Variable(String),
    Op(OpKind, Vec<Expr>),
    Filter { input: Box<Expr>, var: String, cond: Box<Expr> },
    Map { input: Box<Expr>, var: String, body: Box<Expr> },
    Switch { branches: Vec<(Expr, Expr)>, default: Option<Box<Expr>> },
    ArrayShape(Vec<Expr>),
    ObjectShape(Vec<(String, Expr)>),
}

impl Expr {
    /// Field paths this expression reads, for dimension registration and
    /// fusion planning. Paths reached through `$$ROOT` are not tracked.
    pub fn referenced_paths(&self, out: &mut Vec<String>) {
        match self {
            Expr::FieldPath(path) => {
                if !out.contains(path) {
                    out.push(path.clone());
                }
            }
            Expr::Op(_, args) => {
                for arg in args {
                    arg.referenced_paths(out);
                }
            }
            Expr::Filter { input, cond, .. } => {
                input.referenced_paths(out);
                cond.referenced_paths(out);
            }
            Expr::Map { input, body, .. } => {
                input.referenced_paths(out);
                body.referenced_paths(out);
            }
            Expr::Switch { branches, default } => {
                for (case, then) in branches {
                    case.referenced_paths(out);
                    then.referenced_paths(out);
                }
                if let Some(d) = default {
                    d.referenced_paths(out);
                }
            }
            Expr::ArrayShape(items) => {
                for item in items {
                    item.referenced_paths(out);
                }
            }
            Expr::ObjectShape(fields) => {
                for (_, expr) in fields {
                    expr.referenced_paths(out);
                }
            }
            Expr::Literal(_) | Expr::Root | Expr::Current | Expr::Variable(_) => {}
        }
    }

    /// True when every operator in the tree is in the fuser's simple set.
    pub fn is_simple(&self) -> bool {
        match self {
            Expr::Literal(_) | Expr::FieldPath(_) | Expr::Root | Expr::Current | Expr::Variable(_) => true,
            Expr::Op(kind, args) => kind.is_simple() && args.iter().all(Expr::is_simple),
            Expr::Switch { branches, default } => {
                branches.iter().all(|(c, t)| c.is_simple() && t.is_simple())
                    && default.as_ref().map(|d| d.is_simple()).unwrap_or(true)
            }
            Expr::ArrayShape(items) => items.iter().all(Expr::is_simple),
            Expr::ObjectShape(fields) => fields.iter().all(|(_, e)| e.is_simple()),
            Expr::Filter { .. } | Expr::Map { .. } => false,
        }
    }

    /// Rough node count, the unit of the fuser's code-size guardrail.
    pub fn token_count(&self) -> usize {
        match self {
            Expr::Literal(_) | Expr::FieldPath(_) | Expr::Root | Expr::Current | Expr::Variable(_) => 1,
            Expr::Op(_, args) => 1 + args.iter().map(Expr::token_count).sum::<usize>(),
            Expr::Filter { input, cond, .. } => 1 + input.token_count() + cond.token_count(),
            Expr::Map { input, body, .. } => 1 + input.token_count() + body.token_count(),
            Expr::Switch { branches, default } => {
                1 + branches.iter().map(|(c, t)| c.token_count() + t.token_count()).sum::<usize>()
                    + default.as_ref().map(|d| d.token_count()).unwrap_or(0)
            }
            Expr::ArrayShape(items) => 1 + items.iter().map(Expr::token_count).sum::<usize>(),
            Expr::ObjectShape(fields) => {
                1 + fields.iter().map(|(_, e)| e.token_count()).sum::<usize>()
            }
        }
    }
}
