//! Expression evaluation over rows.
//!
//! Predicates use three-valued logic: `eval_predicate` returns
//! `Some(true)`, `Some(false)` or `None` (unknown), and a WHERE keeps a
//! row only on `Some(true)`. Value evaluation never fails: division by
//! zero, bad patterns and failed coercions degrade to NULL and report on
//! the owning operator's fault flag, which logs once and counts.

pub mod datetime;
pub mod scalar;

use crate::sql::ast::{BinaryOp, Expr, TypeName, UnaryOp};
use crate::engine::types::{compare_values, Row, Value};
use regex::Regex;
use smol_str::SmolStr;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Per-operator runtime fault tracking. The first fault logs a warning;
/// the rest only count, so one poisoned stream cannot flood the log.
#[derive(Debug, Default)]
pub struct FaultFlag {
    label: SmolStr,
    logged: Cell<bool>,
    count: Cell<u64>,
}

impl FaultFlag {
    pub fn new(label: impl Into<SmolStr>) -> Self {
        FaultFlag {
            label: label.into(),
            logged: Cell::new(false),
            count: Cell::new(0),
        }
    }

    pub fn report(&self, what: &str) {
        self.count.set(self.count.get() + 1);
        if !self.logged.get() {
            self.logged.set(true);
            tracing::warn!(operator = %self.label, "evaluation fault: {what}; yielding NULL");
        }
    }

    pub fn count(&self) -> u64 {
        self.count.get()
    }
}

/// Everything an expression can see at one row.
#[derive(Clone, Copy)]
pub struct EvalCtx<'a> {
    pub row: &'a Row,
    /// Latest values of compiled scalar subqueries, by `ScalarRef` slot.
    pub scalars: &'a [Value],
    /// Aggregate outputs, by `AggRef` slot (HAVING and post-agg items).
    pub aggs: &'a [Value],
    pub faults: Option<&'a FaultFlag>,
}

impl<'a> EvalCtx<'a> {
    pub fn new(row: &'a Row) -> Self {
        EvalCtx {
            row,
            scalars: &[],
            aggs: &[],
            faults: None,
        }
    }

    pub fn with_faults(row: &'a Row, faults: &'a FaultFlag) -> Self {
        EvalCtx {
            row,
            scalars: &[],
            aggs: &[],
            faults: Some(faults),
        }
    }

    fn fault(&self, what: &str) {
        if let Some(f) = self.faults {
            f.report(what);
        }
    }
}

/// SQL comparison: NULL or type-incompatible operands are unknown.
pub fn sql_compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (x, y) if x.is_numeric() && y.is_numeric() => {
            Some(x.as_f64()?.total_cmp(&y.as_f64()?))
        }
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

pub fn eval_expr(expr: &Expr, ctx: &EvalCtx<'_>) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::ColumnRef(name) => ctx.row.get(name.as_str()).cloned().unwrap_or(Value::Null),
        Expr::Column { table, name } => {
            // Unresolved form: used by operator-level tests. Qualified
            // lookup first, then the bare name.
            if let Some(t) = table {
                let qualified = format!("{}.{}", t, name);
                if let Some(v) = ctx.row.get(&qualified) {
                    return v.clone();
                }
            }
            ctx.row.get(name.as_str()).cloned().unwrap_or(Value::Null)
        }
        Expr::AggRef(slot) => ctx.aggs.get(*slot).cloned().unwrap_or(Value::Null),
        Expr::ScalarRef(slot) => ctx.scalars.get(*slot).cloned().unwrap_or(Value::Null),
        Expr::Unary { op, expr } => match op {
            UnaryOp::Neg => match eval_expr(expr, ctx) {
                Value::Int(i) => Value::Int(-i),
                Value::Float(f) => Value::Float(-f),
                Value::Null => Value::Null,
                _ => {
                    ctx.fault("negation of non-numeric value");
                    Value::Null
                }
            },
            UnaryOp::Not => match eval_predicate(expr, ctx) {
                Some(b) => Value::Bool(!b),
                None => Value::Null,
            },
        },
        Expr::Binary { left, op, right } => {
            if op.is_comparison() || matches!(op, BinaryOp::And | BinaryOp::Or) {
                return match eval_predicate(expr, ctx) {
                    Some(b) => Value::Bool(b),
                    None => Value::Null,
                };
            }
            let l = eval_expr(left, ctx);
            let r = eval_expr(right, ctx);
            arith(&l, *op, &r, ctx)
        }
        Expr::IsNull { .. }
        | Expr::Between { .. }
        | Expr::InList { .. }
        | Expr::Like { .. }
        | Expr::Regexp { .. } => match eval_predicate(expr, ctx) {
            Some(b) => Value::Bool(b),
            None => Value::Null,
        },
        Expr::Case {
            operand,
            arms,
            otherwise,
        } => {
            match operand {
                Some(op_expr) => {
                    let target = eval_expr(op_expr, ctx);
                    for (when, then) in arms {
                        let w = eval_expr(when, ctx);
                        if sql_compare(&target, &w) == Some(Ordering::Equal) {
                            return eval_expr(then, ctx);
                        }
                    }
                }
                None => {
                    for (when, then) in arms {
                        if eval_predicate(when, ctx) == Some(true) {
                            return eval_expr(then, ctx);
                        }
                    }
                }
            }
            otherwise
                .as_ref()
                .map(|e| eval_expr(e, ctx))
                .unwrap_or(Value::Null)
        }
        Expr::Cast { expr, ty } => cast(eval_expr(expr, ctx), *ty, ctx),
        Expr::Function { name, args } => {
            let values: Vec<Value> = args.iter().map(|a| eval_expr(a, ctx)).collect();
            scalar::call(name.as_str(), &values, ctx)
        }
        // Extracted by the compiler; reaching them here is a wiring bug.
        Expr::Aggregate(_) | Expr::Window(_) | Expr::ScalarSubquery(_) => {
            ctx.fault("aggregate/window/subquery evaluated outside its operator");
            Value::Null
        }
        Expr::InSubquery { .. } | Expr::Exists { .. } => {
            ctx.fault("subquery predicate evaluated outside its operator");
            Value::Null
        }
    }
}

/// Kleene three-valued predicate evaluation.
pub fn eval_predicate(expr: &Expr, ctx: &EvalCtx<'_>) -> Option<bool> {
    match expr {
        Expr::Literal(Value::Bool(b)) => Some(*b),
        Expr::Literal(Value::Null) => None,
        Expr::Unary {
            op: UnaryOp::Not,
            expr,
        } => eval_predicate(expr, ctx).map(|b| !b),
        Expr::Binary { left, op, right } => match op {
            BinaryOp::And => match (eval_predicate(left, ctx), eval_predicate(right, ctx)) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            BinaryOp::Or => match (eval_predicate(left, ctx), eval_predicate(right, ctx)) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
            BinaryOp::Eq => cmp3(left, right, ctx, |o| o == Ordering::Equal),
            BinaryOp::NotEq => cmp3(left, right, ctx, |o| o != Ordering::Equal),
            BinaryOp::Lt => cmp3(left, right, ctx, |o| o == Ordering::Less),
            BinaryOp::LtEq => cmp3(left, right, ctx, |o| o != Ordering::Greater),
            BinaryOp::Gt => cmp3(left, right, ctx, |o| o == Ordering::Greater),
            BinaryOp::GtEq => cmp3(left, right, ctx, |o| o != Ordering::Less),
            _ => truthy(eval_expr(expr, ctx)),
        },
        Expr::IsNull { expr, negated } => {
            let is_null = eval_expr(expr, ctx).is_null();
            Some(is_null != *negated)
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let v = eval_expr(expr, ctx);
            let lo = eval_expr(low, ctx);
            let hi = eval_expr(high, ctx);
            let in_range = match (sql_compare(&v, &lo), sql_compare(&v, &hi)) {
                (Some(a), Some(b)) => Some(a != Ordering::Less && b != Ordering::Greater),
                _ => None,
            };
            in_range.map(|b| b != *negated)
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let v = eval_expr(expr, ctx);
            if v.is_null() {
                return None;
            }
            let mut saw_null = false;
            for item in list {
                let iv = eval_expr(item, ctx);
                if iv.is_null() {
                    saw_null = true;
                    continue;
                }
                if sql_compare(&v, &iv) == Some(Ordering::Equal) {
                    return Some(!*negated);
                }
            }
            if saw_null {
                None
            } else {
                Some(*negated)
            }
        }
        Expr::Like {
            expr,
            pattern,
            negated,
        } => {
            let v = eval_expr(expr, ctx);
            let p = eval_expr(pattern, ctx);
            match (v.as_str(), p.as_str()) {
                (Some(s), Some(pat)) => {
                    let re = like_to_regex(pat);
                    match cached_regex(&re, false) {
                        Some(rx) => Some(rx.is_match(s) != *negated),
                        None => {
                            ctx.fault("invalid LIKE pattern");
                            None
                        }
                    }
                }
                _ => None,
            }
        }
        Expr::Regexp {
            expr,
            pattern,
            negated,
            case_insensitive,
        } => {
            let v = eval_expr(expr, ctx);
            let p = eval_expr(pattern, ctx);
            match (v.as_str(), p.as_str()) {
                (Some(s), Some(pat)) => match cached_regex(pat, *case_insensitive) {
                    Some(rx) => Some(rx.is_match(s) != *negated),
                    None => {
                        ctx.fault("regex failed to compile");
                        None
                    }
                },
                _ => None,
            }
        }
        _ => truthy(eval_expr(expr, ctx)),
    }
}

fn truthy(v: Value) -> Option<bool> {
    match v {
        Value::Null => None,
        Value::Bool(b) => Some(b),
        Value::Int(i) => Some(i != 0),
        Value::Float(f) => Some(f != 0.0),
        Value::Str(_) => Some(false),
    }
}

fn cmp3(
    left: &Expr,
    right: &Expr,
    ctx: &EvalCtx<'_>,
    f: impl FnOnce(Ordering) -> bool,
) -> Option<bool> {
    let l = eval_expr(left, ctx);
    let r = eval_expr(right, ctx);
    sql_compare(&l, &r).map(f)
}

fn arith(l: &Value, op: BinaryOp, r: &Value, ctx: &EvalCtx<'_>) -> Value {
    if op == BinaryOp::Concat {
        if l.is_null() || r.is_null() {
            return Value::Null;
        }
        return Value::Str(SmolStr::new(format!("{}{}", l, r)));
    }
    if l.is_null() || r.is_null() {
        return Value::Null;
    }
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => match op {
            BinaryOp::Add => Value::Int(a.wrapping_add(*b)),
            BinaryOp::Sub => Value::Int(a.wrapping_sub(*b)),
            BinaryOp::Mul => Value::Int(a.wrapping_mul(*b)),
            BinaryOp::Div => {
                if *b == 0 {
                    ctx.fault("division by zero");
                    Value::Null
                } else {
                    Value::Int(a / b)
                }
            }
            BinaryOp::Mod => {
                if *b == 0 {
                    ctx.fault("modulo by zero");
                    Value::Null
                } else {
                    Value::Int(a % b)
                }
            }
            _ => Value::Null,
        },
        (a, b) if a.is_numeric() && b.is_numeric() => {
            let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            match op {
                BinaryOp::Add => Value::Float(x + y),
                BinaryOp::Sub => Value::Float(x - y),
                BinaryOp::Mul => Value::Float(x * y),
                BinaryOp::Div => {
                    if y == 0.0 {
                        ctx.fault("division by zero");
                        Value::Null
                    } else {
                        Value::Float(x / y)
                    }
                }
                BinaryOp::Mod => {
                    if y == 0.0 {
                        ctx.fault("modulo by zero");
                        Value::Null
                    } else {
                        Value::Float(x % y)
                    }
                }
                _ => Value::Null,
            }
        }
        _ => {
            ctx.fault("arithmetic on non-numeric operands");
            Value::Null
        }
    }
}

fn cast(v: Value, ty: TypeName, ctx: &EvalCtx<'_>) -> Value {
    if v.is_null() {
        return Value::Null;
    }
    match ty {
        TypeName::Integer => match &v {
            Value::Int(_) => v,
            Value::Float(f) => Value::Int(*f as i64),
            Value::Bool(b) => Value::Int(*b as i64),
            Value::Str(s) => match s.trim().parse::<i64>() {
                Ok(i) => Value::Int(i),
                Err(_) => match s.trim().parse::<f64>() {
                    Ok(f) => Value::Int(f as i64),
                    Err(_) => {
                        ctx.fault("CAST to integer failed");
                        Value::Null
                    }
                },
            },
            Value::Null => Value::Null,
        },
        TypeName::Decimal => match &v {
            Value::Float(_) => v,
            Value::Int(i) => Value::Float(*i as f64),
            Value::Bool(b) => Value::Float(*b as i64 as f64),
            Value::Str(s) => match s.trim().parse::<f64>() {
                Ok(f) => Value::Float(f),
                Err(_) => {
                    ctx.fault("CAST to decimal failed");
                    Value::Null
                }
            },
            Value::Null => Value::Null,
        },
        TypeName::Text | TypeName::Timestamp => match &v {
            Value::Str(_) => v,
            other => Value::Str(SmolStr::new(other.to_string())),
        },
        TypeName::Boolean => match &v {
            Value::Bool(_) => v,
            Value::Int(i) => Value::Bool(*i != 0),
            Value::Float(f) => Value::Bool(*f != 0.0),
            Value::Str(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Value::Bool(true),
                "false" | "f" | "0" => Value::Bool(false),
                _ => {
                    ctx.fault("CAST to boolean failed");
                    Value::Null
                }
            },
            Value::Null => Value::Null,
        },
    }
}

fn like_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

thread_local! {
    static REGEX_CACHE: RefCell<HashMap<(String, bool), Option<Regex>>> =
        RefCell::new(HashMap::new());
}

fn cached_regex(pattern: &str, case_insensitive: bool) -> Option<Regex> {
    REGEX_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache
            .entry((pattern.to_string(), case_insensitive))
            .or_insert_with(|| {
                let source = if case_insensitive {
                    format!("(?i){}", pattern)
                } else {
                    pattern.to_string()
                };
                Regex::new(&source).ok()
            })
            .clone()
    })
}

/// Row ordering over a list of (expression, descending) keys, NULLs first
/// ascending. Used by window partitions and top-K.
pub fn compare_rows_by(
    a: &Row,
    b: &Row,
    keys: &[(Expr, bool)],
) -> Ordering {
    for (expr, desc) in keys {
        let va = eval_expr(expr, &EvalCtx::new(a));
        let vb = eval_expr(expr, &EvalCtx::new(b));
        let ord = compare_values(&va, &vb);
        let ord = if *desc { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
