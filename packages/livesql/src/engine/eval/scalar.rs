//! Built-in scalar functions. Unknown names and bad arguments degrade to
//! NULL with a fault report; the row is still emitted.

use super::{datetime, EvalCtx};
use crate::engine::types::Value;
use smol_str::SmolStr;

pub fn call(name: &str, args: &[Value], ctx: &EvalCtx<'_>) -> Value {
    match name.to_ascii_uppercase().as_str() {
        "UPPER" => str1(args, |s| s.to_uppercase()),
        "LOWER" => str1(args, |s| s.to_lowercase()),
        "LENGTH" => match args.first() {
            Some(Value::Str(s)) => Value::Int(s.chars().count() as i64),
            Some(Value::Null) | None => Value::Null,
            Some(other) => Value::Int(other.to_string().chars().count() as i64),
        },
        "TRIM" => str1(args, |s| s.trim().to_string()),
        "LTRIM" => str1(args, |s| s.trim_start().to_string()),
        "RTRIM" => str1(args, |s| s.trim_end().to_string()),
        "SUBSTR" | "SUBSTRING" => substr(args),
        "REPLACE" => match (args.first(), args.get(1), args.get(2)) {
            (Some(Value::Str(s)), Some(Value::Str(from)), Some(Value::Str(to))) => {
                Value::Str(SmolStr::new(s.replace(from.as_str(), to.as_str())))
            }
            _ => Value::Null,
        },
        "CONCAT" => {
            let mut out = String::new();
            for a in args {
                if !a.is_null() {
                    out.push_str(&a.to_string());
                }
            }
            Value::Str(SmolStr::new(out))
        }
        "COALESCE" | "IFNULL" => args
            .iter()
            .find(|a| !a.is_null())
            .cloned()
            .unwrap_or(Value::Null),
        "NULLIF" => match (args.first(), args.get(1)) {
            (Some(a), Some(b)) => {
                if super::sql_compare(a, b) == Some(std::cmp::Ordering::Equal) {
                    Value::Null
                } else {
                    a.clone()
                }
            }
            _ => Value::Null,
        },
        "ABS" => num1(args, ctx, |f| f.abs()),
        "ROUND" => {
            let digits = args.get(1).and_then(|v| v.as_i64()).unwrap_or(0);
            let factor = 10f64.powi(digits as i32);
            match args.first() {
                Some(v) if v.is_numeric() => {
                    let f = v.as_f64().unwrap_or(0.0);
                    Value::Float((f * factor).round() / factor)
                }
                _ => Value::Null,
            }
        }
        "CEIL" | "CEILING" => num1(args, ctx, f64::ceil),
        "FLOOR" => num1(args, ctx, f64::floor),
        "SQRT" => match args.first().and_then(Value::as_f64) {
            Some(f) if f >= 0.0 => Value::Float(f.sqrt()),
            Some(_) => {
                ctx.fault("SQRT of negative value");
                Value::Null
            }
            None => Value::Null,
        },
        "POWER" | "POW" => match (
            args.first().and_then(Value::as_f64),
            args.get(1).and_then(Value::as_f64),
        ) {
            (Some(b), Some(e)) => Value::Float(b.powf(e)),
            _ => Value::Null,
        },
        "MOD" => match (
            args.first().and_then(Value::as_i64),
            args.get(1).and_then(Value::as_i64),
        ) {
            (Some(_), Some(0)) => {
                ctx.fault("modulo by zero");
                Value::Null
            }
            (Some(a), Some(b)) => Value::Int(a % b),
            _ => Value::Null,
        },
        "SIGN" => match args.first().and_then(Value::as_f64) {
            Some(f) => Value::Int(if f > 0.0 {
                1
            } else if f < 0.0 {
                -1
            } else {
                0
            }),
            None => Value::Null,
        },
        "DATE" => datetime::date(args, ctx),
        "TIME" => datetime::time(args, ctx),
        "DATETIME" => datetime::datetime(args, ctx),
        "STRFTIME" => datetime::strftime(args, ctx),
        "JULIANDAY" => datetime::julianday(args, ctx),
        "UNIXEPOCH" => datetime::unixepoch(args, ctx),
        other => {
            ctx.fault(&format!("unknown scalar function {other}"));
            Value::Null
        }
    }
}

fn str1(args: &[Value], f: impl FnOnce(&str) -> String) -> Value {
    match args.first() {
        Some(Value::Str(s)) => Value::Str(SmolStr::new(f(s.as_str()))),
        _ => Value::Null,
    }
}

fn num1(args: &[Value], _ctx: &EvalCtx<'_>, f: impl FnOnce(f64) -> f64) -> Value {
    match args.first() {
        Some(Value::Int(i)) => Value::Int(f(*i as f64) as i64),
        Some(Value::Float(x)) => Value::Float(f(*x)),
        _ => Value::Null,
    }
}

/// One-based, SQLite-style bounds: negative start counts from the end.
fn substr(args: &[Value]) -> Value {
    let s = match args.first() {
        Some(Value::Str(s)) => s.as_str(),
        _ => return Value::Null,
    };
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as i64;
    let start = match args.get(1).and_then(Value::as_i64) {
        Some(n) => n,
        None => return Value::Null,
    };
    let begin = if start > 0 {
        start - 1
    } else if start < 0 {
        (len + start).max(0)
    } else {
        0
    };
    let count = args
        .get(2)
        .and_then(Value::as_i64)
        .unwrap_or(len)
        .max(0);
    let out: String = chars
        .into_iter()
        .skip(begin.max(0) as usize)
        .take(count as usize)
        .collect();
    Value::Str(SmolStr::new(out))
}

#[cfg(test)]
mod scalar_tests {
    use super::*;
    use crate::engine::types::Row;

    fn ctx_row() -> Row {
        Row::new()
    }

    #[test]
    fn coalesce_picks_first_non_null() {
        let row = ctx_row();
        let ctx = EvalCtx::new(&row);
        let v = call("COALESCE", &[Value::Null, Value::Int(2), Value::Int(3)], &ctx);
        assert_eq!(v, Value::Int(2));
    }

    #[test]
    fn substr_negative_start() {
        let row = ctx_row();
        let ctx = EvalCtx::new(&row);
        let v = call(
            "SUBSTR",
            &[Value::from("streaming"), Value::Int(-3), Value::Int(3)],
            &ctx,
        );
        assert_eq!(v, Value::from("ing"));
    }

    #[test]
    fn unknown_function_yields_null() {
        let row = ctx_row();
        let ctx = EvalCtx::new(&row);
        assert!(call("NO_SUCH_FN", &[Value::Int(1)], &ctx).is_null());
    }
}
