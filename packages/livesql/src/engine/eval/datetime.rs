//! SQLite-compatible date and time functions, backed by chrono. All
//! computation is UTC-naive; values travel as ISO-8601 text, julian day
//! numbers, or (with the `unixepoch` modifier) epoch seconds.

use super::EvalCtx;
use crate::engine::types::Value;
use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, Timelike, Utc};
use smol_str::SmolStr;

const JULIAN_UNIX_OFFSET: f64 = 2440587.5;
const SECS_PER_DAY: f64 = 86_400.0;

pub fn date(args: &[Value], ctx: &EvalCtx<'_>) -> Value {
    match resolve(args, ctx) {
        Some(dt) => Value::Str(SmolStr::new(dt.format("%Y-%m-%d").to_string())),
        None => Value::Null,
    }
}

pub fn time(args: &[Value], ctx: &EvalCtx<'_>) -> Value {
    match resolve(args, ctx) {
        Some(dt) => Value::Str(SmolStr::new(dt.format("%H:%M:%S").to_string())),
        None => Value::Null,
    }
}

pub fn datetime(args: &[Value], ctx: &EvalCtx<'_>) -> Value {
    match resolve(args, ctx) {
        Some(dt) => Value::Str(SmolStr::new(dt.format("%Y-%m-%d %H:%M:%S").to_string())),
        None => Value::Null,
    }
}

pub fn julianday(args: &[Value], ctx: &EvalCtx<'_>) -> Value {
    match resolve(args, ctx) {
        Some(dt) => Value::Float(to_julian(&dt)),
        None => Value::Null,
    }
}

pub fn unixepoch(args: &[Value], ctx: &EvalCtx<'_>) -> Value {
    match resolve(args, ctx) {
        Some(dt) => Value::Int(dt.and_utc().timestamp()),
        None => Value::Null,
    }
}

/// `STRFTIME(format, timevalue, modifier...)`.
pub fn strftime(args: &[Value], ctx: &EvalCtx<'_>) -> Value {
    let fmt = match args.first() {
        Some(Value::Str(s)) => s.as_str(),
        _ => return Value::Null,
    };
    let dt = match resolve(&args[1..], ctx) {
        Some(dt) => dt,
        None => return Value::Null,
    };
    let mut out = String::with_capacity(fmt.len() + 8);
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&format!("{:04}", dt.year())),
            Some('m') => out.push_str(&format!("{:02}", dt.month())),
            Some('d') => out.push_str(&format!("{:02}", dt.day())),
            Some('e') => out.push_str(&format!("{:2}", dt.day())),
            Some('H') => out.push_str(&format!("{:02}", dt.hour())),
            Some('M') => out.push_str(&format!("{:02}", dt.minute())),
            Some('S') => out.push_str(&format!("{:02}", dt.second())),
            Some('f') => out.push_str(&format!(
                "{:02}.{:03}",
                dt.second(),
                dt.and_utc().timestamp_subsec_millis()
            )),
            Some('j') => out.push_str(&format!("{:03}", dt.ordinal())),
            Some('w') => out.push_str(&dt.weekday().num_days_from_sunday().to_string()),
            Some('s') => out.push_str(&dt.and_utc().timestamp().to_string()),
            Some('J') => out.push_str(&to_julian(&dt).to_string()),
            Some('%') => out.push('%'),
            Some(other) => {
                ctx.fault(&format!("unsupported strftime directive %{other}"));
                return Value::Null;
            }
            None => break,
        }
    }
    Value::Str(SmolStr::new(out))
}

fn to_julian(dt: &NaiveDateTime) -> f64 {
    dt.and_utc().timestamp_millis() as f64 / 1000.0 / SECS_PER_DAY + JULIAN_UNIX_OFFSET
}

fn from_julian(jd: f64) -> Option<NaiveDateTime> {
    let secs = (jd - JULIAN_UNIX_OFFSET) * SECS_PER_DAY;
    chrono::DateTime::from_timestamp(secs as i64, 0).map(|dt| dt.naive_utc())
}

/// First argument is the time value (missing means `now`), the rest are
/// modifiers applied left to right.
fn resolve(args: &[Value], ctx: &EvalCtx<'_>) -> Option<NaiveDateTime> {
    let use_unixepoch = args
        .iter()
        .skip(1)
        .any(|m| m.as_str().is_some_and(|s| s.eq_ignore_ascii_case("unixepoch")));

    let mut dt = match args.first() {
        None | Some(Value::Null) => Some(Utc::now().naive_utc()),
        Some(Value::Str(s)) if s.eq_ignore_ascii_case("now") => Some(Utc::now().naive_utc()),
        Some(Value::Str(s)) => parse_text(s.as_str()),
        Some(v) if v.is_numeric() => {
            let n = v.as_f64()?;
            if use_unixepoch {
                chrono::DateTime::from_timestamp(n as i64, 0).map(|d| d.naive_utc())
            } else {
                from_julian(n)
            }
        }
        Some(_) => None,
    }?;

    for modifier in args.iter().skip(1) {
        let m = match modifier.as_str() {
            Some(m) => m.trim(),
            None => continue,
        };
        if m.eq_ignore_ascii_case("unixepoch") {
            continue;
        }
        dt = match apply_modifier(dt, m) {
            Some(next) => next,
            None => {
                ctx.fault(&format!("unsupported time modifier '{m}'"));
                return None;
            }
        };
    }
    Some(dt)
}

fn parse_text(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0);
    }
    None
}

fn apply_modifier(dt: NaiveDateTime, m: &str) -> Option<NaiveDateTime> {
    let lower = m.to_ascii_lowercase();
    if let Some(unit) = lower.strip_prefix("start of ") {
        return match unit.trim() {
            "day" => dt.date().and_hms_opt(0, 0, 0),
            "month" => dt.date().with_day(1)?.and_hms_opt(0, 0, 0),
            "year" => dt.date().with_day(1)?.with_month(1)?.and_hms_opt(0, 0, 0),
            _ => None,
        };
    }

    let mut parts = lower.split_whitespace();
    let amount: f64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?;
    let n = amount as i64;
    match unit.trim_end_matches('s') {
        "day" => Some(dt + Duration::days(n)),
        "hour" => Some(dt + Duration::hours(n)),
        "minute" => Some(dt + Duration::minutes(n)),
        "second" => Some(dt + Duration::seconds(n)),
        "month" => {
            if n >= 0 {
                dt.checked_add_months(Months::new(n as u32))
            } else {
                dt.checked_sub_months(Months::new((-n) as u32))
            }
        }
        "year" => {
            let months = n * 12;
            if months >= 0 {
                dt.checked_add_months(Months::new(months as u32))
            } else {
                dt.checked_sub_months(Months::new((-months) as u32))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod datetime_tests {
    use super::*;
    use crate::engine::types::Row;

    #[test]
    fn date_from_text_and_modifier() {
        let row = Row::new();
        let ctx = EvalCtx::new(&row);
        let v = date(
            &[Value::from("2024-03-15 10:30:00"), Value::from("+1 day")],
            &ctx,
        );
        assert_eq!(v, Value::from("2024-03-16"));
    }

    #[test]
    fn strftime_epoch() {
        let row = Row::new();
        let ctx = EvalCtx::new(&row);
        let v = strftime(
            &[
                Value::from("%s"),
                Value::Int(0),
                Value::from("unixepoch"),
            ],
            &ctx,
        );
        assert_eq!(v, Value::from("0"));
    }

    #[test]
    fn julianday_unix_origin() {
        let row = Row::new();
        let ctx = EvalCtx::new(&row);
        let v = julianday(&[Value::from("1970-01-01")], &ctx);
        match v {
            Value::Float(f) => assert!((f - 2440587.5).abs() < 1e-6),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn start_of_month() {
        let row = Row::new();
        let ctx = EvalCtx::new(&row);
        let v = date(
            &[Value::from("2024-03-15"), Value::from("start of month")],
            &ctx,
        );
        assert_eq!(v, Value::from("2024-03-01"));
    }
}
