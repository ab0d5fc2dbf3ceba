//! Value coercions shared by the formula interpreter and rollups.
//!
//! Empty coerces to the neutral value of every kind: `0`, `""`, `false`.
//! Text coerces to a number only when it parses as one.

use chrono::NaiveDate;
use fieldcalc_common::{EvalError, EvalErrorKind, ResultKind, Value};

fn value_error(msg: String) -> EvalError {
    EvalError::new(EvalErrorKind::Value).with_message(msg)
}

pub fn to_number(v: &Value) -> Result<f64, EvalError> {
    match v {
        Value::Empty => Ok(0.0),
        Value::Number(n) => Ok(*n),
        Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Text(s) if s.trim().is_empty() => Ok(0.0),
        Value::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| value_error(format!("cannot use text {s:?} as a number"))),
        other => Err(value_error(format!(
            "cannot use a {} value as a number",
            other.type_name()
        ))),
    }
}

pub fn to_text(v: &Value) -> String {
    v.to_text()
}

pub fn to_bool(v: &Value) -> Result<bool, EvalError> {
    match v {
        Value::Empty => Ok(false),
        Value::Boolean(b) => Ok(*b),
        Value::Number(n) => Ok(*n != 0.0),
        Value::Text(s) if s.is_empty() => Ok(false),
        Value::Text(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::Text(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(value_error(format!(
            "cannot use {:?} as a condition",
            other.to_text()
        ))),
    }
}

/// Reject NaN and infinities.
pub fn sanitize_numeric(n: f64) -> Result<f64, EvalError> {
    if n.is_finite() {
        Ok(n)
    } else {
        Err(EvalError::new(EvalErrorKind::Num).with_message("result is not a finite number"))
    }
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Coerce a formula's computed value to its declared result kind.
///
/// Empty stays empty for every kind. Anything renders as text; the other
/// kinds only accept values that convert without guessing.
pub fn coerce_result(v: Value, kind: ResultKind) -> Result<Value, EvalError> {
    if matches!(v, Value::Empty) {
        return Ok(Value::Empty);
    }
    let mismatch = |v: &Value| {
        value_error(format!(
            "a {} result cannot be stored in a {kind} field",
            v.type_name()
        ))
    };
    match kind {
        ResultKind::Text => Ok(Value::Text(v.to_text())),
        ResultKind::Number => match v {
            Value::Number(n) => sanitize_numeric(n).map(Value::Number),
            Value::Boolean(b) => Ok(Value::Number(if b { 1.0 } else { 0.0 })),
            other => Err(mismatch(&other)),
        },
        ResultKind::Boolean => match v {
            Value::Boolean(b) => Ok(Value::Boolean(b)),
            Value::Number(n) => Ok(Value::Boolean(n != 0.0)),
            other => Err(mismatch(&other)),
        },
        ResultKind::Date => match v {
            Value::Date(d) => Ok(Value::Date(d)),
            Value::Text(ref s) => parse_date(s).map(Value::Date).ok_or_else(|| mismatch(&v)),
            other => Err(mismatch(&other)),
        },
    }
}
