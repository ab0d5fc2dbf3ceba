use chrono::NaiveDate;
use std::fmt::{self, Display};

use crate::RecordId;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A field value as stored in a record's value map.
///
/// `Empty` is the null value: a missing plain value, an empty aggregate, or
/// the materialized value of a unit whose evaluation failed.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Empty,
    Number(f64),
    Text(String),
    Boolean(bool),
    Date(NaiveDate),
    /// Value of a relation field: ordered target record ids.
    Links(Vec<RecordId>),
    /// Value of a lookup field: one entry per relation target, in relation order.
    List(Vec<Value>),
}

impl Value {
    pub fn text<S: Into<String>>(s: S) -> Self {
        Value::Text(s.into())
    }

    pub fn links<I: IntoIterator<Item = u64>>(ids: I) -> Self {
        Value::Links(ids.into_iter().map(RecordId).collect())
    }

    /// Empty values are what `COUNTA` skips: null, `""`, and empty collections.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Empty => true,
            Value::Text(s) => s.is_empty(),
            Value::Links(ids) => ids.is_empty(),
            Value::List(items) => items.is_empty(),
            Value::Number(_) | Value::Boolean(_) | Value::Date(_) => false,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_links(&self) -> Option<&[RecordId]> {
        match self {
            Value::Links(ids) => Some(ids),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Empty => "empty",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::Boolean(_) => "boolean",
            Value::Date(_) => "date",
            Value::Links(_) => "links",
            Value::List(_) => "list",
        }
    }

    /// Render the value the way text operations see it.
    pub fn to_text(&self) -> String {
        match self {
            Value::Empty => String::new(),
            Value::Number(n) => format_number(*n),
            Value::Text(s) => s.clone(),
            Value::Boolean(true) => "TRUE".to_string(),
            Value::Boolean(false) => "FALSE".to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Links(ids) => ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            Value::List(items) => items
                .iter()
                .filter(|v| !v.is_empty())
                .map(Value::to_text)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            other => write!(f, "{}", other.to_text()),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

/// Integral numbers render without a fractional part.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Declared result kind of a formula field.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResultKind {
    Text,
    Number,
    Date,
    Boolean,
}

impl Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResultKind::Text => "text",
            ResultKind::Number => "number",
            ResultKind::Date => "date",
            ResultKind::Boolean => "boolean",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emptiness_covers_collections() {
        assert!(Value::Empty.is_empty());
        assert!(Value::text("").is_empty());
        assert!(Value::Links(vec![]).is_empty());
        assert!(Value::List(vec![]).is_empty());
        assert!(!Value::Number(0.0).is_empty());
        assert!(!Value::Boolean(false).is_empty());
    }

    #[test]
    fn text_rendering() {
        assert_eq!(Value::Number(3.0).to_text(), "3");
        assert_eq!(Value::Number(2.5).to_text(), "2.5");
        assert_eq!(Value::Boolean(true).to_text(), "TRUE");
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(Value::Date(date).to_text(), "2024-02-29");
        let list = Value::List(vec!["a".into(), Value::Empty, "b".into()]);
        assert_eq!(list.to_text(), "a, b");
    }
}
