//! Runtime values produced by field resolution.
//!
//! `Missing` is a first-class variant: an unbound root or an absent tail
//! resolves to it, and every filter operator treats it as unsatisfied.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Value as JsonValue, json};

use crate::graph::Scalar;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Missing,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    /// Sequence-valued resolution (e.g. `rel.evidence.paper_id`).
    List(Vec<Value>),
    /// A whole node, edge or evidence item, rendered as JSON.
    Record(JsonValue),
}

/// Coarse type class used by `min`/`max` and incomparability checks. The
/// declaration order ranks mixed kinds when sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Kind {
    Missing,
    Null,
    Bool,
    Number,
    Text,
    Date,
    Timestamp,
    List,
    Record,
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Missing => Kind::Missing,
            Value::Null => Kind::Null,
            Value::Bool(_) => Kind::Bool,
            Value::Int(_) | Value::Float(_) => Kind::Number,
            Value::Text(_) => Kind::Text,
            Value::Date(_) => Kind::Date,
            Value::Timestamp(_) => Kind::Timestamp,
            Value::List(_) => Kind::List,
            Value::Record(_) => Kind::Record,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    /// Missing or null.
    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Missing | Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a JSON literal from a query document.
    pub fn from_json(value: &JsonValue) -> Value {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Value::Text(s.clone()),
            JsonValue::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(_) => Value::Record(value.clone()),
        }
    }

    /// Render for the response body. `Missing` becomes `null`.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Missing | Value::Null => JsonValue::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Float(f) => json!(f),
            Value::Text(s) => json!(s),
            Value::Date(d) => json!(d.format("%Y-%m-%d").to_string()),
            Value::Timestamp(t) => json!(t.to_rfc3339()),
            Value::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Record(v) => v.clone(),
        }
    }

    /// Stable textual key for grouping and deduplication.
    pub fn group_key(&self) -> String {
        match self {
            Value::Missing => "\u{0}missing".to_string(),
            other => other.to_json().to_string(),
        }
    }

    /// Iterate the leaves of a possibly nested sequence.
    pub fn flatten(&self) -> Vec<&Value> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(v) = stack.pop() {
            match v {
                Value::List(items) => stack.extend(items.iter().rev()),
                other => out.push(other),
            }
        }
        out
    }

    /// Natural-order comparison: numbers numerically, strings
    /// lexicographically, dates chronologically. A text operand is coerced
    /// to a date when compared against one. `None` when incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (a, b) if a.kind() == Kind::Number && b.kind() == Kind::Number => {
                a.as_f64()?.partial_cmp(&b.as_f64()?)
            }
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Text(s)) => Some(a.cmp(&parse_date(s)?)),
            (Value::Text(s), Value::Date(b)) => Some(parse_date(s)?.cmp(b)),
            (Value::Timestamp(a), Value::Text(s)) => Some(a.cmp(&parse_timestamp(s)?)),
            (Value::Text(s), Value::Timestamp(b)) => Some(parse_timestamp(s)?.cmp(b)),
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }

    /// Total order for sorting. Same-kind values use their natural order;
    /// values of different kinds rank by [`Kind`]. Text is never coerced to
    /// a date here, so the order stays transitive.
    pub fn total_order(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => a
                .iter()
                .zip(b)
                .map(|(x, y)| x.total_order(y))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            (Value::Record(a), Value::Record(b)) => a.to_string().cmp(&b.to_string()),
            (a, b) if a.kind() == Kind::Number && b.kind() == Kind::Number => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => Ordering::Equal,
            },
            (a, b) => a.kind().cmp(&b.kind()),
        }
    }

    /// Equality used by `eq`/`ne`/`in`: strings compare case-insensitively,
    /// everything else by [`Value::compare`].
    pub fn loose_eq(&self, other: &Value) -> Option<bool> {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => Some(a.eq_ignore_ascii_case(b)),
            (Value::Record(a), Value::Record(b)) => Some(a == b),
            _ => self.compare(other).map(|o| o == Ordering::Equal),
        }
    }
}

impl From<&Scalar> for Value {
    fn from(s: &Scalar) -> Self {
        match s {
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::Int(*i),
            Scalar::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => Value::Int(*n as i64),
            Scalar::Number(n) => Value::Float(*n),
            Scalar::Text(t) => Value::Text(t.clone()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    parse_date(s)?.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_compare_across_int_and_float() {
        assert_eq!(Value::Int(3).compare(&Value::Float(2.5)), Some(Ordering::Greater));
        assert_eq!(Value::Float(1.0).loose_eq(&Value::Int(1)), Some(true));
    }

    #[test]
    fn text_equality_ignores_case() {
        assert_eq!(Value::from("Breast Cancer").loose_eq(&"breast cancer".into()), Some(true));
        assert_eq!(
            Value::from("a").compare(&Value::from("B")),
            Some(Ordering::Greater),
            "ordering stays byte-wise"
        );
    }

    #[test]
    fn dates_coerce_text_literals() {
        let d = Value::Date(NaiveDate::from_ymd_opt(2021, 3, 1).unwrap());
        assert_eq!(d.compare(&"2020-12-31".into()), Some(Ordering::Greater));
        assert_eq!(d.compare(&"not a date".into()), None);
    }

    #[test]
    fn whole_number_properties_are_integers() {
        assert_eq!(Value::from(&Scalar::Number(3.0)), Value::Int(3));
        assert_eq!(Value::from(&Scalar::Int(3)).group_key(), Value::Int(3).group_key());
        assert_eq!(Value::from(&Scalar::Number(2.5)), Value::Float(2.5));

        let parsed: Scalar = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, Scalar::Int(3));
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "3");
    }

    #[test]
    fn total_order_ranks_mixed_kinds() {
        let mut values = vec![
            Value::from("b"),
            Value::Int(2),
            Value::List(vec![Value::Int(1)]),
            Value::Float(1.5),
            Value::from("a"),
            Value::Bool(true),
        ];
        values.sort_by(|a, b| a.total_order(b));
        assert_eq!(
            values,
            vec![
                Value::Bool(true),
                Value::Float(1.5),
                Value::Int(2),
                Value::from("a"),
                Value::from("b"),
                Value::List(vec![Value::Int(1)]),
            ]
        );
        assert_eq!(Value::Int(1).total_order(&Value::from("1")), Ordering::Less);
        assert_eq!(Value::from("1").total_order(&Value::Int(1)), Ordering::Greater);
    }

    #[test]
    fn incomparable_kinds() {
        assert_eq!(Value::Int(1).compare(&Value::from("1")), None);
        assert_eq!(Value::Missing.compare(&Value::Missing), None);
    }

    #[test]
    fn flatten_nested_lists() {
        let v = Value::List(vec![
            Value::Int(1),
            Value::List(vec![Value::Int(2), Value::Int(3)]),
        ]);
        let leaves: Vec<_> = v.flatten().into_iter().cloned().collect();
        assert_eq!(leaves, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn integral_json_stays_integral() {
        assert_eq!(Value::from_json(&json!(3)), Value::Int(3));
        assert_eq!(Value::Int(3).to_json(), json!(3));
        assert_eq!(Value::Missing.to_json(), JsonValue::Null);
    }
}
