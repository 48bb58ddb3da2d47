//! Filter evaluation.
//!
//! Filters are conjunctive. A `Missing` resolution, an empty sequence or a
//! type-incompatible comparison fails the filter without raising.

use std::cmp::Ordering;

use crate::query::{Filter, FilterOp};

use super::resolve::{Env, Resolver};
use super::value::Value;

/// Evaluate one filter against one environment.
pub fn apply<'g>(resolver: &Resolver<'g>, filter: &Filter, env: &Env<'g>) -> bool {
    matches(&filter.op, &resolver.resolve(env, &filter.field))
}

/// Evaluate every filter; all must hold.
pub fn apply_all<'g>(resolver: &Resolver<'g>, filters: &[Filter], env: &Env<'g>) -> bool {
    filters.iter().all(|f| apply(resolver, f, env))
}

/// Test a resolved value against an operator.
///
/// A sequence passes when any element does, except for `ne`, which needs
/// every element to differ.
pub fn matches(op: &FilterOp, value: &Value) -> bool {
    match value {
        Value::Missing => false,
        Value::List(_) => {
            let leaves = value.flatten();
            if leaves.is_empty() {
                return false;
            }
            match op {
                FilterOp::Ne(_) => leaves.iter().all(|v| test(op, v)),
                _ => leaves.iter().any(|v| test(op, v)),
            }
        }
        v => test(op, v),
    }
}

fn test(op: &FilterOp, v: &Value) -> bool {
    match op {
        FilterOp::Eq(Value::Null) => matches!(v, Value::Null),
        FilterOp::Ne(Value::Null) => !v.is_absent(),
        FilterOp::Eq(lit) => v.loose_eq(lit) == Some(true),
        FilterOp::Ne(lit) => v.loose_eq(lit) == Some(false),
        FilterOp::Gt(lit) => v.compare(lit) == Some(Ordering::Greater),
        FilterOp::Gte(lit) => matches!(v.compare(lit), Some(Ordering::Greater | Ordering::Equal)),
        FilterOp::Lt(lit) => v.compare(lit) == Some(Ordering::Less),
        FilterOp::Lte(lit) => matches!(v.compare(lit), Some(Ordering::Less | Ordering::Equal)),
        FilterOp::In(lits) => lits.iter().any(|lit| test(&FilterOp::Eq(lit.clone()), v)),
        FilterOp::Contains(needle) => v.as_str().is_some_and(|s| s.to_lowercase().contains(needle.as_str())),
        FilterOp::Regex(re) => v.as_str().is_some_and(|s| re.is_match(s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse::compile_regex;

    #[test]
    fn missing_fails_every_operator() {
        let ops = [
            FilterOp::Eq(Value::from("x")),
            FilterOp::Ne(Value::from("x")),
            FilterOp::Ne(Value::Null),
            FilterOp::Gt(Value::Int(0)),
            FilterOp::In(vec![Value::from("x")]),
            FilterOp::Contains("x".into()),
            FilterOp::Regex(compile_regex(".*").unwrap()),
        ];
        for op in &ops {
            assert!(!matches(op, &Value::Missing), "{} passed on Missing", op.name());
        }
    }

    #[test]
    fn string_equality_is_case_insensitive() {
        assert!(matches(&FilterOp::Eq("Breast Cancer".into()), &"breast cancer".into()));
        assert!(matches(&FilterOp::In(vec!["RCT".into(), "cohort".into()]), &"rct".into()));
        assert!(!matches(&FilterOp::Ne("TREATS".into()), &"treats".into()));
    }

    #[test]
    fn numeric_comparisons() {
        assert!(matches(&FilterOp::Gte(Value::Float(0.7)), &Value::Float(0.89)));
        assert!(!matches(&FilterOp::Gt(Value::Int(1)), &Value::Int(1)));
        assert!(matches(&FilterOp::Lte(Value::Int(1)), &Value::Float(1.0)));
    }

    #[test]
    fn incomparable_types_fail() {
        assert!(!matches(&FilterOp::Gt(Value::Int(1)), &"2".into()));
        assert!(!matches(&FilterOp::Ne(Value::Int(1)), &"2".into()));
    }

    #[test]
    fn regex_on_non_string_is_false() {
        let re = compile_regex("^0\\.8").unwrap();
        assert!(!matches(&FilterOp::Regex(re.clone()), &Value::Float(0.89)));
        assert!(!matches(&FilterOp::Regex(re.clone()), &Value::Bool(true)));
        assert!(matches(&FilterOp::Regex(re), &"0.89".into()));
    }

    #[test]
    fn regex_is_case_insensitive_search() {
        let re = compile_regex("brca").unwrap();
        assert!(matches(&FilterOp::Regex(re), &"Hereditary BRCA1 carrier".into()));
    }

    #[test]
    fn contains_ignores_case() {
        assert!(matches(&FilterOp::Contains("cancer".into()), &"Breast CANCER".into()));
        assert!(!matches(&FilterOp::Contains("cancer".into()), &Value::Int(3)));
    }

    #[test]
    fn sequences_match_any_element() {
        let seq = Value::List(vec!["cohort".into(), "rct".into()]);
        assert!(matches(&FilterOp::Eq("rct".into()), &seq));
        assert!(!matches(&FilterOp::Ne("rct".into()), &seq));
        assert!(matches(&FilterOp::Ne("review".into()), &seq));
        assert!(!matches(&FilterOp::Eq("rct".into()), &Value::List(vec![])));
    }

    #[test]
    fn null_literals() {
        assert!(matches(&FilterOp::Eq(Value::Null), &Value::Null));
        assert!(matches(&FilterOp::Ne(Value::Null), &"x".into()));
        assert!(!matches(&FilterOp::Eq(Value::Null), &"x".into()));
    }

    #[test]
    fn date_comparison_with_text_literal() {
        let d = Value::Date(chrono::NaiveDate::from_ymd_opt(2022, 1, 10).unwrap());
        assert!(matches(&FilterOp::Gte("2021-06-01".into()), &d));
        assert!(!matches(&FilterOp::Lt("2021-06-01".into()), &d));
    }
}
