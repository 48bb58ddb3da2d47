//! Aggregation engine.
//!
//! Groups binding environments by the resolved `group_by` tuple, in order of
//! first occurrence, and folds each group with the named aggregations.
//! Sequence-valued resolutions are flattened before folding. Items that are
//! absent or of the wrong type are skipped rather than reported.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::query::{AggFn, AggregateSpec, Aggregation};

use super::assemble::Row;
use super::resolve::{Env, Resolver};
use super::value::Value;

struct Group<'e, 'g> {
    keys: Vec<Value>,
    members: Vec<&'e Env<'g>>,
}

/// Aggregate `envs` into one row per group.
///
/// With no `group_by` fields the whole input is one group, and a row is
/// produced even when `envs` is empty (`count` = 0).
pub fn aggregate<'g>(resolver: &Resolver<'g>, envs: &[Env<'g>], spec: &AggregateSpec) -> Vec<Row> {
    let mut groups: Vec<Group<'_, 'g>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    if spec.group_by.is_empty() {
        groups.push(Group {
            keys: Vec::new(),
            members: envs.iter().collect(),
        });
    } else {
        for env in envs {
            let keys: Vec<Value> = spec.group_by.iter().map(|f| resolver.resolve(env, f)).collect();
            let key = keys.iter().map(Value::group_key).collect::<Vec<_>>().join("\u{1f}");
            match index.get(&key) {
                Some(&i) => groups[i].members.push(env),
                None => {
                    index.insert(key, groups.len());
                    groups.push(Group {
                        keys,
                        members: vec![env],
                    });
                }
            }
        }
    }

    let rows: Vec<Row> = groups
        .into_iter()
        .map(|group| {
            let mut row = Row::default();
            for (field, value) in spec.group_by.iter().zip(group.keys) {
                row.push(field.as_str(), value);
            }
            for agg in &spec.aggregations {
                row.push(&agg.name, fold(resolver, agg, &group.members));
            }
            row
        })
        .collect();
    tracing::debug!(groups = rows.len(), bindings = envs.len(), "aggregated");
    rows
}

fn fold<'g>(resolver: &Resolver<'g>, agg: &Aggregation, members: &[&Env<'g>]) -> Value {
    let Some(field) = &agg.field else {
        return Value::Int(members.len() as i64);
    };
    let resolved: Vec<Value> = members.iter().map(|env| resolver.resolve(env, field)).collect();
    let leaves: Vec<&Value> = resolved
        .iter()
        .flat_map(Value::flatten)
        .filter(|v| !v.is_absent())
        .collect();

    match agg.function {
        AggFn::Count => Value::Int(leaves.len() as i64),
        AggFn::CountDistinct => {
            let distinct: HashSet<String> = leaves.iter().map(|v| v.group_key()).collect();
            Value::Int(distinct.len() as i64)
        }
        AggFn::Sum => sum(&leaves),
        AggFn::Avg => {
            let nums: Vec<f64> = leaves.iter().filter_map(|v| v.as_f64()).collect();
            if nums.is_empty() {
                Value::Null
            } else {
                Value::Float(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        AggFn::Min => extreme(&leaves, Ordering::Less),
        AggFn::Max => extreme(&leaves, Ordering::Greater),
    }
}

/// Integer sum while every operand is an integer, float otherwise.
fn sum(leaves: &[&Value]) -> Value {
    let mut int_total: i64 = 0;
    let mut float_total = 0.0;
    let mut all_int = true;
    for v in leaves {
        match v {
            Value::Int(i) => {
                int_total = int_total.saturating_add(*i);
                float_total += *i as f64;
            }
            Value::Float(f) => {
                all_int = false;
                float_total += f;
            }
            _ => {}
        }
    }
    if all_int {
        Value::Int(int_total)
    } else {
        Value::Float(float_total)
    }
}

/// Smallest (`Less`) or largest (`Greater`) value among the leaves sharing the
/// first leaf's kind.
fn extreme(leaves: &[&Value], want: Ordering) -> Value {
    let Some(first) = leaves.first() else {
        return Value::Null;
    };
    let kind = first.kind();
    let mut best = *first;
    for v in leaves.iter().filter(|v| v.kind() == kind) {
        if v.compare(best) == Some(want) {
            best = *v;
        }
    }
    best.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::resolve::Bound;
    use crate::graph::{Edge, EdgeLayer, EvidenceItem, GraphSnapshot, Node, NodeType, SnapshotDocument, StudyType};
    use crate::query::FieldPath;
    use chrono::NaiveDate;

    fn claim(id: &str, s: &str, o: &str, papers: &[(&str, StudyType, u64)]) -> Edge {
        let mut edge = Edge::new(
            id,
            s,
            "treats",
            o,
            EdgeLayer::Extraction {
                extractor_name: "test".into(),
                extraction_confidence: 0.9,
            },
        );
        for &(paper, st, n) in papers {
            let mut item = EvidenceItem::paper(paper, st);
            item.sample_size = Some(n);
            edge = edge.with_evidence(item);
        }
        edge
    }

    fn snapshot() -> GraphSnapshot {
        GraphSnapshot::build(SnapshotDocument {
            nodes: vec![
                Node::new("D1", NodeType::Drug, "tamoxifen"),
                Node::new("D2", NodeType::Drug, "trastuzumab"),
                Node::new("X1", NodeType::Disease, "breast cancer"),
                Node::new("X2", NodeType::Disease, "ovarian cancer"),
            ],
            edges: vec![
                claim(
                    "e1",
                    "D1",
                    "X1",
                    &[("P1", StudyType::Rct, 100), ("P2", StudyType::Cohort, 50), ("P3", StudyType::Rct, 10)],
                ),
                claim("e2", "D2", "X1", &[("P4", StudyType::Rct, 400)]),
                claim("e3", "D1", "X2", &[("P1", StudyType::Rct, 100)]),
            ],
        })
        .unwrap()
    }

    fn envs(snap: &GraphSnapshot) -> Vec<Env<'_>> {
        snap.edges()
            .map(|e| {
                Env::new()
                    .bind("t", Bound::Edge(e))
                    .bind("drug", Bound::Node(snap.get_node(&e.subject_id).unwrap()))
            })
            .collect()
    }

    fn agg(name: &str, function: AggFn, field: Option<&str>) -> Aggregation {
        Aggregation {
            name: name.into(),
            function,
            field: field.map(|f| FieldPath::parse(f).unwrap()),
        }
    }

    #[test]
    fn groups_in_first_seen_order() {
        let snap = snapshot();
        let spec = AggregateSpec {
            group_by: vec![FieldPath::parse("drug.name").unwrap()],
            aggregations: vec![
                agg("papers", AggFn::Count, Some("t.evidence.paper_id")),
                agg("distinct_papers", AggFn::CountDistinct, Some("t.evidence.paper_id")),
                agg("rows", AggFn::Count, None),
            ],
        };
        let rows = aggregate(&Resolver::new(&snap), &envs(&snap), &spec);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("drug.name"), Some(&Value::from("tamoxifen")));
        assert_eq!(rows[0].get("papers"), Some(&Value::Int(4)));
        assert_eq!(rows[0].get("distinct_papers"), Some(&Value::Int(3)));
        assert_eq!(rows[0].get("rows"), Some(&Value::Int(2)));
        assert_eq!(rows[1].get("papers"), Some(&Value::Int(1)));
    }

    #[test]
    fn numeric_folds() {
        let snap = snapshot();
        let spec = AggregateSpec {
            group_by: vec![],
            aggregations: vec![
                agg("n", AggFn::Sum, Some("t.evidence.sample_size")),
                agg("mean", AggFn::Avg, Some("t.confidence")),
                agg("smallest", AggFn::Min, Some("t.evidence.sample_size")),
                agg("largest", AggFn::Max, Some("t.evidence.sample_size")),
                agg("nothing", AggFn::Avg, Some("t.evidence.measurement.value")),
            ],
        };
        let rows = aggregate(&Resolver::new(&snap), &envs(&snap), &spec);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("n"), Some(&Value::Int(660)));
        assert_eq!(rows[0].get("smallest"), Some(&Value::Int(10)));
        assert_eq!(rows[0].get("largest"), Some(&Value::Int(400)));
        assert_eq!(rows[0].get("nothing"), Some(&Value::Null));
        assert!(matches!(rows[0].get("mean"), Some(Value::Float(_))));
    }

    #[test]
    fn sum_skips_non_numeric() {
        let snap = snapshot();
        let spec = AggregateSpec {
            group_by: vec![],
            aggregations: vec![agg("s", AggFn::Sum, Some("t.evidence.study_type"))],
        };
        let rows = aggregate(&Resolver::new(&snap), &envs(&snap), &spec);
        assert_eq!(rows[0].get("s"), Some(&Value::Int(0)));
    }

    #[test]
    fn min_max_over_strings() {
        let snap = snapshot();
        let spec = AggregateSpec {
            group_by: vec![],
            aggregations: vec![
                agg("first", AggFn::Min, Some("drug.name")),
                agg("last", AggFn::Max, Some("drug.name")),
            ],
        };
        let rows = aggregate(&Resolver::new(&snap), &envs(&snap), &spec);
        assert_eq!(rows[0].get("first"), Some(&Value::from("tamoxifen")));
        assert_eq!(rows[0].get("last"), Some(&Value::from("trastuzumab")));
    }

    #[test]
    fn min_max_over_publication_dates() {
        let dated = |paper: &str, date: Option<NaiveDate>| EvidenceItem {
            paper_publication_date: date,
            ..EvidenceItem::paper(paper, StudyType::Cohort)
        };
        let snap = GraphSnapshot::build(SnapshotDocument {
            nodes: vec![
                Node::new("D1", NodeType::Drug, "metformin"),
                Node::new("X1", NodeType::Disease, "type 2 diabetes"),
            ],
            edges: vec![
                claim("e1", "D1", "X1", &[])
                    .with_evidence(dated("P1", NaiveDate::from_ymd_opt(2015, 6, 30)))
                    .with_evidence(dated("P2", NaiveDate::from_ymd_opt(2021, 3, 1)))
                    .with_evidence(dated("P3", None))
                    .with_evidence(dated("P4", NaiveDate::from_ymd_opt(2009, 11, 20))),
            ],
        })
        .unwrap();
        let spec = AggregateSpec {
            group_by: vec![],
            aggregations: vec![
                agg("earliest", AggFn::Min, Some("t.evidence.paper_publication_date")),
                agg("latest", AggFn::Max, Some("t.evidence.paper_publication_date")),
                agg("dated", AggFn::Count, Some("t.evidence.paper_publication_date")),
            ],
        };
        let rows = aggregate(&Resolver::new(&snap), &envs(&snap), &spec);
        assert_eq!(rows[0].get("earliest"), NaiveDate::from_ymd_opt(2009, 11, 20).map(Value::Date).as_ref());
        assert_eq!(rows[0].get("latest"), NaiveDate::from_ymd_opt(2021, 3, 1).map(Value::Date).as_ref());
        assert_eq!(rows[0].get("dated"), Some(&Value::Int(3)));
    }

    #[test]
    fn empty_input_without_grouping_yields_one_row() {
        let snap = snapshot();
        let spec = AggregateSpec {
            group_by: vec![],
            aggregations: vec![agg("c", AggFn::Count, None)],
        };
        let rows = aggregate(&Resolver::new(&snap), &[], &spec);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("c"), Some(&Value::Int(0)));

        let grouped = AggregateSpec {
            group_by: vec![FieldPath::parse("drug.name").unwrap()],
            aggregations: vec![agg("c", AggFn::Count, None)],
        };
        assert!(aggregate(&Resolver::new(&snap), &[], &grouped).is_empty());
    }
}
