//! Field resolution: a small interpreter over pre-parsed [`FieldPath`]s.
//!
//! Resolution walks a set of cursors segment by segment. Stepping into a
//! collection (`evidence`, `synonyms`, `path.nodes`, ...) fans the walk out,
//! and from then on the result is a [`Value::List`] rather than a scalar.
//! Segment predicates (`evidence[study_type='rct']`) prune cursors in place.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Value as JsonValue, json};

use crate::graph::{Edge, EdgeLayer, EvidenceItem, GraphSnapshot, Measurement, Node, Scalar};
use crate::query::field::{Segment, SegmentPredicate};
use crate::query::FieldPath;

use super::value::Value;

/// A concrete path instance bound by the path matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct PathBinding<'g> {
    pub nodes: Vec<&'g Node>,
    pub edges: Vec<&'g Edge>,
}

/// What a pattern variable is bound to.
#[derive(Debug, Clone)]
pub enum Bound<'g> {
    Node(&'g Node),
    Edge(&'g Edge),
    Path(Arc<PathBinding<'g>>),
}

/// One candidate assignment of variables to graph elements. Built by the
/// matcher and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct Env<'g> {
    slots: Vec<(String, Bound<'g>)>,
}

impl<'g> Env<'g> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, name: &str, bound: Bound<'g>) -> Self {
        self.slots.push((name.to_string(), bound));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Bound<'g>> {
        self.slots.iter().find(|(n, _)| n == name).map(|(_, b)| b)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Every edge this environment binds, directly or through a path.
    pub fn edges(&self) -> impl Iterator<Item = &'g Edge> + '_ {
        self.slots.iter().flat_map(|(_, b)| match b {
            Bound::Edge(e) => vec![*e],
            Bound::Path(p) => p.edges.clone(),
            Bound::Node(_) => Vec::new(),
        })
    }
}

#[derive(Debug, Clone)]
enum Cursor<'g> {
    Node(&'g Node),
    Edge(&'g Edge),
    Evidence(&'g EvidenceItem),
    Measurement(&'g Measurement),
    Properties(&'g BTreeMap<String, Scalar>),
    ExternalIds(&'g BTreeMap<String, String>),
    Path(Arc<PathBinding<'g>>),
    Leaf(Value),
}

enum Step<'g> {
    One(Cursor<'g>),
    Many(Vec<Cursor<'g>>),
    Missing,
}

impl<'g> From<&Bound<'g>> for Cursor<'g> {
    fn from(b: &Bound<'g>) -> Self {
        match b {
            Bound::Node(n) => Cursor::Node(*n),
            Bound::Edge(e) => Cursor::Edge(*e),
            Bound::Path(p) => Cursor::Path(Arc::clone(p)),
        }
    }
}

fn leaf(v: Value) -> Step<'static> {
    Step::One(Cursor::Leaf(v))
}

fn text(s: &str) -> Step<'static> {
    leaf(Value::Text(s.to_string()))
}

fn opt_text(s: Option<&str>) -> Step<'static> {
    s.map_or(Step::Missing, text)
}

/// Resolves field paths against environments bound on one snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'g> {
    snapshot: &'g GraphSnapshot,
}

impl<'g> Resolver<'g> {
    pub fn new(snapshot: &'g GraphSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &'g GraphSnapshot {
        self.snapshot
    }

    /// Resolve `path` against `env`. An unbound root yields `Missing`.
    pub fn resolve(&self, env: &Env<'g>, path: &FieldPath) -> Value {
        match env.get(path.root()) {
            Some(bound) => self.walk(Cursor::from(bound), path.segments()),
            None => Value::Missing,
        }
    }

    /// Resolve a root-less path against a single bound element.
    pub fn resolve_on(&self, bound: &Bound<'g>, path: &FieldPath) -> Value {
        self.walk(Cursor::from(bound), path.segments())
    }

    fn walk(&self, start: Cursor<'g>, segments: &[Segment]) -> Value {
        let mut cursors = vec![start];
        let mut fanned = false;

        for segment in segments {
            let mut next = Vec::with_capacity(cursors.len());
            for cursor in cursors {
                match self.step(&cursor, &segment.name) {
                    Step::One(c) => next.push(c),
                    Step::Many(cs) => {
                        fanned = true;
                        next.extend(cs);
                    }
                    Step::Missing => {}
                }
            }
            if let Some(pred) = &segment.predicate {
                next.retain(|c| self.predicate_holds(c, pred));
            }
            cursors = next;
            if cursors.is_empty() {
                break;
            }
        }

        if fanned {
            Value::List(
                cursors
                    .into_iter()
                    .map(|c| self.materialize(c))
                    .filter(|v| !v.is_missing())
                    .collect(),
            )
        } else {
            cursors
                .into_iter()
                .next()
                .map_or(Value::Missing, |c| self.materialize(c))
        }
    }

    fn predicate_holds(&self, cursor: &Cursor<'g>, pred: &SegmentPredicate) -> bool {
        let actual = match self.step(cursor, &pred.key) {
            Step::One(c) => self.materialize(c),
            _ => return false,
        };
        let literal = Value::Text(pred.value.clone());
        if actual.loose_eq(&literal) == Some(true) {
            return true;
        }
        let typed = match pred.value.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            v => match (v.parse::<i64>(), v.parse::<f64>()) {
                (Ok(i), _) => Value::Int(i),
                (_, Ok(f)) => Value::Float(f),
                _ => return false,
            },
        };
        actual.loose_eq(&typed) == Some(true)
    }

    fn step(&self, cursor: &Cursor<'g>, name: &str) -> Step<'g> {
        match cursor {
            Cursor::Node(n) => self.node_step(*n, name),
            Cursor::Edge(e) => self.edge_step(*e, name),
            Cursor::Evidence(item) => evidence_step(*item, name),
            Cursor::Measurement(m) => match name {
                "value" => leaf(Value::Float(m.value)),
                "unit" => opt_text(m.unit.as_deref()),
                "value_type" => opt_text(m.value_type.as_deref()),
                "p_value" => m.p_value.map_or(Step::Missing, |p| leaf(Value::Float(p))),
                _ => Step::Missing,
            },
            Cursor::Properties(props) => props
                .get(name)
                .map_or(Step::Missing, |s| leaf(Value::from(s))),
            Cursor::ExternalIds(ids) => opt_text(ids.get(name).map(String::as_str)),
            Cursor::Path(p) => match name {
                "length" => leaf(Value::Int(p.edges.len() as i64)),
                "nodes" => Step::Many(p.nodes.iter().map(|n| Cursor::Node(*n)).collect()),
                "edges" => Step::Many(p.edges.iter().map(|e| Cursor::Edge(*e)).collect()),
                "node_ids" => Step::Many(p.nodes.iter().map(|n| Cursor::Leaf(n.id.as_str().into())).collect()),
                "node_names" => Step::Many(p.nodes.iter().map(|n| Cursor::Leaf(n.name.as_str().into())).collect()),
                "relation_types" => Step::Many(
                    p.edges
                        .iter()
                        .map(|e| Cursor::Leaf(e.relation_type.as_str().into()))
                        .collect(),
                ),
                "start" => p.nodes.first().map_or(Step::Missing, |n| Step::One(Cursor::Node(*n))),
                "end" => p.nodes.last().map_or(Step::Missing, |n| Step::One(Cursor::Node(*n))),
                _ => Step::Missing,
            },
            Cursor::Leaf(_) => Step::Missing,
        }
    }

    fn node_step(&self, node: &'g Node, name: &str) -> Step<'g> {
        match name {
            "id" => text(&node.id),
            "name" | "name_pattern" => text(&node.name),
            "node_type" | "type" => text(node.node_type.as_str()),
            "synonyms" => Step::Many(node.synonyms.iter().map(|s| Cursor::Leaf(s.as_str().into())).collect()),
            "properties" => Step::One(Cursor::Properties(&node.properties)),
            "external_ids" => Step::One(Cursor::ExternalIds(&node.external_ids)),
            other => node
                .properties
                .get(other)
                .map_or(Step::Missing, |s| leaf(Value::from(s))),
        }
    }

    fn edge_step(&self, edge: &'g Edge, name: &str) -> Step<'g> {
        match name {
            "id" => return text(&edge.id),
            "relation_type" | "type" => return text(&edge.relation_type),
            "subject_id" | "source_id" => return text(&edge.subject_id),
            "object_id" | "target_id" => return text(&edge.object_id),
            "source" | "subject" => {
                return self
                    .snapshot
                    .get_node(&edge.subject_id)
                    .map_or(Step::Missing, |n| Step::One(Cursor::Node(n)));
            }
            "target" | "object" => {
                return self
                    .snapshot
                    .get_node(&edge.object_id)
                    .map_or(Step::Missing, |n| Step::One(Cursor::Node(n)));
            }
            "created_at" => return edge.created_at.map_or(Step::Missing, |t| leaf(Value::Timestamp(t))),
            "confidence" => return leaf(Value::Float(edge.confidence())),
            "layer" => return text(edge.layer_kind().as_str()),
            "evidence" => return Step::Many(edge.evidence.iter().map(Cursor::Evidence).collect()),
            "evidence_count" => return leaf(Value::Int(edge.evidence.len() as i64)),
            "contradicted" => return leaf(Value::Bool(self.snapshot.contradiction_of(&edge.id).is_some())),
            _ => {}
        }
        match (&edge.layer, name) {
            (EdgeLayer::Extraction { extractor_name, .. }, "extractor_name") => text(extractor_name),
            (
                EdgeLayer::Extraction {
                    extraction_confidence,
                    ..
                },
                "extraction_confidence",
            ) => leaf(Value::Float(*extraction_confidence)),
            (EdgeLayer::Claim { predicate, .. }, "predicate") => text(predicate),
            (EdgeLayer::Claim { asserted_by, .. }, "asserted_by") => text(asserted_by),
            (EdgeLayer::Claim { polarity, .. }, "polarity") => text(polarity.as_str()),
            (EdgeLayer::Evidence { evidence_type, .. }, "evidence_type") => text(evidence_type),
            (
                EdgeLayer::Evidence {
                    evidence_strength, ..
                },
                "evidence_strength",
            ) => leaf(Value::Float(*evidence_strength)),
            (EdgeLayer::Evidence { study_type, .. }, "study_type") => text(study_type.as_str()),
            (EdgeLayer::Evidence { sample_size, .. }, "sample_size") => leaf(Value::Int(*sample_size as i64)),
            (EdgeLayer::Evidence { text_span, .. }, "text_span") => text(text_span),
            (EdgeLayer::Evidence { paper_id, .. }, "paper_id") => text(paper_id),
            (EdgeLayer::Evidence { supports, .. }, "supports") => opt_text(supports.as_deref()),
            _ => Step::Missing,
        }
    }

    /// Terminal conversion of a cursor into a value.
    fn materialize(&self, cursor: Cursor<'g>) -> Value {
        let record = |v: Result<JsonValue, serde_json::Error>| v.map_or(Value::Missing, Value::Record);
        match cursor {
            Cursor::Leaf(v) => v,
            Cursor::Node(n) => record(serde_json::to_value(n)),
            Cursor::Edge(e) => record(serde_json::to_value(e)),
            Cursor::Evidence(item) => record(serde_json::to_value(item)),
            Cursor::Measurement(m) => record(serde_json::to_value(m)),
            Cursor::Properties(p) => record(serde_json::to_value(p)),
            Cursor::ExternalIds(ids) => record(serde_json::to_value(ids)),
            Cursor::Path(p) => Value::Record(json!({
                "length": p.edges.len(),
                "nodes": p.nodes.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(),
                "edges": p.edges.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            })),
        }
    }
}

fn evidence_step<'g>(item: &'g EvidenceItem, name: &str) -> Step<'g> {
    match name {
        "paper_id" => opt_text(item.paper_id.as_deref()),
        "study_type" => item.study_type.map_or(Step::Missing, |s| text(s.as_str())),
        "sample_size" => item
            .sample_size
            .map_or(Step::Missing, |n| leaf(Value::Int(n as i64))),
        "paper_publication_date" | "publication_date" => item
            .paper_publication_date
            .map_or(Step::Missing, |d| leaf(Value::Date(d))),
        "measurement" => item
            .measurement
            .as_ref()
            .map_or(Step::Missing, |m| Step::One(Cursor::Measurement(m))),
        _ => Step::Missing,
    }
}
