//! Result assembly: ordering, pagination and projection.
//!
//! Raw queries sort binding environments by resolved `order_by` paths before
//! projecting them; aggregated queries sort finished rows by column name. In
//! both cases `total` counts rows before `offset`/`limit` are applied.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde_json::{Map, Value as JsonValue};

use crate::query::{EDGE, FieldPath, FindKind, NODE, OrderKey, PATH, Query, SOURCE, SortDirection, TARGET};

use super::resolve::{Bound, Env, Resolver};
use super::value::Value;

/// One output row: ordered `(column, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn push(&mut self, column: &str, value: Value) {
        self.columns.push((column.to_string(), value));
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    /// Keep only `fields`, in that order. Unknown columns become `null`.
    pub fn project(&self, fields: &[FieldPath]) -> Row {
        let columns = fields
            .iter()
            .map(|f| (f.as_str().to_string(), self.get(f.as_str()).cloned().unwrap_or(Value::Null)))
            .collect();
        Row { columns }
    }

    pub fn to_json(&self) -> JsonValue {
        let map: Map<String, JsonValue> = self.columns.iter().map(|(c, v)| (c.clone(), v.to_json())).collect();
        JsonValue::Object(map)
    }
}

/// A page of results plus the pre-pagination row count.
#[derive(Debug, Clone, Default)]
pub struct Assembled {
    pub results: Vec<JsonValue>,
    pub total: usize,
}

/// Order, project and paginate raw binding environments.
pub fn assemble_raw<'g>(resolver: &Resolver<'g>, query: &Query, envs: &[Env<'g>], limit: Option<usize>) -> Assembled {
    let mut keyed: Vec<(Vec<Value>, &Env<'g>)> = envs
        .iter()
        .map(|env| {
            let keys = query.order_by.iter().map(|k| resolver.resolve(env, &k.field)).collect();
            (keys, env)
        })
        .collect();
    if !query.order_by.is_empty() {
        keyed.sort_by(|(a, _), (b, _)| compare_keys(&query.order_by, a, b));
    }

    // A nodes query returns each matched node once, however many edges bound it.
    let node_var = match (&query.find, &query.node_pattern) {
        (FindKind::Nodes, Some(np)) => Some(np.var.as_str()),
        _ => None,
    };
    let mut seen = HashSet::new();
    let rows: Vec<Row> = keyed
        .into_iter()
        .filter(|(_, env)| match node_var.and_then(|var| env.get(var)) {
            Some(&Bound::Node(node)) => seen.insert(node.id.as_str()),
            _ => true,
        })
        .map(|(_, env)| project_env(resolver, query, env))
        .collect();
    paginate(rows, query.offset, limit)
}

/// Order, project and paginate aggregated rows.
pub fn assemble_rows(query: &Query, mut rows: Vec<Row>, limit: Option<usize>) -> Assembled {
    if !query.order_by.is_empty() {
        rows.sort_by(|a, b| {
            let ka: Vec<Value> = query.order_by.iter().map(|k| column(a, &k.field)).collect();
            let kb: Vec<Value> = query.order_by.iter().map(|k| column(b, &k.field)).collect();
            compare_keys(&query.order_by, &ka, &kb)
        });
    }
    let rows = match &query.return_fields {
        Some(fields) => rows.iter().map(|r| r.project(fields)).collect(),
        None => rows,
    };
    paginate(rows, query.offset, limit)
}

fn column(row: &Row, field: &FieldPath) -> Value {
    row.get(field.as_str()).cloned().unwrap_or(Value::Missing)
}

fn paginate(rows: Vec<Row>, offset: usize, limit: Option<usize>) -> Assembled {
    let total = rows.len();
    let results = rows
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .map(|r| r.to_json())
        .collect();
    Assembled { results, total }
}

/// Stable multi-key comparison. Absent values sort last in either direction;
/// values of different kinds rank by kind.
fn compare_keys(order: &[OrderKey], a: &[Value], b: &[Value]) -> Ordering {
    for (key, (x, y)) in order.iter().zip(a.iter().zip(b)) {
        let ord = match (x.is_absent(), y.is_absent()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ord = x.total_order(y);
                match key.direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                }
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn project_env<'g>(resolver: &Resolver<'g>, query: &Query, env: &Env<'g>) -> Row {
    let fields = match &query.return_fields {
        Some(fields) => fields.clone(),
        None => default_fields(query, env.contains(NODE)),
    };
    let mut row = Row::default();
    for field in &fields {
        let value = resolver.resolve(env, field);
        row.push(field.as_str(), if value.is_missing() { Value::Null } else { value });
    }
    row
}

/// Projection used when a query names no `return_fields`. `node_row`
/// selects between the node and edge halves of a subgraph result.
pub(crate) fn default_fields(query: &Query, node_row: bool) -> Vec<FieldPath> {
    let mut raw: Vec<String> = Vec::new();
    match query.find {
        FindKind::Nodes => {
            if let Some(np) = &query.node_pattern {
                raw.extend(["id", "name", "node_type"].map(|f| format!("{}.{f}", np.var)));
            } else {
                raw.extend(["n.id", "n.name", "n.node_type"].map(String::from));
            }
        }
        FindKind::Edges => {
            let var = query.edge_pattern.as_ref().map_or("r", |ep| ep.var.as_str());
            raw.push(format!("{var}.id"));
            raw.extend([format!("{SOURCE}.id"), format!("{SOURCE}.name")]);
            raw.push(format!("{var}.relation_type"));
            raw.extend([format!("{TARGET}.id"), format!("{TARGET}.name")]);
            raw.extend([format!("{var}.confidence"), format!("{var}.layer")]);
        }
        FindKind::Paths => {
            if let Some(pp) = &query.path_pattern {
                raw.push(format!("{}.name", pp.start.var));
                if pp.shortest_path {
                    if let Some(last) = pp.hops.last() {
                        raw.push(format!("{}.name", last.node.var));
                    }
                    raw.extend([format!("{PATH}.node_names"), format!("{PATH}.relation_types")]);
                } else {
                    for hop in pp.template() {
                        raw.push(format!("{}.relation_type", hop.edge.var));
                        raw.push(format!("{}.name", hop.node.var));
                    }
                }
                raw.push(format!("{PATH}.length"));
            }
        }
        FindKind::Subgraph => {
            if node_row {
                raw.extend(["id", "name", "node_type"].map(|f| format!("{NODE}.{f}")));
            } else {
                raw.extend([
                    format!("{EDGE}.id"),
                    format!("{SOURCE}.id"),
                    format!("{EDGE}.relation_type"),
                    format!("{TARGET}.id"),
                    format!("{EDGE}.confidence"),
                    format!("{EDGE}.layer"),
                ]);
            }
        }
    }
    raw.iter().filter_map(|r| FieldPath::parse(r).ok()).collect()
}
