//! Strict query validator.
//!
//! Walks the raw JSON document by hand rather than through serde derives so
//! that every rejection can name the exact location of the offending field
//! and, for unknown keys, the keys that *are* allowed there. Unknown keys are
//! always errors; nothing is silently ignored.

use std::sync::LazyLock;

use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value as JsonValue};

use crate::config::QueryLimits;
use crate::error::{EngineError, ResolutionError, ValidationError};
use crate::exec::value::Value;
use crate::graph::{Direction, LayerKind, NodeType, StudyType};

use super::{
    AggFn, AggregateSpec, Aggregation, EDGE, EdgePattern, FieldPath, Filter, FilterOp, FindKind,
    Hop, NODE, NodePattern, OrderKey, PATH, PathPattern, Query, SOURCE, SortDirection, TARGET,
};

const QUERY_FIELDS: &[&str] = &[
    "find",
    "node_pattern",
    "edge_pattern",
    "path_pattern",
    "filters",
    "aggregate",
    "order_by",
    "limit",
    "offset",
    "return_fields",
];
const NODE_FIELDS: &[&str] = &[
    "var",
    "node_type",
    "node_types",
    "name",
    "name_pattern",
    "id",
    "external_id",
    "properties",
    "property_filters",
];
const EDGE_FIELDS: &[&str] = &[
    "var",
    "relation_type",
    "relation_types",
    "direction",
    "min_confidence",
    "min_evidence_count",
    "require_evidence_from",
    "layer",
    "property_filters",
];
const PATH_FIELDS: &[&str] = &[
    "start",
    "edges",
    "max_hops",
    "avoid_cycles",
    "all_paths",
    "shortest_path",
];
const HOP_FIELDS: &[&str] = &["edge", "node"];
const FILTER_FIELDS: &[&str] = &["field", "operator", "value"];
const AGGREGATE_FIELDS: &[&str] = &["group_by", "aggregations"];
const ORDER_FIELDS: &[&str] = &["field", "direction"];

/// First segments that only make sense on an edge. An anonymous edge pattern
/// adopts an undeclared root whose path continues with one of these.
pub(crate) const EDGE_HEADS: &[&str] = &[
    "relation_type",
    "confidence",
    "evidence",
    "evidence_count",
    "contradicted",
    "layer",
    "predicate",
    "polarity",
    "asserted_by",
    "extractor_name",
    "extraction_confidence",
    "evidence_type",
    "evidence_strength",
    "study_type",
    "sample_size",
    "text_span",
    "paper_id",
    "supports",
    "subject_id",
    "object_id",
    "created_at",
];

const REGEX_CACHE_CAPACITY: usize = 1024;

/// Compiled patterns shared by every query, including batch entries running
/// on other threads. Cleared wholesale once it reaches capacity.
static REGEX_CACHE: LazyLock<DashMap<String, Regex>> = LazyLock::new(DashMap::new);

/// Compile a case-insensitive regex, reusing a cached instance when possible.
pub fn compile_regex(pattern: &str) -> Result<Regex, regex::Error> {
    if let Some(cached) = REGEX_CACHE.get(pattern) {
        return Ok(cached.clone());
    }
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(1 << 20)
        .build()?;
    if REGEX_CACHE.len() >= REGEX_CACHE_CAPACITY {
        REGEX_CACHE.clear();
    }
    REGEX_CACHE.insert(pattern.to_string(), regex.clone());
    Ok(regex)
}

/// Validate a raw query document using the default limits.
pub fn parse(raw: &JsonValue) -> Result<Query, EngineError> {
    parse_with_limits(raw, &QueryLimits::default())
}

/// Validate a raw query document and bind every pattern variable.
pub fn parse_with_limits(raw: &JsonValue, limits: &QueryLimits) -> Result<Query, EngineError> {
    let parser = Parser { limits };
    let mut query = parser.query(raw)?;
    bind_variables(&mut query)?;
    Ok(query)
}

type VResult<T> = Result<T, ValidationError>;

struct Parser<'a> {
    limits: &'a QueryLimits,
}

impl Parser<'_> {
    fn query(&self, raw: &JsonValue) -> VResult<Query> {
        let map = object(raw, "query")?;
        check_keys(map, "", QUERY_FIELDS)?;

        let find = match field(map, "find") {
            None => return Err(ValidationError::new("find", "required field is missing")),
            Some(v) => match string(v, "find")?.to_ascii_lowercase().as_str() {
                "nodes" => FindKind::Nodes,
                "edges" => FindKind::Edges,
                "paths" => FindKind::Paths,
                "subgraph" => FindKind::Subgraph,
                other => {
                    return Err(ValidationError::new(
                        "find",
                        format!("unknown find type \"{other}\"; expected one of {}", FindKind::ALL.join(", ")),
                    ));
                }
            },
        };

        let mut query = Query::new(find);
        if let Some(v) = field(map, "node_pattern") {
            query.node_pattern = Some(self.node_pattern(v, "node_pattern")?);
        }
        if let Some(v) = field(map, "edge_pattern") {
            query.edge_pattern = Some(self.edge_pattern(v, "edge_pattern")?);
        }
        if let Some(v) = field(map, "path_pattern") {
            query.path_pattern = Some(self.path_pattern(v, "path_pattern")?);
        }
        if let Some(v) = field(map, "filters") {
            query.filters = self.filters(v, "filters", false)?;
        }
        if let Some(v) = field(map, "aggregate") {
            query.aggregate = Some(aggregate(v, "aggregate")?);
        }
        if let Some(v) = field(map, "order_by") {
            query.order_by = order_by(v, "order_by")?;
        }
        if let Some(v) = field(map, "limit") {
            query.limit = Some(count(v, "limit")?);
        }
        if let Some(v) = field(map, "offset") {
            query.offset = count(v, "offset")?;
        }
        if let Some(v) = field(map, "return_fields") {
            let items = array(v, "return_fields")?;
            if items.is_empty() {
                return Err(ValidationError::new("return_fields", "must list at least one field"));
            }
            let mut fields = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let loc = format!("return_fields[{i}]");
                fields.push(field_path(string(item, &loc)?, &loc)?);
            }
            query.return_fields = Some(fields);
        }

        check_shape(&query)?;
        Ok(query)
    }

    fn node_pattern(&self, raw: &JsonValue, loc: &str) -> VResult<NodePattern> {
        let map = object(raw, loc)?;
        check_keys(map, loc, NODE_FIELDS)?;
        let mut pattern = NodePattern::default();

        if let Some(v) = field(map, "var") {
            pattern.var = variable(v, &join(loc, "var"))?;
        }
        for key in ["node_type", "node_types"] {
            if let Some(v) = field(map, key) {
                let at = join(loc, key);
                for name in strings(v, &at)? {
                    let t: NodeType = name.parse().map_err(|e: String| ValidationError::new(&at, e))?;
                    if !pattern.node_types.contains(&t) {
                        pattern.node_types.push(t);
                    }
                }
            }
        }
        if let Some(v) = field(map, "name") {
            pattern.names = strings(v, &join(loc, "name"))?;
        }
        if let Some(v) = field(map, "name_pattern") {
            let at = join(loc, "name_pattern");
            pattern.name_pattern = Some(self.regex(string(v, &at)?, &at)?);
        }
        if let Some(v) = field(map, "id") {
            pattern.id = Some(string(v, &join(loc, "id"))?.to_string());
        }
        if let Some(v) = field(map, "external_id") {
            let at = join(loc, "external_id");
            for (ontology, id) in object(v, &at)? {
                let id = string(id, &join(&at, ontology))?;
                pattern.external_id.insert(ontology.clone(), id.to_string());
            }
        }
        if let Some(v) = field(map, "properties") {
            let at = join(loc, "properties");
            for (key, value) in object(v, &at)? {
                pattern.properties.insert(key.clone(), scalar(value, &join(&at, key))?);
            }
        }
        if let Some(v) = field(map, "property_filters") {
            pattern.property_filters = self.filters(v, &join(loc, "property_filters"), true)?;
        }
        Ok(pattern)
    }

    fn edge_pattern(&self, raw: &JsonValue, loc: &str) -> VResult<EdgePattern> {
        let map = object(raw, loc)?;
        check_keys(map, loc, EDGE_FIELDS)?;
        let mut pattern = EdgePattern::default();

        if let Some(v) = field(map, "var") {
            pattern.var = variable(v, &join(loc, "var"))?;
        }
        for key in ["relation_type", "relation_types"] {
            if let Some(v) = field(map, key) {
                for rel in strings(v, &join(loc, key))? {
                    if !pattern.relation_types.iter().any(|r| r.eq_ignore_ascii_case(&rel)) {
                        pattern.relation_types.push(rel);
                    }
                }
            }
        }
        if let Some(v) = field(map, "direction") {
            let at = join(loc, "direction");
            pattern.direction = string(v, &at)?
                .parse::<Direction>()
                .map_err(|e| ValidationError::new(&at, e))?;
        }
        if let Some(v) = field(map, "min_confidence") {
            let at = join(loc, "min_confidence");
            let min = number(v, &at)?;
            if !(0.0..=1.0).contains(&min) {
                return Err(ValidationError::new(at, format!("{min} is outside [0.0, 1.0]")));
            }
            pattern.min_confidence = Some(min);
        }
        if let Some(v) = field(map, "min_evidence_count") {
            pattern.min_evidence_count = Some(count(v, &join(loc, "min_evidence_count"))?);
        }
        if let Some(v) = field(map, "require_evidence_from") {
            let at = join(loc, "require_evidence_from");
            for name in strings(v, &at)? {
                let st: StudyType = name.parse().map_err(|e: String| ValidationError::new(&at, e))?;
                if !pattern.require_evidence_from.contains(&st) {
                    pattern.require_evidence_from.push(st);
                }
            }
        }
        if let Some(v) = field(map, "layer") {
            let at = join(loc, "layer");
            pattern.layer = Some(
                string(v, &at)?
                    .parse::<LayerKind>()
                    .map_err(|e| ValidationError::new(&at, e))?,
            );
        }
        if let Some(v) = field(map, "property_filters") {
            pattern.property_filters = self.filters(v, &join(loc, "property_filters"), true)?;
        }
        Ok(pattern)
    }

    fn path_pattern(&self, raw: &JsonValue, loc: &str) -> VResult<PathPattern> {
        let map = object(raw, loc)?;
        check_keys(map, loc, PATH_FIELDS)?;

        let start = match field(map, "start") {
            Some(v) => self.node_pattern(v, &join(loc, "start"))?,
            None => return Err(ValidationError::new(join(loc, "start"), "required field is missing")),
        };

        let edges_loc = join(loc, "edges");
        let raw_hops = match field(map, "edges") {
            Some(v) => array(v, &edges_loc)?,
            None => return Err(ValidationError::new(edges_loc, "required field is missing")),
        };
        if raw_hops.is_empty() {
            return Err(ValidationError::new(edges_loc, "a path needs at least one hop"));
        }
        let mut hops = Vec::with_capacity(raw_hops.len());
        for (i, raw_hop) in raw_hops.iter().enumerate() {
            let at = format!("{edges_loc}[{i}]");
            let (edge, node) = match raw_hop {
                JsonValue::Array(pair) if pair.len() == 2 => (&pair[0], &pair[1]),
                JsonValue::Array(_) => {
                    return Err(ValidationError::new(at, "a hop is an [edge_pattern, node_pattern] pair"));
                }
                JsonValue::Object(hop) => {
                    check_keys(hop, &at, HOP_FIELDS)?;
                    match (field(hop, "edge"), field(hop, "node")) {
                        (Some(e), Some(n)) => (e, n),
                        _ => return Err(ValidationError::new(at, "a hop needs both `edge` and `node`")),
                    }
                }
                _ => return Err(ValidationError::new(at, "expected an array or object")),
            };
            hops.push(Hop {
                edge: self.edge_pattern(edge, &format!("{at}.edge"))?,
                node: self.node_pattern(node, &format!("{at}.node"))?,
            });
        }

        let ceiling = self.limits.max_hops_ceiling;
        let max_hops = match field(map, "max_hops") {
            Some(v) => {
                let at = join(loc, "max_hops");
                let n = count(v, &at)?;
                if n == 0 || n > ceiling {
                    return Err(ValidationError::new(at, format!("must be between 1 and {ceiling}, got {n}")));
                }
                n
            }
            None if hops.len() > ceiling => {
                return Err(ValidationError::new(
                    join(loc, "edges"),
                    format!("{} hops exceed the ceiling of {ceiling}", hops.len()),
                ));
            }
            None => hops.len(),
        };

        let flag = |key: &str, default: bool| -> VResult<bool> {
            match field(map, key) {
                Some(v) => boolean(v, &join(loc, key)),
                None => Ok(default),
            }
        };

        Ok(PathPattern {
            start,
            hops,
            max_hops,
            avoid_cycles: flag("avoid_cycles", true)?,
            all_paths: flag("all_paths", false)?,
            shortest_path: flag("shortest_path", false)?,
        })
    }

    fn filters(&self, raw: &JsonValue, loc: &str, relative: bool) -> VResult<Vec<Filter>> {
        array(raw, loc)?
            .iter()
            .enumerate()
            .map(|(i, f)| self.filter(f, &format!("{loc}[{i}]"), relative))
            .collect()
    }

    fn filter(&self, raw: &JsonValue, loc: &str, relative: bool) -> VResult<Filter> {
        let map = object(raw, loc)?;
        check_keys(map, loc, FILTER_FIELDS)?;

        let field_loc = join(loc, "field");
        let path = match field(map, "field") {
            Some(v) => {
                let text = string(v, &field_loc)?;
                let parsed = if relative {
                    FieldPath::parse_relative(text)
                } else {
                    FieldPath::parse(text)
                };
                parsed.map_err(|e| ValidationError::new(&field_loc, e))?
            }
            None => return Err(ValidationError::new(field_loc, "required field is missing")),
        };

        let op_loc = join(loc, "operator");
        let operator = match field(map, "operator") {
            Some(v) => string(v, &op_loc)?.to_ascii_lowercase(),
            None => return Err(ValidationError::new(op_loc, "required field is missing")),
        };

        let value_loc = join(loc, "value");
        let value = map.get("value").ok_or_else(|| ValidationError::new(&value_loc, "required field is missing"))?;

        let op = match operator.as_str() {
            "eq" => FilterOp::Eq(scalar_or_null(value, &value_loc)?),
            "ne" => FilterOp::Ne(scalar_or_null(value, &value_loc)?),
            "gt" => FilterOp::Gt(scalar(value, &value_loc)?),
            "gte" => FilterOp::Gte(scalar(value, &value_loc)?),
            "lt" => FilterOp::Lt(scalar(value, &value_loc)?),
            "lte" => FilterOp::Lte(scalar(value, &value_loc)?),
            "in" => FilterOp::In(
                array(value, &value_loc)?
                    .iter()
                    .enumerate()
                    .map(|(i, v)| scalar_or_null(v, &format!("{value_loc}[{i}]")))
                    .collect::<VResult<_>>()?,
            ),
            "contains" => FilterOp::Contains(string(value, &value_loc)?.to_lowercase()),
            "regex" => FilterOp::Regex(self.regex(string(value, &value_loc)?, &value_loc)?),
            other => {
                return Err(ValidationError::new(
                    op_loc,
                    format!("unknown operator \"{other}\"; expected one of {}", FilterOp::NAMES.join(", ")),
                ));
            }
        };
        Ok(Filter { field: path, op })
    }

    fn regex(&self, pattern: &str, loc: &str) -> VResult<Regex> {
        let max = self.limits.max_regex_len;
        if pattern.chars().count() > max {
            return Err(ValidationError::new(loc, format!("regex longer than {max} characters")));
        }
        compile_regex(pattern).map_err(|e| ValidationError::new(loc, format!("invalid regex: {e}")))
    }
}

fn aggregate(raw: &JsonValue, loc: &str) -> VResult<AggregateSpec> {
    let map = object(raw, loc)?;
    check_keys(map, loc, AGGREGATE_FIELDS)?;
    let mut spec = AggregateSpec::default();

    if let Some(v) = field(map, "group_by") {
        let at = join(loc, "group_by");
        for (i, text) in strings(v, &at)?.iter().enumerate() {
            spec.group_by.push(field_path(text, &format!("{at}[{i}]"))?);
        }
    }
    if let Some(v) = field(map, "aggregations") {
        let at = join(loc, "aggregations");
        for (name, def) in object(v, &at)? {
            let def_loc = join(&at, name);
            if spec.group_by.iter().any(|g| g.as_str() == name) {
                return Err(ValidationError::new(def_loc, "name collides with a group_by field"));
            }
            let (fn_name, target) = match def {
                JsonValue::String(f) => (f.as_str(), None),
                JsonValue::Array(parts) if (1..=2).contains(&parts.len()) => (
                    string(&parts[0], &format!("{def_loc}[0]"))?,
                    parts.get(1).map(|p| string(p, &format!("{def_loc}[1]"))).transpose()?,
                ),
                _ => return Err(ValidationError::new(def_loc, "expected [function, field]")),
            };
            let function = AggFn::from_name(fn_name).ok_or_else(|| {
                ValidationError::new(
                    &def_loc,
                    format!("unknown aggregation \"{fn_name}\"; expected one of {}", AggFn::NAMES.join(", ")),
                )
            })?;
            let field = match target {
                None | Some("*") if function == AggFn::Count => None,
                None | Some("*") => {
                    return Err(ValidationError::new(def_loc, format!("{} needs a field", function.as_str())));
                }
                Some(text) => Some(field_path(text, &format!("{def_loc}[1]"))?),
            };
            spec.aggregations.push(Aggregation {
                name: name.clone(),
                function,
                field,
            });
        }
    }
    if spec.group_by.is_empty() && spec.aggregations.is_empty() {
        return Err(ValidationError::new(loc, "needs group_by or aggregations"));
    }
    Ok(spec)
}

fn order_by(raw: &JsonValue, loc: &str) -> VResult<Vec<OrderKey>> {
    let mut keys = Vec::new();
    for (i, item) in array(raw, loc)?.iter().enumerate() {
        let at = format!("{loc}[{i}]");
        let (text, direction) = match item {
            JsonValue::String(s) => (s.as_str(), None),
            JsonValue::Array(pair) if pair.len() == 2 => (string(&pair[0], &at)?, Some(&pair[1])),
            JsonValue::Object(map) => {
                check_keys(map, &at, ORDER_FIELDS)?;
                let text = match field(map, "field") {
                    Some(v) => string(v, &join(&at, "field"))?,
                    None => return Err(ValidationError::new(join(&at, "field"), "required field is missing")),
                };
                (text, field(map, "direction"))
            }
            _ => return Err(ValidationError::new(at, "expected \"field\" or [field, direction]")),
        };
        let direction = match direction {
            None => SortDirection::Asc,
            Some(d) => match string(d, &at)?.to_ascii_lowercase().as_str() {
                "asc" => SortDirection::Asc,
                "desc" => SortDirection::Desc,
                other => {
                    return Err(ValidationError::new(at, format!("direction must be asc or desc, got \"{other}\"")));
                }
            },
        };
        keys.push(OrderKey {
            field: field_path(text, &at)?,
            direction,
        });
    }
    Ok(keys)
}

/// Reject pattern combinations that do not fit the requested find type.
fn check_shape(query: &Query) -> VResult<()> {
    match query.find {
        FindKind::Nodes | FindKind::Edges => {
            if query.path_pattern.is_some() {
                return Err(ValidationError::new("path_pattern", "only valid with find=paths"));
            }
        }
        FindKind::Paths => {
            if query.path_pattern.is_none() {
                return Err(ValidationError::new("path_pattern", "required when find=paths"));
            }
            if query.node_pattern.is_some() {
                return Err(ValidationError::new("node_pattern", "not valid with find=paths; use path_pattern"));
            }
            if query.edge_pattern.is_some() {
                return Err(ValidationError::new("edge_pattern", "not valid with find=paths; use path_pattern"));
            }
        }
        FindKind::Subgraph => {
            if query.node_pattern.is_some() || query.edge_pattern.is_some() || query.path_pattern.is_some() {
                return Err(ValidationError::new(
                    "find",
                    "subgraph takes no pattern; select with node.* and edge.* filters",
                ));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Variable binding
// ---------------------------------------------------------------------------

/// Assign every pattern variable its final name and check that each field
/// path's root is bound.
fn bind_variables(query: &mut Query) -> Result<(), EngineError> {
    let references = collect_references(query)?;
    let references: Vec<&FieldPath> = references.iter().collect();

    let bound: Vec<String> = match query.find {
        FindKind::Nodes | FindKind::Edges => bind_single(query, &references)?,
        FindKind::Paths => bind_path(query)?,
        FindKind::Subgraph => [NODE, EDGE, SOURCE, TARGET].iter().map(|v| v.to_string()).collect(),
    };

    for path in references {
        if !bound.iter().any(|name| name == path.root()) {
            return Err(ResolutionError {
                path: path.as_str().to_string(),
                variable: path.root().to_string(),
                bound: bound.join(", "),
            }
            .into());
        }
    }
    Ok(())
}

/// Paths that must resolve against the binding environment. For aggregated
/// queries `order_by` and `return_fields` name output columns instead, and
/// are checked here against the column list.
fn collect_references(query: &Query) -> Result<Vec<FieldPath>, ValidationError> {
    let mut refs: Vec<FieldPath> = query.filters.iter().map(|f| f.field.clone()).collect();
    match &query.aggregate {
        Some(spec) => {
            refs.extend(spec.group_by.iter().cloned());
            refs.extend(spec.aggregations.iter().filter_map(|a| a.field.clone()));
            let columns: Vec<&str> = spec.columns().collect();
            for (i, key) in query.order_by.iter().enumerate() {
                if !columns.contains(&key.field.as_str()) {
                    return Err(ValidationError::unknown_field(format!("order_by[{i}]"), &columns));
                }
            }
            for (i, f) in query.return_fields.iter().flatten().enumerate() {
                if !columns.contains(&f.as_str()) {
                    return Err(ValidationError::unknown_field(format!("return_fields[{i}]"), &columns));
                }
            }
        }
        None => {
            refs.extend(query.order_by.iter().map(|k| k.field.clone()));
            refs.extend(query.return_fields.iter().flatten().cloned());
        }
    }
    Ok(refs)
}

fn is_edge_reference(path: &FieldPath) -> bool {
    path.head().is_some_and(|h| EDGE_HEADS.contains(&h))
}

/// Bind the node and edge variables of a `nodes` or `edges` query.
///
/// A pattern without `var` takes its default name when the query uses it;
/// otherwise it adopts the first undeclared root whose path fits its kind.
fn bind_single(query: &mut Query, references: &[&FieldPath]) -> VResult<Vec<String>> {
    if query.find == FindKind::Nodes && query.node_pattern.is_none() {
        query.node_pattern = Some(NodePattern::default());
    }
    if query.find == FindKind::Edges && query.edge_pattern.is_none() {
        query.edge_pattern = Some(EdgePattern::default());
    }
    let has_edge = query.edge_pattern.is_some();

    let mut declared: Vec<String> = Vec::new();
    if let Some(np) = &query.node_pattern {
        if !np.var.is_empty() {
            declared.push(np.var.clone());
        }
    }
    if let Some(ep) = &query.edge_pattern {
        if !ep.var.is_empty() {
            declared.push(ep.var.clone());
        }
    }
    if has_edge {
        declared.push(SOURCE.into());
        declared.push(TARGET.into());
    }

    let undeclared: Vec<&FieldPath> = references
        .iter()
        .copied()
        .filter(|p| {
            let root = p.root();
            !declared.iter().any(|d| d == root) && !["n", "r", SOURCE, TARGET, PATH, NODE, EDGE].contains(&root)
        })
        .collect();
    let uses = |name: &str| references.iter().any(|p| p.root() == name);

    if let Some(ep) = query.edge_pattern.as_mut() {
        if ep.var.is_empty() {
            ep.var = if uses("r") {
                "r".into()
            } else {
                undeclared
                    .iter()
                    .find(|p| is_edge_reference(p))
                    .map(|p| p.root().to_string())
                    .unwrap_or_else(|| "r".into())
            };
        }
    }
    let edge_var = query.edge_pattern.as_ref().map(|ep| ep.var.clone());

    if let Some(np) = query.node_pattern.as_mut() {
        if np.var.is_empty() {
            np.var = if uses("n") {
                "n".into()
            } else {
                undeclared
                    .iter()
                    .find(|p| !is_edge_reference(p) && Some(p.root()) != edge_var.as_deref())
                    .map(|p| p.root().to_string())
                    .unwrap_or_else(|| "n".into())
            };
        }
    }

    let mut bound: Vec<String> = Vec::new();
    if let Some(np) = &query.node_pattern {
        push_var(&mut bound, &np.var, "node_pattern.var")?;
    }
    if let Some(ep) = &query.edge_pattern {
        push_var(&mut bound, &ep.var, "edge_pattern.var")?;
        push_var(&mut bound, SOURCE, "edge_pattern.var")?;
        push_var(&mut bound, TARGET, "edge_pattern.var")?;
    }
    Ok(bound)
}

/// Bind path variables: `start`, then `edge{i}` / `node{i+1}` per hop unless
/// named. Shortest-path queries bind only the endpoints and the path.
fn bind_path(query: &mut Query) -> VResult<Vec<String>> {
    let Some(pp) = query.path_pattern.as_mut() else {
        return Ok(Vec::new());
    };
    if pp.start.var.is_empty() {
        pp.start.var = "start".into();
    }
    for (i, hop) in pp.hops.iter_mut().enumerate() {
        if hop.edge.var.is_empty() {
            hop.edge.var = format!("edge{i}");
        }
        if hop.node.var.is_empty() {
            hop.node.var = format!("node{}", i + 1);
        }
    }

    let mut all: Vec<String> = Vec::new();
    push_var(&mut all, &pp.start.var, "path_pattern.start.var")?;
    for (i, hop) in pp.hops.iter().enumerate() {
        push_var(&mut all, &hop.edge.var, &format!("path_pattern.edges[{i}].edge.var"))?;
        push_var(&mut all, &hop.node.var, &format!("path_pattern.edges[{i}].node.var"))?;
    }
    for alias in [PATH, SOURCE, TARGET] {
        push_var(&mut all, alias, "path_pattern")?;
    }

    if pp.shortest_path {
        let end = pp.hops.last().map(|h| h.node.var.clone()).unwrap_or_default();
        all.retain(|name| {
            name == &pp.start.var || name == &end || [PATH, SOURCE, TARGET].contains(&name.as_str())
        });
    } else {
        let template: Vec<&str> = pp
            .template()
            .iter()
            .flat_map(|h| [h.edge.var.as_str(), h.node.var.as_str()])
            .collect();
        all.retain(|name| {
            name == &pp.start.var || template.contains(&name.as_str()) || [PATH, SOURCE, TARGET].contains(&name.as_str())
        });
    }
    Ok(all)
}

fn push_var(bound: &mut Vec<String>, name: &str, loc: &str) -> VResult<()> {
    if bound.iter().any(|n| n == name) {
        return Err(ValidationError::new(loc, format!("variable `{name}` is bound more than once")));
    }
    bound.push(name.to_string());
    Ok(())
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

fn join(loc: &str, key: &str) -> String {
    if loc.is_empty() {
        key.to_string()
    } else {
        format!("{loc}.{key}")
    }
}

/// Present and non-null.
fn field<'v>(map: &'v Map<String, JsonValue>, key: &str) -> Option<&'v JsonValue> {
    map.get(key).filter(|v| !v.is_null())
}

fn check_keys(map: &Map<String, JsonValue>, loc: &str, allowed: &[&str]) -> VResult<()> {
    match map.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(unknown) => Err(ValidationError::unknown_field(join(loc, unknown), allowed)),
        None => Ok(()),
    }
}

fn object<'v>(v: &'v JsonValue, loc: &str) -> VResult<&'v Map<String, JsonValue>> {
    v.as_object().ok_or_else(|| ValidationError::new(loc, "expected an object"))
}

fn array<'v>(v: &'v JsonValue, loc: &str) -> VResult<&'v Vec<JsonValue>> {
    v.as_array().ok_or_else(|| ValidationError::new(loc, "expected an array"))
}

fn string<'v>(v: &'v JsonValue, loc: &str) -> VResult<&'v str> {
    v.as_str().ok_or_else(|| ValidationError::new(loc, "expected a string"))
}

fn boolean(v: &JsonValue, loc: &str) -> VResult<bool> {
    v.as_bool().ok_or_else(|| ValidationError::new(loc, "expected a boolean"))
}

fn number(v: &JsonValue, loc: &str) -> VResult<f64> {
    v.as_f64().ok_or_else(|| ValidationError::new(loc, "expected a number"))
}

fn count(v: &JsonValue, loc: &str) -> VResult<usize> {
    v.as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| ValidationError::new(loc, "expected a non-negative integer"))
}

/// A string or a list of strings.
fn strings(v: &JsonValue, loc: &str) -> VResult<Vec<String>> {
    match v {
        JsonValue::String(s) => Ok(vec![s.clone()]),
        JsonValue::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| string(item, &format!("{loc}[{i}]")).map(str::to_string))
            .collect(),
        _ => Err(ValidationError::new(loc, "expected a string or a list of strings")),
    }
}

fn scalar(v: &JsonValue, loc: &str) -> VResult<Value> {
    match v {
        JsonValue::Bool(_) | JsonValue::Number(_) | JsonValue::String(_) => Ok(Value::from_json(v)),
        _ => Err(ValidationError::new(loc, "expected a string, number or boolean")),
    }
}

fn scalar_or_null(v: &JsonValue, loc: &str) -> VResult<Value> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    scalar(v, loc)
}

fn variable(v: &JsonValue, loc: &str) -> VResult<String> {
    let name = string(v, loc)?;
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return Err(ValidationError::new(loc, format!("\"{name}\" is not a valid variable name")));
    }
    Ok(name.to_string())
}

fn field_path(text: &str, loc: &str) -> VResult<FieldPath> {
    FieldPath::parse(text).map_err(|e| ValidationError::new(loc, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validation(raw: JsonValue) -> ValidationError {
        match parse(&raw) {
            Err(EngineError::Validation(e)) => e,
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn missing_find() {
        let err = validation(json!({"node_pattern": {"node_type": "drug"}}));
        assert_eq!(err.field, "find");
    }

    #[test]
    fn unknown_top_level_key_lists_allowed() {
        let err = validation(json!({"find": "nodes", "colour": "red"}));
        assert_eq!(err.field, "colour");
        assert!(err.allowed_fields.unwrap().contains(&"return_fields".to_string()));
    }

    #[test]
    fn unknown_pattern_key() {
        let err = validation(json!({"find": "nodes", "node_pattern": {"nodetype": "drug"}}));
        assert_eq!(err.field, "node_pattern.nodetype");
        assert!(err.allowed_fields.unwrap().contains(&"node_type".to_string()));
    }

    #[test]
    fn unknown_filter_key() {
        let err = validation(json!({
            "find": "nodes",
            "filters": [{"field": "n.name", "operator": "eq", "value": "x", "negate": true}]
        }));
        assert_eq!(err.field, "filters[0].negate");
    }

    #[test]
    fn min_confidence_range() {
        let err = validation(json!({
            "find": "edges",
            "edge_pattern": {"relation_type": "treats", "min_confidence": 1.2}
        }));
        assert_eq!(err.field, "edge_pattern.min_confidence");
    }

    #[test]
    fn unknown_operator() {
        let err = validation(json!({
            "find": "nodes",
            "filters": [{"field": "n.name", "operator": "like", "value": "x"}]
        }));
        assert_eq!(err.field, "filters[0].operator");
    }

    #[test]
    fn regex_length_is_bounded() {
        let long = "a".repeat(201);
        let err = validation(json!({
            "find": "nodes",
            "filters": [{"field": "n.name", "operator": "regex", "value": long}]
        }));
        assert_eq!(err.field, "filters[0].value");
    }

    #[test]
    fn max_hops_ceiling_enforced() {
        let err = validation(json!({
            "find": "paths",
            "path_pattern": {
                "start": {"node_type": "drug"},
                "edges": [[{"relation_type": "treats"}, {"node_type": "disease"}]],
                "max_hops": 50
            }
        }));
        assert_eq!(err.field, "path_pattern.max_hops");
    }

    #[test]
    fn anonymous_patterns_adopt_scenario_variables() {
        let q = parse(&json!({
            "find": "nodes",
            "node_pattern": {"node_type": "drug"},
            "edge_pattern": {"relation_type": "treats", "min_confidence": 0.7},
            "filters": [{"field": "target.name", "operator": "eq", "value": "breast cancer"}],
            "aggregate": {
                "group_by": ["drug.name"],
                "aggregations": {"paper_count": ["count", "treatment.evidence.paper_id"]}
            },
            "order_by": [["paper_count", "desc"]],
            "limit": 20
        }))
        .unwrap();
        assert_eq!(q.node_pattern.unwrap().var, "drug");
        assert_eq!(q.edge_pattern.unwrap().var, "treatment");
        assert_eq!(q.order_by[0].direction, SortDirection::Desc);
        assert_eq!(q.limit, Some(20));
    }

    #[test]
    fn defaults_when_nothing_references_patterns() {
        let q = parse(&json!({"find": "edges", "edge_pattern": {"relation_type": "treats"}})).unwrap();
        assert_eq!(q.edge_pattern.unwrap().var, "r");
    }

    #[test]
    fn unbound_root_is_a_resolution_error() {
        let err = parse(&json!({
            "find": "nodes",
            "node_pattern": {"node_type": "drug", "var": "drug"},
            "filters": [{"field": "ghost.name", "operator": "eq", "value": "x"}]
        }))
        .unwrap_err();
        assert_eq!(err.code(), "RESOLUTION_ERROR");
    }

    #[test]
    fn path_defaults_and_pair_forms() {
        let q = parse(&json!({
            "find": "paths",
            "path_pattern": {
                "start": {"node_type": "drug"},
                "edges": [
                    [{"relation_type": "inhibits"}, {"node_type": "protein"}],
                    {"edge": {"relation_type": "associated_with"}, "node": {"node_type": "disease", "var": "dx"}}
                ]
            },
            "return_fields": ["start.name", "node1.name", "dx.name", "edge1.relation_type", "path.length"]
        }))
        .unwrap();
        let pp = q.path_pattern.unwrap();
        assert_eq!(pp.start.var, "start");
        assert_eq!(pp.hops[0].edge.var, "edge0");
        assert_eq!(pp.hops[0].node.var, "node1");
        assert_eq!(pp.max_hops, 2);
        assert!(pp.avoid_cycles);
    }

    #[test]
    fn shortest_path_hides_intermediate_variables() {
        let err = parse(&json!({
            "find": "paths",
            "path_pattern": {
                "start": {"name": "aspirin"},
                "edges": [[{}, {}], [{}, {"node_type": "disease"}]],
                "shortest_path": true
            },
            "filters": [{"field": "node1.name", "operator": "eq", "value": "x"}]
        }))
        .unwrap_err();
        assert_eq!(err.code(), "RESOLUTION_ERROR");
    }

    #[test]
    fn aggregated_order_by_must_name_a_column() {
        let err = validation(json!({
            "find": "nodes",
            "node_pattern": {"var": "d"},
            "aggregate": {"group_by": ["d.name"], "aggregations": {"c": ["count", "*"]}},
            "order_by": [["d.id", "asc"]]
        }));
        assert_eq!(err.field, "order_by[0]");
    }

    #[test]
    fn subgraph_rejects_patterns() {
        let err = validation(json!({"find": "subgraph", "node_pattern": {}}));
        assert_eq!(err.field, "find");
    }

    #[test]
    fn duplicate_variable_rejected() {
        let err = validation(json!({
            "find": "nodes",
            "node_pattern": {"var": "x"},
            "edge_pattern": {"var": "x"}
        }));
        assert_eq!(err.field, "edge_pattern.var");
    }

    #[test]
    fn regex_cache_returns_equivalent_patterns() {
        let a = compile_regex("brca[12]").unwrap();
        let b = compile_regex("brca[12]").unwrap();
        assert_eq!(a.as_str(), b.as_str());
        assert!(a.is_match("BRCA1"));
    }
}
