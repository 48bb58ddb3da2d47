//! Typed query AST.
//!
//! A [`Query`] is built once by [`parse::parse`] and consumed read-only by the
//! matcher, filter, aggregation and assembly stages, and by the Cypher export
//! adapter. Every pattern variable is already resolved to a concrete name
//! here, defaults and adopted names included.

pub mod field;
pub mod parse;

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;

use crate::exec::value::Value;
use crate::graph::{Direction, LayerKind, NodeType, StudyType};

pub use field::FieldPath;
pub use parse::{parse, parse_with_limits};

/// Alias for the subject node of the bound edge.
pub const SOURCE: &str = "source";
/// Alias for the object node of the bound edge.
pub const TARGET: &str = "target";
/// The bound path instance in `paths` queries.
pub const PATH: &str = "path";
/// Subgraph node variable.
pub const NODE: &str = "node";
/// Subgraph edge variable.
pub const EDGE: &str = "edge";

/// What a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindKind {
    Nodes,
    Edges,
    Paths,
    Subgraph,
}

impl FindKind {
    pub const ALL: [&'static str; 4] = ["nodes", "edges", "paths", "subgraph"];

    pub fn as_str(self) -> &'static str {
        match self {
            FindKind::Nodes => "nodes",
            FindKind::Edges => "edges",
            FindKind::Paths => "paths",
            FindKind::Subgraph => "subgraph",
        }
    }
}

impl fmt::Display for FindKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Constraints on a single node.
#[derive(Debug, Clone, Default)]
pub struct NodePattern {
    pub var: String,
    /// Empty means any type.
    pub node_types: Vec<NodeType>,
    /// Literal names; a node matches if any of them names it.
    pub names: Vec<String>,
    pub name_pattern: Option<Regex>,
    pub id: Option<String>,
    /// Ontology → identifier pairs that must all be present.
    pub external_id: BTreeMap<String, String>,
    /// Exact-equality property constraints.
    pub properties: BTreeMap<String, Value>,
    /// Filters whose paths are relative to the node.
    pub property_filters: Vec<Filter>,
}

/// Constraints on a single edge.
#[derive(Debug, Clone, Default)]
pub struct EdgePattern {
    pub var: String,
    /// Empty means any relation type.
    pub relation_types: Vec<String>,
    pub direction: Direction,
    pub min_confidence: Option<f64>,
    pub min_evidence_count: Option<usize>,
    /// The edge needs evidence from at least one of these study types.
    pub require_evidence_from: Vec<StudyType>,
    pub layer: Option<LayerKind>,
    /// Filters whose paths are relative to the edge.
    pub property_filters: Vec<Filter>,
}

/// One `(edge, node)` step of a path template.
#[derive(Debug, Clone, Default)]
pub struct Hop {
    pub edge: EdgePattern,
    pub node: NodePattern,
}

#[derive(Debug, Clone)]
pub struct PathPattern {
    pub start: NodePattern,
    pub hops: Vec<Hop>,
    pub max_hops: usize,
    pub avoid_cycles: bool,
    pub all_paths: bool,
    pub shortest_path: bool,
}

impl PathPattern {
    /// Number of hops a fixed-template match walks.
    pub fn template_len(&self) -> usize {
        self.hops.len().min(self.max_hops)
    }

    /// The hops a fixed-template match walks.
    pub fn template(&self) -> &[Hop] {
        &self.hops[..self.template_len()]
    }

    /// Variable of the node a path ends on.
    pub fn end_var(&self) -> &str {
        match self.template().last() {
            Some(hop) => &hop.node.var,
            None => &self.start.var,
        }
    }
}

/// Comparison operator together with its typed operand.
#[derive(Debug, Clone)]
pub enum FilterOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    /// Lower-cased needle.
    Contains(String),
    Regex(Regex),
}

impl FilterOp {
    pub const NAMES: [&'static str; 9] = ["eq", "ne", "gt", "gte", "lt", "lte", "in", "contains", "regex"];

    pub fn name(&self) -> &'static str {
        match self {
            FilterOp::Eq(_) => "eq",
            FilterOp::Ne(_) => "ne",
            FilterOp::Gt(_) => "gt",
            FilterOp::Gte(_) => "gte",
            FilterOp::Lt(_) => "lt",
            FilterOp::Lte(_) => "lte",
            FilterOp::In(_) => "in",
            FilterOp::Contains(_) => "contains",
            FilterOp::Regex(_) => "regex",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub field: FieldPath,
    pub op: FilterOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFn {
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFn {
    pub const NAMES: [&'static str; 6] = ["count", "count_distinct", "sum", "avg", "min", "max"];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "count" => Some(AggFn::Count),
            "count_distinct" => Some(AggFn::CountDistinct),
            "sum" => Some(AggFn::Sum),
            "avg" => Some(AggFn::Avg),
            "min" => Some(AggFn::Min),
            "max" => Some(AggFn::Max),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AggFn::Count => "count",
            AggFn::CountDistinct => "count_distinct",
            AggFn::Sum => "sum",
            AggFn::Avg => "avg",
            AggFn::Min => "min",
            AggFn::Max => "max",
        }
    }
}

/// One named output column of an aggregation.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub name: String,
    pub function: AggFn,
    /// `None` for `count` over `*` (rows rather than values).
    pub field: Option<FieldPath>,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateSpec {
    pub group_by: Vec<FieldPath>,
    pub aggregations: Vec<Aggregation>,
}

impl AggregateSpec {
    /// Column names an aggregated row carries, in output order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.group_by
            .iter()
            .map(FieldPath::as_str)
            .chain(self.aggregations.iter().map(|a| a.name.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Sort key. For raw queries `field` is a path into the bindings; for
/// aggregated queries its text names an output column.
#[derive(Debug, Clone)]
pub struct OrderKey {
    pub field: FieldPath,
    pub direction: SortDirection,
}

/// A validated query.
#[derive(Debug, Clone)]
pub struct Query {
    pub find: FindKind,
    pub node_pattern: Option<NodePattern>,
    pub edge_pattern: Option<EdgePattern>,
    pub path_pattern: Option<PathPattern>,
    pub filters: Vec<Filter>,
    pub aggregate: Option<AggregateSpec>,
    pub order_by: Vec<OrderKey>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub return_fields: Option<Vec<FieldPath>>,
}

impl Query {
    /// A bare query of the given kind with no patterns or clauses.
    pub fn new(find: FindKind) -> Self {
        Self {
            find,
            node_pattern: None,
            edge_pattern: None,
            path_pattern: None,
            filters: Vec::new(),
            aggregate: None,
            order_by: Vec::new(),
            limit: None,
            offset: 0,
            return_fields: None,
        }
    }

    pub fn is_aggregated(&self) -> bool {
        self.aggregate.is_some()
    }
}
