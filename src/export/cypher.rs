//! Cypher rendering of validated queries, for delegated execution on a
//! property-graph database.
//!
//! The target schema mirrors the snapshot model: node labels are the
//! CamelCased node type, relationship types are the upper-cased relation
//! type, and every other field is a property of the same name.
//!
//! Some semantics only approximate the in-process engine:
//!
//! - name matching checks the canonical `name` property only, not synonyms
//! - relationship types match exactly rather than case-insensitively
//! - a path query without `all_paths` returns every instance, since Cypher has
//!   no "first path per start node" construct
//!
//! Evidence collections, external ids, subgraph queries and multi-hop
//! shortest-path templates have no counterpart and yield
//! [`ExportError::Unsupported`].

use std::fmt::Write as _;

use crate::error::ExportError;
use crate::exec::assemble::default_fields;
use crate::exec::value::Value;
use crate::graph::{Direction, NodeType};
use crate::query::field::Segment;
use crate::query::{
    AggFn, EdgePattern, FieldPath, Filter, FilterOp, FindKind, NodePattern, PATH, PathPattern, Query, SOURCE,
    SortDirection, TARGET,
};

type ExportResult<T> = Result<T, ExportError>;

fn unsupported<T>(construct: impl Into<String>) -> ExportResult<T> {
    Err(ExportError::Unsupported {
        construct: construct.into(),
    })
}

/// Render `query` as a single Cypher statement.
pub fn to_cypher(query: &Query) -> ExportResult<String> {
    let mut b = Builder::default();
    match query.find {
        FindKind::Nodes => b.nodes(query)?,
        FindKind::Edges => b.edges(query)?,
        FindKind::Paths => match &query.path_pattern {
            Some(pp) if pp.shortest_path => b.shortest(pp)?,
            Some(pp) => b.template(pp)?,
            None => return unsupported("a paths query without path_pattern"),
        },
        FindKind::Subgraph => return unsupported("subgraph queries"),
    }
    for filter in &query.filters {
        let cond = b.filter(filter)?;
        b.wheres.push(cond);
    }
    b.finish(query)
}

/// What a query variable names on the Cypher side.
#[derive(Debug, Clone)]
enum Ref {
    Node(String),
    Rel(String),
    Path(String),
    Scalar(String),
}

#[derive(Debug, Default)]
struct Builder {
    matches: Vec<String>,
    wheres: Vec<String>,
    aliases: Vec<(String, Ref)>,
}

impl Builder {
    fn alias(&mut self, name: &str, r: Ref) {
        self.aliases.push((name.to_string(), r));
    }

    fn lookup(&self, name: &str) -> Option<&Ref> {
        self.aliases.iter().find(|(n, _)| n == name).map(|(_, r)| r)
    }

    fn nodes(&mut self, query: &Query) -> ExportResult<()> {
        let default = NodePattern::default();
        let np = query.node_pattern.as_ref().unwrap_or(&default);
        let v = np.var.as_str();
        self.alias(v, Ref::Node(v.into()));

        let Some(ep) = &query.edge_pattern else {
            self.matches.push(node_pattern(v, np));
            return self.node_constraints(v, np);
        };
        let r = ep.var.as_str();
        self.alias(r, Ref::Rel(r.into()));
        let rel = rel_pattern(r, ep, "");
        let here = node_pattern(v, np);
        let line = match ep.direction {
            Direction::Outgoing => {
                self.alias(SOURCE, Ref::Node(v.into()));
                self.alias(TARGET, Ref::Node(TARGET.into()));
                format!("{here}-{rel}->({TARGET})")
            }
            Direction::Incoming => {
                self.alias(SOURCE, Ref::Node(SOURCE.into()));
                self.alias(TARGET, Ref::Node(v.into()));
                format!("({SOURCE})-{rel}->{here}")
            }
            Direction::Both => format!("{here}-{rel}-()"),
        };
        self.matches.push(line);
        self.node_constraints(v, np)?;
        self.edge_constraints(r, ep)
    }

    fn edges(&mut self, query: &Query) -> ExportResult<()> {
        let default = EdgePattern::default();
        let ep = query.edge_pattern.as_ref().unwrap_or(&default);
        let r = ep.var.as_str();
        self.alias(r, Ref::Rel(r.into()));
        self.alias(SOURCE, Ref::Node(SOURCE.into()));
        self.alias(TARGET, Ref::Node(TARGET.into()));
        let rel = rel_pattern(r, ep, "");
        self.matches.push(format!("({SOURCE})-{rel}->({TARGET})"));
        self.edge_constraints(r, ep)?;

        if let Some(np) = &query.node_pattern {
            let near = match ep.direction {
                Direction::Outgoing => SOURCE,
                Direction::Incoming => TARGET,
                Direction::Both => return unsupported("a node pattern on an undirected edge query"),
            };
            self.alias(&np.var, Ref::Node(near.into()));
            if let [only] = np.node_types.as_slice() {
                self.wheres.push(format!("{near}:{}", label(*only)));
            }
            self.node_constraints(near, np)?;
        }
        Ok(())
    }

    fn template(&mut self, pp: &PathPattern) -> ExportResult<()> {
        let start = pp.start.var.as_str();
        self.alias(start, Ref::Node(start.into()));
        let mut line = format!("{PATH} = {}", node_pattern(start, &pp.start));
        self.node_constraints(start, &pp.start)?;

        for hop in pp.template() {
            let (r, v) = (hop.edge.var.as_str(), hop.node.var.as_str());
            self.alias(r, Ref::Rel(r.into()));
            self.alias(v, Ref::Node(v.into()));
            let rel = rel_pattern(r, &hop.edge, "");
            let node = node_pattern(v, &hop.node);
            let _ = match hop.edge.direction {
                Direction::Outgoing => write!(line, "-{rel}->{node}"),
                Direction::Incoming => write!(line, "<-{rel}-{node}"),
                Direction::Both => write!(line, "-{rel}-{node}"),
            };
            self.edge_constraints(r, &hop.edge)?;
            self.node_constraints(v, &hop.node)?;
        }
        self.matches.push(line);
        self.alias(PATH, Ref::Path(PATH.into()));
        self.alias(SOURCE, Ref::Node(start.into()));
        self.alias(TARGET, Ref::Node(pp.end_var().into()));
        if pp.avoid_cycles {
            self.wheres.push(format!(
                "ALL(x IN nodes({PATH}) WHERE single(y IN nodes({PATH}) WHERE y = x))"
            ));
        }
        Ok(())
    }

    fn shortest(&mut self, pp: &PathPattern) -> ExportResult<()> {
        let [hop] = pp.hops.as_slice() else {
            return unsupported("shortest_path over a multi-hop template");
        };
        if !hop.edge.property_filters.is_empty() {
            return unsupported("edge property_filters inside shortest_path");
        }
        let (start, end) = (pp.start.var.as_str(), hop.node.var.as_str());
        self.alias(start, Ref::Node(start.into()));
        self.alias(end, Ref::Node(end.into()));
        self.alias(PATH, Ref::Path(PATH.into()));
        self.alias(SOURCE, Ref::Node(start.into()));
        self.alias(TARGET, Ref::Node(end.into()));

        let rel = rel_pattern("", &hop.edge, &format!("*1..{}", pp.max_hops));
        let (a, b) = (node_pattern(start, &pp.start), node_pattern(end, &hop.node));
        let body = match hop.edge.direction {
            Direction::Outgoing => format!("{a}-{rel}->{b}"),
            Direction::Incoming => format!("{a}<-{rel}-{b}"),
            Direction::Both => format!("{a}-{rel}-{b}"),
        };
        let func = if pp.all_paths { "allShortestPaths" } else { "shortestPath" };
        self.matches.push(format!("{PATH} = {func}({body})"));

        self.node_constraints(start, &pp.start)?;
        self.node_constraints(end, &hop.node)?;
        let mut rel_conds = Vec::new();
        if let Some(min) = hop.edge.min_confidence {
            rel_conds.push(format!("x.confidence >= {min}"));
        }
        if let Some(layer) = hop.edge.layer {
            rel_conds.push(format!("x.layer = '{}'", layer.as_str()));
        }
        if !rel_conds.is_empty() {
            self.wheres.push(format!(
                "ALL(x IN relationships({PATH}) WHERE {})",
                rel_conds.join(" AND ")
            ));
        }
        reject_evidence(&hop.edge)
    }

    fn node_constraints(&mut self, v: &str, np: &NodePattern) -> ExportResult<()> {
        if !np.external_id.is_empty() {
            return unsupported("external_id constraints");
        }
        if np.node_types.len() > 1 {
            let any: Vec<String> = np.node_types.iter().map(|t| format!("{v}:{}", label(*t))).collect();
            self.wheres.push(format!("({})", any.join(" OR ")));
        }
        if !np.names.is_empty() {
            let names: Vec<String> = np.names.iter().map(|n| quote(&n.to_lowercase())).collect();
            self.wheres.push(format!("toLower({v}.name) IN [{}]", names.join(", ")));
        }
        if let Some(re) = &np.name_pattern {
            self.wheres.push(format!("{v}.name =~ {}", regex_literal(re.as_str())));
        }
        if let Some(id) = &np.id {
            self.wheres.push(format!("{v}.id = {}", quote(id)));
        }
        for (key, lit) in &np.properties {
            self.wheres.push(equals(&format!("{v}.{key}"), lit)?);
        }
        for f in &np.property_filters {
            let expr = walk(Ref::Node(v.into()), f.field.segments(), f.field.as_str())?;
            self.wheres.push(condition(&expr, &f.op)?);
        }
        Ok(())
    }

    fn edge_constraints(&mut self, r: &str, ep: &EdgePattern) -> ExportResult<()> {
        reject_evidence(ep)?;
        if let Some(min) = ep.min_confidence {
            self.wheres.push(format!("{r}.confidence >= {min}"));
        }
        if let Some(layer) = ep.layer {
            self.wheres.push(format!("{r}.layer = '{}'", layer.as_str()));
        }
        for f in &ep.property_filters {
            let expr = walk(Ref::Rel(r.into()), f.field.segments(), f.field.as_str())?;
            self.wheres.push(condition(&expr, &f.op)?);
        }
        Ok(())
    }

    fn expr(&self, path: &FieldPath) -> ExportResult<String> {
        let Some(root) = self.lookup(path.root()) else {
            return unsupported(format!("`{}` (its variable has no Cypher binding)", path.as_str()));
        };
        walk(root.clone(), path.segments(), path.as_str())
    }

    fn filter(&self, filter: &Filter) -> ExportResult<String> {
        condition(&self.expr(&filter.field)?, &filter.op)
    }

    fn finish(&self, query: &Query) -> ExportResult<String> {
        let mut out = String::new();
        for m in &self.matches {
            let _ = writeln!(out, "MATCH {m}");
        }
        if !self.wheres.is_empty() {
            let _ = writeln!(out, "WHERE {}", self.wheres.join("\n  AND "));
        }

        let distinct = query.find == FindKind::Nodes && !query.is_aggregated();
        let projections = match &query.aggregate {
            Some(spec) => {
                let mut cols = Vec::new();
                for g in &spec.group_by {
                    cols.push(format!("{} AS {}", self.expr(g)?, column(g.as_str())));
                }
                for agg in &spec.aggregations {
                    let arg = match &agg.field {
                        Some(f) => self.expr(f)?,
                        None => "*".to_string(),
                    };
                    let call = match agg.function {
                        AggFn::Count => format!("count({arg})"),
                        AggFn::CountDistinct => format!("count(DISTINCT {arg})"),
                        AggFn::Sum => format!("sum({arg})"),
                        AggFn::Avg => format!("avg({arg})"),
                        AggFn::Min => format!("min({arg})"),
                        AggFn::Max => format!("max({arg})"),
                    };
                    cols.push(format!("{call} AS {}", column(&agg.name)));
                }
                cols
            }
            None => {
                let fields = match &query.return_fields {
                    Some(fields) => fields.clone(),
                    None => default_fields(query, true),
                };
                let mut cols = Vec::with_capacity(fields.len());
                for f in &fields {
                    cols.push(format!("{} AS {}", self.expr(f)?, column(f.as_str())));
                }
                cols
            }
        };
        let _ = writeln!(
            out,
            "RETURN {}{}",
            if distinct { "DISTINCT " } else { "" },
            projections.join(", ")
        );

        if !query.order_by.is_empty() {
            let mut keys = Vec::with_capacity(query.order_by.len());
            for key in &query.order_by {
                let target = if query.is_aggregated() {
                    column(key.field.as_str())
                } else {
                    self.expr(&key.field)?
                };
                let dir = match key.direction {
                    SortDirection::Asc => "ASC",
                    SortDirection::Desc => "DESC",
                };
                keys.push(format!("{target} {dir}"));
            }
            let _ = writeln!(out, "ORDER BY {}", keys.join(", "));
        }
        if query.offset > 0 {
            let _ = writeln!(out, "SKIP {}", query.offset);
        }
        if let Some(limit) = query.limit {
            let _ = writeln!(out, "LIMIT {limit}");
        }
        Ok(out.trim_end().to_string())
    }
}

fn reject_evidence(ep: &EdgePattern) -> ExportResult<()> {
    if ep.min_evidence_count.is_some() {
        return unsupported("min_evidence_count");
    }
    if !ep.require_evidence_from.is_empty() {
        return unsupported("require_evidence_from");
    }
    Ok(())
}

/// Render the segments of a field path starting from `start`.
fn walk(start: Ref, segments: &[Segment], raw: &str) -> ExportResult<String> {
    let mut cur = start;
    for seg in segments {
        if seg.predicate.is_some() {
            return unsupported(format!("the segment predicate in `{raw}`"));
        }
        let name = seg.name.as_str();
        cur = match cur {
            Ref::Node(v) => match name {
                "name_pattern" => Ref::Scalar(format!("{v}.name")),
                "type" => Ref::Scalar(format!("{v}.node_type")),
                "properties" => Ref::Node(v),
                "external_ids" => return unsupported(format!("`{raw}` (external ids)")),
                other => Ref::Scalar(format!("{v}.{other}")),
            },
            Ref::Rel(r) => match name {
                "relation_type" | "type" => Ref::Scalar(format!("type({r})")),
                "source" | "subject" => Ref::Node(format!("startNode({r})")),
                "target" | "object" => Ref::Node(format!("endNode({r})")),
                "subject_id" | "source_id" => Ref::Scalar(format!("startNode({r}).id")),
                "object_id" | "target_id" => Ref::Scalar(format!("endNode({r}).id")),
                "evidence" | "evidence_count" => return unsupported(format!("`{raw}` (evidence collections)")),
                "contradicted" => return unsupported(format!("`{raw}` (contradiction index)")),
                other => Ref::Scalar(format!("{r}.{other}")),
            },
            Ref::Path(p) => match name {
                "length" => Ref::Scalar(format!("length({p})")),
                "nodes" => Ref::Scalar(format!("nodes({p})")),
                "edges" => Ref::Scalar(format!("relationships({p})")),
                "node_ids" => Ref::Scalar(format!("[x IN nodes({p}) | x.id]")),
                "node_names" => Ref::Scalar(format!("[x IN nodes({p}) | x.name]")),
                "relation_types" => Ref::Scalar(format!("[x IN relationships({p}) | type(x)]")),
                "start" => Ref::Node(format!("nodes({p})[0]")),
                "end" => Ref::Node(format!("nodes({p})[-1]")),
                _ => return unsupported(format!("`{raw}`")),
            },
            Ref::Scalar(_) => return unsupported(format!("`{raw}` (nested scalar access)")),
        };
    }
    Ok(match cur {
        Ref::Node(s) | Ref::Rel(s) | Ref::Path(s) | Ref::Scalar(s) => s,
    })
}

fn condition(expr: &str, op: &FilterOp) -> ExportResult<String> {
    Ok(match op {
        FilterOp::Eq(Value::Null) => format!("{expr} IS NULL"),
        FilterOp::Ne(Value::Null) => format!("{expr} IS NOT NULL"),
        FilterOp::Eq(lit) => equals(expr, lit)?,
        FilterOp::Ne(Value::Text(s)) => format!("toLower({expr}) <> {}", quote(&s.to_lowercase())),
        FilterOp::Ne(lit) => format!("{expr} <> {}", literal(lit)?),
        FilterOp::Gt(lit) => format!("{expr} > {}", literal(lit)?),
        FilterOp::Gte(lit) => format!("{expr} >= {}", literal(lit)?),
        FilterOp::Lt(lit) => format!("{expr} < {}", literal(lit)?),
        FilterOp::Lte(lit) => format!("{expr} <= {}", literal(lit)?),
        FilterOp::In(lits) if lits.iter().all(|l| matches!(l, Value::Text(_))) => {
            let items: Vec<String> = lits
                .iter()
                .filter_map(Value::as_str)
                .map(|s| quote(&s.to_lowercase()))
                .collect();
            format!("toLower({expr}) IN [{}]", items.join(", "))
        }
        FilterOp::In(lits) => {
            let items = lits.iter().map(literal).collect::<ExportResult<Vec<_>>>()?;
            format!("{expr} IN [{}]", items.join(", "))
        }
        FilterOp::Contains(needle) => format!("toLower({expr}) CONTAINS {}", quote(needle)),
        FilterOp::Regex(re) => format!("{expr} =~ {}", regex_literal(re.as_str())),
    })
}

fn equals(expr: &str, lit: &Value) -> ExportResult<String> {
    Ok(match lit {
        Value::Text(s) => format!("toLower({expr}) = {}", quote(&s.to_lowercase())),
        other => format!("{expr} = {}", literal(other)?),
    })
}

fn literal(v: &Value) -> ExportResult<String> {
    Ok(match v {
        Value::Null | Value::Missing => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Text(s) => quote(s),
        Value::Date(d) => format!("date('{}')", d.format("%Y-%m-%d")),
        Value::Timestamp(t) => format!("datetime('{}')", t.to_rfc3339()),
        Value::List(items) => {
            let items = items.iter().map(literal).collect::<ExportResult<Vec<_>>>()?;
            format!("[{}]", items.join(", "))
        }
        Value::Record(_) => return unsupported("object literals"),
    })
}

/// Unanchored, case-insensitive regex, matching the engine's search semantics.
fn regex_literal(pattern: &str) -> String {
    quote(&format!("(?i).*(?:{pattern}).*"))
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn column(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn label(t: NodeType) -> String {
    t.as_str()
        .split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(c) => c.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

fn node_pattern(var: &str, np: &NodePattern) -> String {
    match np.node_types.as_slice() {
        [only] => format!("({var}:{})", label(*only)),
        _ => format!("({var})"),
    }
}

fn rel_pattern(var: &str, ep: &EdgePattern, length: &str) -> String {
    let types: Vec<String> = ep.relation_types.iter().map(|t| t.to_uppercase()).collect();
    if types.is_empty() {
        format!("[{var}{length}]")
    } else {
        format!("[{var}:{}{length}]", types.join("|"))
    }
}
