//! Pattern matching: turns node, edge and path patterns into binding
//! environments.
//!
//! Path matching walks a fixed-length template depth-first with an explicit
//! work stack, so the enumeration ceiling is a counter check rather than a
//! recursion limit. `shortest_path` switches to a breadth-first search.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::graph::{Direction, Edge, EdgeLayer, Node};
use crate::query::{
    EDGE, EdgePattern, Filter, FindKind, NODE, NodePattern, PATH, PathPattern, Query, SOURCE, TARGET,
};

use super::filter;
use super::resolve::{Bound, Env, PathBinding, Resolver};
use super::value::Value;

/// Binding environments that survived the query's filters.
#[derive(Debug, Default)]
pub struct MatchOutcome<'g> {
    pub envs: Vec<Env<'g>>,
    /// Path enumeration stopped at the instance ceiling.
    pub truncated: bool,
    /// Complete path instances enumerated, filtered or not.
    pub enumerated: usize,
}

/// Match `query` and apply its filters.
pub fn match_query<'g>(resolver: &Resolver<'g>, query: &Query, max_path_instances: usize) -> MatchOutcome<'g> {
    match query.find {
        FindKind::Nodes => match_nodes(resolver, query),
        FindKind::Edges => match_edges(resolver, query),
        FindKind::Paths => match &query.path_pattern {
            Some(pp) if pp.shortest_path => match_shortest(resolver, pp, &query.filters, max_path_instances),
            Some(pp) => match_template(resolver, pp, &query.filters, max_path_instances),
            None => MatchOutcome::default(),
        },
        FindKind::Subgraph => match_subgraph(resolver, &query.filters),
    }
}

/// Node-level constraints of a pattern.
pub fn node_matches<'g>(resolver: &Resolver<'g>, pattern: &NodePattern, node: &'g Node) -> bool {
    (pattern.node_types.is_empty() || pattern.node_types.contains(&node.node_type))
        && (pattern.names.is_empty() || pattern.names.iter().any(|n| node.is_named(n)))
        && pattern.name_pattern.as_ref().is_none_or(|re| re.is_match(&node.name))
        && pattern.id.as_ref().is_none_or(|id| *id == node.id)
        && pattern
            .external_id
            .iter()
            .all(|(k, v)| node.external_ids.get(k).is_some_and(|x| x.eq_ignore_ascii_case(v)))
        && pattern
            .properties
            .iter()
            .all(|(k, lit)| node.properties.get(k).is_some_and(|s| Value::from(s).loose_eq(lit) == Some(true)))
        && pattern
            .property_filters
            .iter()
            .all(|f| filter::matches(&f.op, &resolver.resolve_on(&Bound::Node(node), &f.field)))
}

/// Edge-level constraints of a pattern. Direction is handled by the caller.
pub fn edge_matches<'g>(resolver: &Resolver<'g>, pattern: &EdgePattern, edge: &'g Edge) -> bool {
    (pattern.relation_types.is_empty() || pattern.relation_types.iter().any(|r| edge.has_relation(r)))
        && pattern.min_confidence.is_none_or(|min| edge.confidence() >= min)
        && pattern.min_evidence_count.is_none_or(|min| edge.evidence.len() >= min)
        && (pattern.require_evidence_from.is_empty() || has_study_evidence(pattern, edge))
        && pattern.layer.is_none_or(|l| edge.layer_kind() == l)
        && pattern
            .property_filters
            .iter()
            .all(|f| filter::matches(&f.op, &resolver.resolve_on(&Bound::Edge(edge), &f.field)))
}

fn has_study_evidence(pattern: &EdgePattern, edge: &Edge) -> bool {
    let wanted = &pattern.require_evidence_from;
    let own = match &edge.layer {
        EdgeLayer::Evidence { study_type, .. } => wanted.contains(study_type),
        _ => false,
    };
    own || edge
        .evidence
        .iter()
        .any(|item| item.study_type.is_some_and(|st| wanted.contains(&st)))
}

fn candidates<'g>(resolver: &Resolver<'g>, pattern: &NodePattern) -> Vec<&'g Node> {
    resolver
        .snapshot()
        .nodes_of_types(&pattern.node_types)
        .into_iter()
        .filter(|&n| node_matches(resolver, pattern, n))
        .collect()
}

/// `(subject, object)` of `edge`, given that `near` is one of its endpoints and
/// `far` the other.
fn orient<'g>(edge: &Edge, near: &'g Node, far: &'g Node) -> (&'g Node, &'g Node) {
    if edge.subject_id == near.id {
        (near, far)
    } else {
        (far, near)
    }
}

fn match_nodes<'g>(resolver: &Resolver<'g>, query: &Query) -> MatchOutcome<'g> {
    let default = NodePattern::default();
    let np = query.node_pattern.as_ref().unwrap_or(&default);
    let snapshot = resolver.snapshot();
    let mut envs = Vec::new();

    for node in candidates(resolver, np) {
        let Some(ep) = &query.edge_pattern else {
            let env = Env::new().bind(&np.var, Bound::Node(node));
            if filter::apply_all(resolver, &query.filters, &env) {
                envs.push(env);
            }
            continue;
        };
        for (edge, far) in snapshot.neighbors(&node.id, ep.direction) {
            if !edge_matches(resolver, ep, edge) {
                continue;
            }
            let (subject, object) = orient(edge, node, far);
            let env = Env::new()
                .bind(&np.var, Bound::Node(node))
                .bind(&ep.var, Bound::Edge(edge))
                .bind(SOURCE, Bound::Node(subject))
                .bind(TARGET, Bound::Node(object));
            if filter::apply_all(resolver, &query.filters, &env) {
                envs.push(env);
            }
        }
    }
    tracing::debug!(bindings = envs.len(), "node pattern matched");
    MatchOutcome {
        envs,
        ..Default::default()
    }
}

fn match_edges<'g>(resolver: &Resolver<'g>, query: &Query) -> MatchOutcome<'g> {
    let default = EdgePattern::default();
    let ep = query.edge_pattern.as_ref().unwrap_or(&default);
    let mut envs = Vec::new();

    let hits = resolver
        .snapshot()
        .find_edges(|e| edge_matches(resolver, ep, e), Direction::Outgoing);
    for (edge, subject, object) in hits {
        let mut env = Env::new();
        if let Some(np) = &query.node_pattern {
            let near = match ep.direction {
                Direction::Outgoing => Some(subject).filter(|&n| node_matches(resolver, np, n)),
                Direction::Incoming => Some(object).filter(|&n| node_matches(resolver, np, n)),
                Direction::Both => [subject, object].into_iter().find(|&n| node_matches(resolver, np, n)),
            };
            let Some(near) = near else {
                continue;
            };
            env = env.bind(&np.var, Bound::Node(near));
        }
        let env = env
            .bind(&ep.var, Bound::Edge(edge))
            .bind(SOURCE, Bound::Node(subject))
            .bind(TARGET, Bound::Node(object));
        if filter::apply_all(resolver, &query.filters, &env) {
            envs.push(env);
        }
    }
    tracing::debug!(bindings = envs.len(), "edge pattern matched");
    MatchOutcome {
        envs,
        ..Default::default()
    }
}

fn path_env<'g>(pp: &PathPattern, nodes: &[&'g Node], edges: &[&'g Edge]) -> Env<'g> {
    let mut env = Env::new().bind(&pp.start.var, Bound::Node(nodes[0]));
    for (i, hop) in pp.hops.iter().take(edges.len()).enumerate() {
        env = env
            .bind(&hop.edge.var, Bound::Edge(edges[i]))
            .bind(&hop.node.var, Bound::Node(nodes[i + 1]));
    }
    path_aliases(env, nodes, edges)
}

fn path_aliases<'g>(env: Env<'g>, nodes: &[&'g Node], edges: &[&'g Edge]) -> Env<'g> {
    let binding = PathBinding {
        nodes: nodes.to_vec(),
        edges: edges.to_vec(),
    };
    let first = nodes[0];
    let last = nodes[nodes.len() - 1];
    env.bind(PATH, Bound::Path(Arc::new(binding)))
        .bind(SOURCE, Bound::Node(first))
        .bind(TARGET, Bound::Node(last))
}

/// One level of the depth-first work stack: the branches available from the
/// node at this depth and the next one to try.
struct Frame<'g> {
    branches: Vec<(&'g Edge, &'g Node)>,
    next: usize,
}

fn expand<'g>(resolver: &Resolver<'g>, pp: &PathPattern, depth: usize, from: &'g Node) -> Frame<'g> {
    let hop = &pp.hops[depth];
    let branches = resolver
        .snapshot()
        .neighbors(&from.id, hop.edge.direction)
        .into_iter()
        .filter(|&(edge, far)| edge_matches(resolver, &hop.edge, edge) && node_matches(resolver, &hop.node, far))
        .collect();
    Frame { branches, next: 0 }
}

/// Fixed-template depth-first enumeration.
///
/// Both complete instances and partial extensions count toward the budget, so
/// a template whose last hop never matches still terminates promptly.
fn match_template<'g>(
    resolver: &Resolver<'g>,
    pp: &PathPattern,
    filters: &[Filter],
    max_instances: usize,
) -> MatchOutcome<'g> {
    let len = pp.template_len();
    let mut outcome = MatchOutcome::default();
    if len == 0 {
        return outcome;
    }
    let step_budget = max_instances.saturating_mul(len);
    let mut steps = 0usize;

    'starts: for start in candidates(resolver, &pp.start) {
        let mut nodes: Vec<&'g Node> = vec![start];
        let mut edges: Vec<&'g Edge> = Vec::with_capacity(len);
        let mut stack = vec![expand(resolver, pp, 0, start)];

        while let Some(frame) = stack.last_mut() {
            let Some(&(edge, next)) = frame.branches.get(frame.next) else {
                stack.pop();
                if !edges.is_empty() {
                    edges.pop();
                    nodes.pop();
                }
                continue;
            };
            frame.next += 1;

            if pp.avoid_cycles && nodes.iter().any(|n| n.id == next.id) {
                continue;
            }
            steps += 1;
            if steps > step_budget {
                outcome.truncated = true;
                break 'starts;
            }

            edges.push(edge);
            nodes.push(next);
            if edges.len() < len {
                stack.push(expand(resolver, pp, edges.len(), next));
                continue;
            }

            outcome.enumerated += 1;
            let env = path_env(pp, &nodes, &edges);
            edges.pop();
            nodes.pop();
            let accepted = filter::apply_all(resolver, filters, &env);
            if accepted {
                outcome.envs.push(env);
            }
            if outcome.enumerated >= max_instances {
                outcome.truncated = true;
                break 'starts;
            }
            if accepted && !pp.all_paths {
                break;
            }
        }
    }

    if outcome.truncated {
        tracing::warn!(
            enumerated = outcome.enumerated,
            limit = max_instances,
            "path enumeration truncated"
        );
    }
    tracing::debug!(
        paths = outcome.envs.len(),
        enumerated = outcome.enumerated,
        "path template matched"
    );
    outcome
}

/// Breadth-first search per start node, bounded by `max_hops`.
///
/// A step may follow any hop of the template whose edge and node patterns
/// both hold. A node is a terminal when it satisfies the last hop's node
/// pattern. Without `all_paths` the nearest accepted terminal wins; with it,
/// one shortest path per distinct terminal is reported.
fn match_shortest<'g>(
    resolver: &Resolver<'g>,
    pp: &PathPattern,
    filters: &[Filter],
    max_instances: usize,
) -> MatchOutcome<'g> {
    let mut outcome = MatchOutcome::default();
    let Some(last) = pp.hops.last() else {
        return outcome;
    };
    let snapshot = resolver.snapshot();

    'starts: for start in candidates(resolver, &pp.start) {
        let mut visited: HashSet<&str> = HashSet::from([start.id.as_str()]);
        let mut parent: HashMap<&str, (&'g Edge, &'g Node)> = HashMap::new();
        let mut queue: VecDeque<(&'g Node, usize)> = VecDeque::from([(start, 0)]);

        while let Some((node, depth)) = queue.pop_front() {
            if depth >= pp.max_hops {
                continue;
            }
            for hop in &pp.hops {
                for (edge, far) in snapshot.neighbors(&node.id, hop.edge.direction) {
                    if visited.contains(far.id.as_str())
                        || !edge_matches(resolver, &hop.edge, edge)
                        || !node_matches(resolver, &hop.node, far)
                    {
                        continue;
                    }
                    visited.insert(far.id.as_str());
                    parent.insert(far.id.as_str(), (edge, node));
                    queue.push_back((far, depth + 1));

                    if !node_matches(resolver, &last.node, far) {
                        continue;
                    }
                    outcome.enumerated += 1;
                    let (nodes, edges) = trace_back(&parent, start, far);
                    let env = path_aliases(
                        Env::new()
                            .bind(&pp.start.var, Bound::Node(start))
                            .bind(&last.node.var, Bound::Node(far)),
                        &nodes,
                        &edges,
                    );
                    let accepted = filter::apply_all(resolver, filters, &env);
                    if accepted {
                        outcome.envs.push(env);
                    }
                    if outcome.enumerated >= max_instances {
                        outcome.truncated = true;
                        break 'starts;
                    }
                    if accepted && !pp.all_paths {
                        continue 'starts;
                    }
                }
            }
        }
    }

    if outcome.truncated {
        tracing::warn!(limit = max_instances, "shortest-path enumeration truncated");
    }
    outcome
}

fn trace_back<'g>(
    parent: &HashMap<&str, (&'g Edge, &'g Node)>,
    start: &'g Node,
    end: &'g Node,
) -> (Vec<&'g Node>, Vec<&'g Edge>) {
    let mut nodes = vec![end];
    let mut edges = Vec::new();
    let mut cursor = end;
    while cursor.id != start.id {
        let Some(&(edge, prev)) = parent.get(cursor.id.as_str()) else {
            break;
        };
        edges.push(edge);
        nodes.push(prev);
        cursor = prev;
    }
    nodes.reverse();
    edges.reverse();
    (nodes, edges)
}

/// Induced subgraph: nodes passing the `node.*` filters, then edges passing
/// the remaining filters whose endpoints are both selected.
fn match_subgraph<'g>(resolver: &Resolver<'g>, filters: &[Filter]) -> MatchOutcome<'g> {
    let (node_filters, edge_filters): (Vec<Filter>, Vec<Filter>) =
        filters.iter().cloned().partition(|f| f.field.root() == NODE);
    let snapshot = resolver.snapshot();

    let mut envs = Vec::new();
    let mut selected: HashSet<&str> = HashSet::new();
    for node in snapshot.nodes() {
        let env = Env::new().bind(NODE, Bound::Node(node));
        if filter::apply_all(resolver, &node_filters, &env) {
            selected.insert(node.id.as_str());
            envs.push(env);
        }
    }
    let node_count = envs.len();

    for edge in snapshot.edges() {
        if !selected.contains(edge.subject_id.as_str()) || !selected.contains(edge.object_id.as_str()) {
            continue;
        }
        let (Some(subject), Some(object)) = (snapshot.get_node(&edge.subject_id), snapshot.get_node(&edge.object_id))
        else {
            continue;
        };
        let env = Env::new()
            .bind(EDGE, Bound::Edge(edge))
            .bind(SOURCE, Bound::Node(subject))
            .bind(TARGET, Bound::Node(object));
        if filter::apply_all(resolver, &edge_filters, &env) {
            envs.push(env);
        }
    }
    tracing::debug!(nodes = node_count, edges = envs.len() - node_count, "subgraph collected");
    MatchOutcome {
        envs,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphSnapshot, NodeType, SnapshotDocument};
    use crate::query::parse;
    use serde_json::json;

    fn extraction(id: &str, s: &str, rel: &str, o: &str) -> Edge {
        Edge::new(
            id,
            s,
            rel,
            o,
            EdgeLayer::Extraction {
                extractor_name: "test".into(),
                extraction_confidence: 0.8,
            },
        )
    }

    /// aspirin -inhibits-> COX1 -regulates-> inflammation
    /// aspirin -inhibits-> COX2 -regulates-> inflammation
    /// COX2 -regulates-> pain, pain -associated_with-> aspirin
    fn snapshot() -> GraphSnapshot {
        GraphSnapshot::build(SnapshotDocument {
            nodes: vec![
                Node::new("D1", NodeType::Drug, "aspirin"),
                Node::new("P1", NodeType::Protein, "COX1"),
                Node::new("P2", NodeType::Protein, "COX2"),
                Node::new("X1", NodeType::Disease, "inflammation"),
                Node::new("S1", NodeType::Symptom, "pain"),
            ],
            edges: vec![
                extraction("e1", "D1", "inhibits", "P1"),
                extraction("e2", "D1", "inhibits", "P2"),
                extraction("e3", "P1", "regulates", "X1"),
                extraction("e4", "P2", "regulates", "X1"),
                extraction("e5", "P2", "regulates", "S1"),
                extraction("e6", "S1", "associated_with", "D1"),
            ],
        })
        .unwrap()
    }

    fn run<'g>(snap: &'g GraphSnapshot, raw: serde_json::Value) -> MatchOutcome<'g> {
        let query = parse(&raw).unwrap();
        match_query(&Resolver::new(snap), &query, 10_000)
    }

    fn ids(outcome: &MatchOutcome<'_>, var: &str) -> Vec<String> {
        outcome
            .envs
            .iter()
            .map(|env| match env.get(var) {
                Some(Bound::Node(n)) => n.id.clone(),
                Some(Bound::Edge(e)) => e.id.clone(),
                _ => String::new(),
            })
            .collect()
    }

    #[test]
    fn name_pattern_is_case_insensitive_search() {
        let snap = snapshot();
        let out = run(&snap, json!({"find": "nodes", "node_pattern": {"name_pattern": "^cox"}}));
        assert_eq!(ids(&out, "n"), vec!["P1", "P2"]);

        let out = run(&snap, json!({"find": "nodes", "node_pattern": {"name_pattern": "FLAM"}}));
        assert_eq!(ids(&out, "n"), vec!["X1"]);

        let out = run(
            &snap,
            json!({"find": "nodes", "node_pattern": {"name_pattern": "2$", "node_type": "drug"}}),
        );
        assert!(out.envs.is_empty());
    }

    #[test]
    fn empty_hop_list_matches_nothing() {
        let snap = snapshot();
        let mut query = parse(&json!({
            "find": "paths",
            "path_pattern": {"start": {"name": "aspirin"}, "edges": [[{}, {}]]}
        }))
        .unwrap();
        if let Some(pp) = query.path_pattern.as_mut() {
            pp.hops.clear();
        }
        let out = match_query(&Resolver::new(&snap), &query, 10_000);
        assert!(out.envs.is_empty());
        assert!(!out.truncated);
    }

    #[test]
    fn node_pattern_with_name_list() {
        let snap = snapshot();
        let out = run(
            &snap,
            json!({"find": "nodes", "node_pattern": {"name": ["PAIN", "inflammation", "fever"]}}),
        );
        assert_eq!(ids(&out, "n"), vec!["X1", "S1"]);
    }

    #[test]
    fn edge_direction_incoming() {
        let snap = snapshot();
        let out = run(
            &snap,
            json!({
                "find": "nodes",
                "node_pattern": {"var": "x", "node_type": "disease"},
                "edge_pattern": {"var": "r", "direction": "incoming"}
            }),
        );
        assert_eq!(ids(&out, "r"), vec!["e3", "e4"]);
        assert_eq!(ids(&out, SOURCE), vec!["P1", "P2"]);
        assert_eq!(ids(&out, TARGET), vec!["X1", "X1"]);
    }

    #[test]
    fn edge_direction_both_unions() {
        let snap = snapshot();
        let out = run(
            &snap,
            json!({
                "find": "nodes",
                "node_pattern": {"name": "aspirin"},
                "edge_pattern": {"direction": "both"}
            }),
        );
        assert_eq!(ids(&out, "r"), vec!["e1", "e2", "e6"]);
    }

    #[test]
    fn edges_find_binds_near_node() {
        let snap = snapshot();
        let out = run(
            &snap,
            json!({
                "find": "edges",
                "node_pattern": {"var": "p", "node_type": "protein"},
                "edge_pattern": {"relation_type": "REGULATES"}
            }),
        );
        assert_eq!(ids(&out, "r"), vec!["e3", "e4", "e5"]);
        assert_eq!(ids(&out, "p"), vec!["P1", "P2", "P2"]);
    }

    #[test]
    fn first_path_per_start_by_default() {
        let snap = snapshot();
        let raw = json!({
            "find": "paths",
            "path_pattern": {
                "start": {"name": "aspirin"},
                "edges": [[{"relation_type": "inhibits"}, {"node_type": "protein"}],
                          [{"relation_type": "regulates"}, {"node_type": "disease"}]]
            }
        });
        let out = run(&snap, raw.clone());
        assert_eq!(ids(&out, "node1"), vec!["P1"]);

        let mut all = raw;
        all["path_pattern"]["all_paths"] = json!(true);
        let out = run(&snap, all);
        assert_eq!(ids(&out, "node1"), vec!["P1", "P2"]);
        assert_eq!(ids(&out, "node2"), vec!["X1", "X1"]);
    }

    #[test]
    fn filters_apply_before_first_path_selection() {
        let snap = snapshot();
        let out = run(
            &snap,
            json!({
                "find": "paths",
                "path_pattern": {
                    "start": {"name": "aspirin"},
                    "edges": [[{}, {"node_type": "protein"}], [{}, {"node_type": "disease"}]]
                },
                "filters": [{"field": "node1.name", "operator": "eq", "value": "cox2"}]
            }),
        );
        assert_eq!(ids(&out, "node1"), vec!["P2"]);
    }

    #[test]
    fn avoid_cycles_blocks_revisits() {
        let snap = snapshot();
        let template = |avoid: bool| {
            json!({
                "find": "paths",
                "path_pattern": {
                    "start": {"name": "aspirin"},
                    "edges": [[{}, {}], [{}, {}], [{}, {}], [{}, {}]],
                    "all_paths": true,
                    "avoid_cycles": avoid
                }
            })
        };
        let acyclic = run(&snap, template(true));
        assert!(acyclic.envs.is_empty());
        let cyclic = run(&snap, template(false));
        assert_eq!(ids(&cyclic, "node3"), vec!["D1", "D1"]);
        assert_eq!(ids(&cyclic, "node4"), vec!["P1", "P2"]);
    }

    #[test]
    fn max_hops_truncates_template() {
        let snap = snapshot();
        let out = run(
            &snap,
            json!({
                "find": "paths",
                "path_pattern": {
                    "start": {"name": "aspirin"},
                    "edges": [[{}, {}], [{}, {}]],
                    "max_hops": 1,
                    "all_paths": true
                },
                "return_fields": ["path.length"]
            }),
        );
        assert_eq!(out.envs.len(), 2);
    }

    #[test]
    fn enumeration_ceiling_sets_truncated() {
        let snap = snapshot();
        let query = parse(&json!({
            "find": "paths",
            "path_pattern": {"start": {}, "edges": [[{"direction": "both"}, {}]], "all_paths": true}
        }))
        .unwrap();
        let out = match_query(&Resolver::new(&snap), &query, 3);
        assert!(out.truncated);
        assert_eq!(out.enumerated, 3);
        assert_eq!(out.envs.len(), 3);
    }

    #[test]
    fn shortest_path_finds_nearest_terminal() {
        let snap = snapshot();
        let out = run(
            &snap,
            json!({
                "find": "paths",
                "path_pattern": {
                    "start": {"name": "aspirin"},
                    "edges": [[{}, {}], [{}, {"node_type": "symptom", "var": "sym"}]],
                    "max_hops": 4,
                    "shortest_path": true
                }
            }),
        );
        assert_eq!(ids(&out, "sym"), vec!["S1"]);
        match out.envs[0].get(PATH) {
            Some(Bound::Path(p)) => assert_eq!(p.edges.len(), 2),
            other => panic!("expected a path binding, got {other:?}"),
        }
    }

    #[test]
    fn subgraph_is_induced() {
        let snap = snapshot();
        let out = run(
            &snap,
            json!({
                "find": "subgraph",
                "filters": [
                    {"field": "node.node_type", "operator": "in", "value": ["drug", "protein"]},
                    {"field": "edge.relation_type", "operator": "eq", "value": "inhibits"}
                ]
            }),
        );
        let nodes: Vec<_> = out.envs.iter().filter(|e| e.contains(NODE)).collect();
        assert_eq!(nodes.len(), 3);
        let edges: Vec<_> = ids(&out, EDGE).into_iter().filter(|id| !id.is_empty()).collect();
        assert_eq!(edges, vec!["e1", "e2"]);
    }
}
