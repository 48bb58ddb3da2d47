//! Immutable graph snapshots and the atomic store that swaps them.
//!
//! A [`GraphSnapshot`] is built once from a [`SnapshotDocument`], validated, and
//! never mutated afterwards. Queries hold an `Arc` to the snapshot they started
//! on, so [`GraphStore::replace`] never exposes a half-built graph.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::error::GraphError;

use super::confidence::effective_confidence;
use super::contradiction::{ContradictionGroup, find_contradictions};
use super::{Direction, Edge, EdgeLayer, EvidenceItem, LayerKind, Node, NodeType};

/// Result type for snapshot operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// On-disk snapshot format: `{"nodes": [...], "edges": [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotDocument {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Counts reported by `medgraph stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotStats {
    pub nodes: usize,
    pub edges: usize,
    pub nodes_by_type: BTreeMap<String, usize>,
    pub edges_by_layer: BTreeMap<String, usize>,
    pub contradiction_groups: usize,
}

/// A validated, read-only knowledge graph.
///
/// Adjacency lists are kept per node in edge insertion order, which is the
/// order the path matcher expands branches in.
#[derive(Debug)]
pub struct GraphSnapshot {
    graph: DiGraph<Node, Edge>,
    node_index: HashMap<String, NodeIndex>,
    edge_index: HashMap<String, EdgeIndex>,
    type_index: HashMap<NodeType, Vec<NodeIndex>>,
    outgoing: Vec<Vec<EdgeIndex>>,
    incoming: Vec<Vec<EdgeIndex>>,
    incident: Vec<Vec<EdgeIndex>>,
    contradictions: Vec<ContradictionGroup>,
    /// Claim edge id → index into `contradictions`.
    contradicted: HashMap<String, usize>,
}

impl Default for GraphSnapshot {
    fn default() -> Self {
        Self {
            graph: DiGraph::new(),
            node_index: HashMap::new(),
            edge_index: HashMap::new(),
            type_index: HashMap::new(),
            outgoing: Vec::new(),
            incoming: Vec::new(),
            incident: Vec::new(),
            contradictions: Vec::new(),
            contradicted: HashMap::new(),
        }
    }
}

impl GraphSnapshot {
    /// Validate a document and build the snapshot.
    ///
    /// Linked evidence (`supports`) is merged into the supported edge before
    /// confidences are derived, so every edge carries its final effective
    /// confidence once the snapshot exists.
    pub fn build(doc: SnapshotDocument) -> GraphResult<Self> {
        let SnapshotDocument { nodes, mut edges } = doc;
        let mut snapshot = Self::default();

        for node in nodes {
            if snapshot.node_index.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode { id: node.id });
            }
            let id = node.id.clone();
            let node_type = node.node_type;
            let idx = snapshot.graph.add_node(node);
            snapshot.node_index.insert(id, idx);
            snapshot.type_index.entry(node_type).or_default().push(idx);
            snapshot.outgoing.push(Vec::new());
            snapshot.incoming.push(Vec::new());
            snapshot.incident.push(Vec::new());
        }

        let mut position: HashMap<String, usize> = HashMap::with_capacity(edges.len());
        for (i, edge) in edges.iter().enumerate() {
            if position.insert(edge.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateEdge { id: edge.id.clone() });
            }
            for endpoint in [&edge.subject_id, &edge.object_id] {
                if !snapshot.node_index.contains_key(endpoint) {
                    return Err(GraphError::DanglingEdge {
                        edge_id: edge.id.clone(),
                        node_id: endpoint.clone(),
                    });
                }
            }
            check_scores(edge)?;
        }

        merge_linked_evidence(&mut edges, &position)?;

        for edge in &mut edges {
            if matches!(edge.layer_kind(), LayerKind::Claim | LayerKind::Extraction)
                && !edge.evidence.is_empty()
                && edge.paper_ids().next().is_none()
            {
                return Err(GraphError::EvidenceWithoutPaper {
                    edge_id: edge.id.clone(),
                });
            }
            edge.confidence = Some(effective_confidence(edge));
        }

        for edge in edges {
            let (Some(&subject), Some(&object)) = (
                snapshot.node_index.get(&edge.subject_id),
                snapshot.node_index.get(&edge.object_id),
            ) else {
                continue;
            };
            let id = edge.id.clone();
            let idx = snapshot.graph.add_edge(subject, object, edge);
            snapshot.edge_index.insert(id, idx);
            snapshot.outgoing[subject.index()].push(idx);
            snapshot.incoming[object.index()].push(idx);
            snapshot.incident[subject.index()].push(idx);
            if subject != object {
                snapshot.incident[object.index()].push(idx);
            }
        }

        snapshot.contradictions = find_contradictions(snapshot.graph.edge_weights());
        for (group_idx, group) in snapshot.contradictions.iter().enumerate() {
            for edge_id in group.edge_ids() {
                snapshot.contradicted.insert(edge_id.to_string(), group_idx);
            }
        }

        tracing::info!(
            nodes = snapshot.node_count(),
            edges = snapshot.edge_count(),
            contradictions = snapshot.contradictions.len(),
            "graph snapshot built"
        );
        Ok(snapshot)
    }

    /// Parse and build from snapshot JSON text.
    pub fn from_json(text: &str) -> GraphResult<Self> {
        let doc: SnapshotDocument = serde_json::from_str(text).map_err(|e| GraphError::Parse {
            message: e.to_string(),
        })?;
        Self::build(doc)
    }

    /// Read and build a snapshot file.
    pub fn load(path: &Path) -> GraphResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| GraphError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_json(&text)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All nodes, in load order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// All edges, in load order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.graph.edge_weights()
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.node_index.get(id).map(|&idx| &self.graph[idx])
    }

    pub fn get_edge(&self, id: &str) -> Option<&Edge> {
        self.edge_index.get(id).map(|&idx| &self.graph[idx])
    }

    /// Nodes satisfying `predicate`, in load order.
    pub fn find_nodes<'s>(&'s self, predicate: impl Fn(&'s Node) -> bool) -> Vec<&'s Node> {
        self.nodes().filter(|&n| predicate(n)).collect()
    }

    /// Nodes of one of `types`, in load order. An empty slice means any type.
    pub fn nodes_of_types(&self, types: &[NodeType]) -> Vec<&Node> {
        match types {
            [] => self.nodes().collect(),
            [only] => self
                .type_index
                .get(only)
                .map(|ids| ids.iter().map(|&idx| &self.graph[idx]).collect())
                .unwrap_or_default(),
            _ => self.find_nodes(|n| types.contains(&n.node_type)),
        }
    }

    /// Edges satisfying `predicate`, oriented by `direction`.
    ///
    /// Each hit is returned as `(edge, near, far)`: for `Outgoing` the near
    /// endpoint is the subject, for `Incoming` the object. `Both` yields each
    /// edge in both orientations, except self-loops which appear once.
    pub fn find_edges<'s>(
        &'s self,
        predicate: impl Fn(&'s Edge) -> bool,
        direction: Direction,
    ) -> Vec<(&'s Edge, &'s Node, &'s Node)> {
        let mut hits = Vec::new();
        for idx in self.graph.edge_indices() {
            let edge = &self.graph[idx];
            if !predicate(edge) {
                continue;
            }
            let Some((s, o)) = self.graph.edge_endpoints(idx) else {
                continue;
            };
            let (subject, object) = (&self.graph[s], &self.graph[o]);
            match direction {
                Direction::Outgoing => hits.push((edge, subject, object)),
                Direction::Incoming => hits.push((edge, object, subject)),
                Direction::Both => {
                    hits.push((edge, subject, object));
                    if s != o {
                        hits.push((edge, object, subject));
                    }
                }
            }
        }
        hits
    }

    /// Edges incident to `node_id` in `direction`, each paired with the node at
    /// the far end. Insertion order; unknown ids yield nothing.
    pub fn neighbors(&self, node_id: &str, direction: Direction) -> Vec<(&Edge, &Node)> {
        let Some(&idx) = self.node_index.get(node_id) else {
            return Vec::new();
        };
        let list = match direction {
            Direction::Outgoing => &self.outgoing[idx.index()],
            Direction::Incoming => &self.incoming[idx.index()],
            Direction::Both => &self.incident[idx.index()],
        };
        list.iter()
            .filter_map(|&e| {
                let (s, o) = self.graph.edge_endpoints(e)?;
                let far = if s == idx { o } else { s };
                Some((&self.graph[e], &self.graph[far]))
            })
            .collect()
    }

    /// All contradiction groups in the snapshot.
    pub fn contradictions(&self) -> &[ContradictionGroup] {
        &self.contradictions
    }

    /// The contradiction group a claim edge belongs to, if any.
    pub fn contradiction_of(&self, edge_id: &str) -> Option<(usize, &ContradictionGroup)> {
        let &idx = self.contradicted.get(edge_id)?;
        self.contradictions.get(idx).map(|g| (idx, g))
    }

    pub fn stats(&self) -> SnapshotStats {
        let mut nodes_by_type = BTreeMap::new();
        for node in self.nodes() {
            *nodes_by_type.entry(node.node_type.to_string()).or_insert(0) += 1;
        }
        let mut edges_by_layer = BTreeMap::new();
        for edge in self.edges() {
            *edges_by_layer
                .entry(edge.layer_kind().as_str().to_string())
                .or_insert(0) += 1;
        }
        SnapshotStats {
            nodes: self.node_count(),
            edges: self.edge_count(),
            nodes_by_type,
            edges_by_layer,
            contradiction_groups: self.contradictions.len(),
        }
    }
}

fn check_scores(edge: &Edge) -> GraphResult<()> {
    let mut scores: Vec<(&'static str, f64)> = Vec::with_capacity(2);
    if let Some(c) = edge.confidence {
        scores.push(("confidence", c));
    }
    match &edge.layer {
        EdgeLayer::Extraction {
            extraction_confidence,
            ..
        } => scores.push(("extraction_confidence", *extraction_confidence)),
        EdgeLayer::Evidence {
            evidence_strength, ..
        } => scores.push(("evidence_strength", *evidence_strength)),
        EdgeLayer::Claim { .. } => {}
    }
    for (field, value) in scores {
        if !(0.0..=1.0).contains(&value) {
            return Err(GraphError::ScoreOutOfRange {
                edge_id: edge.id.clone(),
                field,
                value,
            });
        }
    }
    Ok(())
}

/// Append every evidence edge carrying `supports` to the supported edge's
/// evidence list, in document order.
fn merge_linked_evidence(edges: &mut [Edge], position: &HashMap<String, usize>) -> GraphResult<()> {
    let mut links: Vec<(usize, EvidenceItem)> = Vec::new();
    for edge in edges.iter() {
        let EdgeLayer::Evidence {
            study_type,
            sample_size,
            paper_id,
            supports: Some(target),
            ..
        } = &edge.layer
        else {
            continue;
        };
        let Some(&target_pos) = position.get(target) else {
            return Err(GraphError::DanglingEvidenceLink {
                edge_id: edge.id.clone(),
                target_id: target.clone(),
            });
        };
        links.push((
            target_pos,
            EvidenceItem {
                paper_id: Some(paper_id.clone()),
                study_type: Some(*study_type),
                sample_size: Some(*sample_size),
                paper_publication_date: None,
                measurement: None,
            },
        ));
    }
    for (target_pos, item) in links {
        edges[target_pos].evidence.push(item);
    }
    Ok(())
}

/// Holder of the live snapshot.
///
/// Readers clone the `Arc` and release the lock immediately; a refresh builds
/// the new snapshot off-lock and swaps the reference.
#[derive(Debug, Default)]
pub struct GraphStore {
    current: RwLock<Arc<GraphSnapshot>>,
}

impl GraphStore {
    pub fn new(snapshot: GraphSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// The snapshot queries should run against right now.
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Atomically install `snapshot`, returning the one it replaced.
    /// In-flight queries keep the previous snapshot until they finish.
    pub fn replace(&self, snapshot: GraphSnapshot) -> Arc<GraphSnapshot> {
        let next = Arc::new(snapshot);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let previous = std::mem::replace(&mut *guard, next);
        tracing::warn!(
            previous_nodes = previous.node_count(),
            nodes = guard.node_count(),
            edges = guard.edge_count(),
            "graph snapshot replaced"
        );
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Polarity, StudyType};

    fn claim(id: &str, s: &str, o: &str, paper: &str, polarity: Polarity) -> Edge {
        Edge::new(
            id,
            s,
            "treats",
            o,
            EdgeLayer::Claim {
                predicate: "treats".into(),
                asserted_by: paper.into(),
                polarity,
            },
        )
    }

    fn sample() -> SnapshotDocument {
        SnapshotDocument {
            nodes: vec![
                Node::new("D1", NodeType::Drug, "tamoxifen"),
                Node::new("X1", NodeType::Disease, "breast cancer"),
                Node::new("G1", NodeType::Gene, "BRCA1"),
            ],
            edges: vec![
                claim("c1", "D1", "X1", "PMC1", Polarity::Supports).with_confidence(0.9),
                claim("c2", "D1", "X1", "PMC2", Polarity::Refutes).with_confidence(0.4),
                Edge::new(
                    "x1",
                    "G1",
                    "associated_with",
                    "X1",
                    EdgeLayer::Extraction {
                        extractor_name: "llm".into(),
                        extraction_confidence: 0.65,
                    },
                ),
            ],
        }
    }

    #[test]
    fn build_indexes_and_derives() {
        let snap = GraphSnapshot::build(sample()).unwrap();
        assert_eq!(snap.node_count(), 3);
        assert_eq!(snap.edge_count(), 3);
        assert_eq!(snap.get_node("G1").unwrap().name, "BRCA1");
        assert_eq!(snap.get_edge("x1").unwrap().confidence(), 0.65);
        assert_eq!(snap.nodes_of_types(&[NodeType::Drug]).len(), 1);
        assert_eq!(snap.contradictions().len(), 1);
        assert!(snap.contradiction_of("c2").is_some());
        assert!(snap.contradiction_of("x1").is_none());
    }

    #[test]
    fn neighbors_follow_insertion_order() {
        let snap = GraphSnapshot::build(sample()).unwrap();
        let out: Vec<_> = snap
            .neighbors("D1", Direction::Outgoing)
            .into_iter()
            .map(|(e, _)| e.id.as_str())
            .collect();
        assert_eq!(out, vec!["c1", "c2"]);

        let inc: Vec<_> = snap
            .neighbors("X1", Direction::Incoming)
            .into_iter()
            .map(|(e, n)| (e.id.as_str(), n.id.as_str()))
            .collect();
        assert_eq!(inc, vec![("c1", "D1"), ("c2", "D1"), ("x1", "G1")]);
        assert!(snap.neighbors("nope", Direction::Both).is_empty());
    }

    #[test]
    fn find_edges_orients_by_direction() {
        let snap = GraphSnapshot::build(sample()).unwrap();
        let hits = snap.find_edges(|e| e.has_relation("ASSOCIATED_WITH"), Direction::Both);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].1.id, "G1");
        assert_eq!(hits[1].1.id, "X1");
    }

    #[test]
    fn duplicate_node_rejected() {
        let mut doc = sample();
        doc.nodes.push(Node::new("D1", NodeType::Drug, "again"));
        assert!(matches!(
            GraphSnapshot::build(doc),
            Err(GraphError::DuplicateNode { .. })
        ));
    }

    #[test]
    fn dangling_edge_rejected() {
        let mut doc = sample();
        doc.edges.push(claim("c9", "D1", "ghost", "PMC9", Polarity::Supports));
        assert!(matches!(
            GraphSnapshot::build(doc),
            Err(GraphError::DanglingEdge { .. })
        ));
    }

    #[test]
    fn out_of_range_confidence_rejected() {
        let mut doc = sample();
        doc.edges[0].confidence = Some(1.5);
        assert!(matches!(
            GraphSnapshot::build(doc),
            Err(GraphError::ScoreOutOfRange { field: "confidence", .. })
        ));
    }

    #[test]
    fn evidence_without_paper_rejected() {
        let mut doc = sample();
        doc.edges[2].evidence.push(EvidenceItem::default());
        assert!(matches!(
            GraphSnapshot::build(doc),
            Err(GraphError::EvidenceWithoutPaper { .. })
        ));
    }

    #[test]
    fn linked_evidence_is_merged() {
        let mut doc = sample();
        doc.edges[2].confidence = None;
        doc.edges.push(Edge::new(
            "ev1",
            "G1",
            "associated_with",
            "X1",
            EdgeLayer::Evidence {
                evidence_type: "genetic".into(),
                evidence_strength: 0.8,
                study_type: StudyType::Cohort,
                sample_size: 4000,
                text_span: "carriers showed elevated risk".into(),
                paper_id: "PMC7".into(),
                supports: Some("x1".into()),
            },
        ));
        let snap = GraphSnapshot::build(doc).unwrap();
        let x1 = snap.get_edge("x1").unwrap();
        assert_eq!(x1.paper_ids().collect::<Vec<_>>(), vec!["PMC7"]);
        assert_eq!(x1.confidence(), 0.8);
    }

    #[test]
    fn dangling_evidence_link_rejected() {
        let mut doc = sample();
        doc.edges.push(Edge::new(
            "ev1",
            "G1",
            "associated_with",
            "X1",
            EdgeLayer::Evidence {
                evidence_type: "genetic".into(),
                evidence_strength: 0.8,
                study_type: StudyType::Cohort,
                sample_size: 10,
                text_span: "".into(),
                paper_id: "PMC7".into(),
                supports: Some("missing".into()),
            },
        ));
        assert!(matches!(
            GraphSnapshot::build(doc),
            Err(GraphError::DanglingEvidenceLink { .. })
        ));
    }

    #[test]
    fn non_scalar_property_is_a_parse_error() {
        let text = r#"{"nodes": [{"id": "D1", "node_type": "drug", "name": "x",
                       "properties": {"bad": [1, 2]}}], "edges": []}"#;
        assert!(matches!(
            GraphSnapshot::from_json(text),
            Err(GraphError::Parse { .. })
        ));
    }

    #[test]
    fn store_replace_keeps_old_snapshot_alive() {
        let store = GraphStore::new(GraphSnapshot::build(sample()).unwrap());
        let before = store.snapshot();
        let previous = store.replace(GraphSnapshot::default());
        assert_eq!(before.node_count(), 3);
        assert_eq!(previous.node_count(), 3);
        assert_eq!(store.snapshot().node_count(), 0);
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("graph.json");
        std::fs::write(&path, serde_json::to_string(&sample()).unwrap()).unwrap();
        let snap = GraphSnapshot::load(&path).unwrap();
        assert_eq!(snap.stats().edges_by_layer.get("claim"), Some(&2));
    }
}
