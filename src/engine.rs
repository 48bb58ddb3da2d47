//! Engine facade: top-level API for the medgraph query engine.
//!
//! The `Engine` owns the live graph snapshot and the engine configuration and
//! runs queries through the match → filter → aggregate → assemble pipeline.
//! Every query pins the snapshot current at its start, so a concurrent
//! [`Engine::replace_snapshot`] never shows it a partial update.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};

use crate::config::EngineConfig;
use crate::error::{EngineError, MedGraphResult, ValidationError};
use crate::exec::aggregate::aggregate;
use crate::exec::assemble::{assemble_raw, assemble_rows};
use crate::exec::matcher::match_query;
use crate::exec::resolve::Resolver;
use crate::graph::contradiction::ContradictionGroup;
use crate::graph::{GraphSnapshot, GraphStore};
use crate::query::{self, Query};

/// Response metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    /// Rows (or groups) before `offset`/`limit`.
    pub total_results: usize,
    pub query_time_ms: f64,
    /// Path enumeration stopped at the configured instance ceiling.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Contradiction groups touching an edge in the matched bindings.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contradictions: Vec<ContradictionGroup>,
}

/// Successful query response: `{"results": [...], "metadata": {...}}`.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub results: Vec<JsonValue>,
    pub metadata: ResponseMetadata,
}

impl QueryResponse {
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_else(|e| {
            EngineError::InvalidJson { message: e.to_string() }.to_envelope()
        })
    }
}

/// The medgraph query engine.
#[derive(Debug)]
pub struct Engine {
    store: GraphStore,
    config: EngineConfig,
}

impl Engine {
    /// Create an engine serving `snapshot`.
    pub fn new(snapshot: GraphSnapshot, config: EngineConfig) -> Self {
        tracing::info!(
            nodes = snapshot.node_count(),
            edges = snapshot.edge_count(),
            contradictions = snapshot.contradictions().len(),
            "medgraph engine ready"
        );
        Self {
            store: GraphStore::new(snapshot),
            config,
        }
    }

    /// Load a snapshot file and create an engine over it.
    pub fn open(snapshot_path: &Path, config: EngineConfig) -> MedGraphResult<Self> {
        config.validate()?;
        let snapshot = GraphSnapshot::load(snapshot_path)?;
        Ok(Self::new(snapshot, config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The snapshot new queries run against.
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        self.store.snapshot()
    }

    /// Swap in a new snapshot. In-flight queries finish on the old one.
    pub fn replace_snapshot(&self, snapshot: GraphSnapshot) -> Arc<GraphSnapshot> {
        self.store.replace(snapshot)
    }

    /// Validate a query document under this engine's limits.
    pub fn parse(&self, raw: &JsonValue) -> Result<Query, EngineError> {
        query::parse_with_limits(raw, &self.config.limits())
    }

    /// Execute a validated query against the current snapshot.
    pub fn execute(&self, query: &Query) -> Result<QueryResponse, EngineError> {
        let started = Instant::now();
        if let Some(pp) = &query.path_pattern {
            if pp.hops.is_empty() {
                return Err(ValidationError::new("path_pattern.edges", "a path needs at least one hop").into());
            }
            let ceiling = self.config.max_hops_ceiling;
            if pp.max_hops == 0 || pp.max_hops > ceiling {
                return Err(ValidationError::new(
                    "path_pattern.max_hops",
                    format!("must be between 1 and {ceiling}, got {}", pp.max_hops),
                )
                .into());
            }
        }

        let snapshot = self.store.snapshot();
        let resolver = Resolver::new(&snapshot);

        let outcome = match_query(&resolver, query, self.config.max_path_instances);
        tracing::debug!(
            find = %query.find,
            bindings = outcome.envs.len(),
            truncated = outcome.truncated,
            "matched and filtered"
        );

        let mut group_ids: Vec<usize> = outcome
            .envs
            .iter()
            .flat_map(|env| env.edges())
            .filter_map(|edge| snapshot.contradiction_of(&edge.id).map(|(idx, _)| idx))
            .collect();
        group_ids.sort_unstable();
        group_ids.dedup();
        let contradictions = group_ids
            .into_iter()
            .filter_map(|idx| snapshot.contradictions().get(idx).cloned())
            .collect();

        let limit = query.limit.or(self.config.default_limit);
        let assembled = match &query.aggregate {
            Some(spec) => {
                let rows = aggregate(&resolver, &outcome.envs, spec);
                assemble_rows(query, rows, limit)
            }
            None => assemble_raw(&resolver, query, &outcome.envs, limit),
        };

        let mut warnings = Vec::new();
        if outcome.truncated {
            warnings.push(format!(
                "path enumeration stopped after {} instances; results are partial",
                outcome.enumerated
            ));
        }

        let query_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        tracing::debug!(
            total = assembled.total,
            returned = assembled.results.len(),
            query_time_ms,
            "query executed"
        );
        Ok(QueryResponse {
            results: assembled.results,
            metadata: ResponseMetadata {
                total_results: assembled.total,
                query_time_ms,
                truncated: outcome.truncated,
                warnings,
                contradictions,
            },
        })
    }

    /// Parse and execute a query document.
    pub fn execute_value(&self, raw: &JsonValue) -> Result<QueryResponse, EngineError> {
        let query = self.parse(raw)?;
        self.execute(&query)
    }

    /// Execute query text, rendering either the response or the error envelope.
    pub fn execute_json(&self, text: &str) -> JsonValue {
        let raw: JsonValue = match serde_json::from_str(text) {
            Ok(raw) => raw,
            Err(e) => return EngineError::InvalidJson { message: e.to_string() }.to_envelope(),
        };
        match self.execute_value(&raw) {
            Ok(response) => response.to_json(),
            Err(e) => e.to_envelope(),
        }
    }

    /// Run `{"queries": [{"id", "query"}, ...]}`.
    ///
    /// Entries run independently; one entry's failure becomes its own `error`
    /// member and does not affect its siblings. Output order follows input
    /// order even when entries run in parallel.
    pub fn execute_batch(&self, raw: &JsonValue) -> Result<JsonValue, EngineError> {
        let entries = batch_entries(raw)?;
        let run = |(id, query): &(String, &JsonValue)| match self.execute_value(query) {
            Ok(response) => json!({ "id": id, "result": response.to_json() }),
            Err(e) => json!({ "id": id, "error": e.to_envelope()["error"].clone() }),
        };
        let results: Vec<JsonValue> = if self.config.parallel_batch {
            entries.par_iter().map(run).collect()
        } else {
            entries.iter().map(run).collect()
        };
        tracing::info!(queries = results.len(), "batch executed");
        Ok(json!({ "results": results }))
    }

    /// Every contradiction group in the current snapshot.
    pub fn find_contradictions(&self) -> Vec<ContradictionGroup> {
        self.store.snapshot().contradictions().to_vec()
    }
}

fn batch_entries(raw: &JsonValue) -> Result<Vec<(String, &JsonValue)>, ValidationError> {
    let Some(map) = raw.as_object() else {
        return Err(ValidationError::new("", "batch request must be a JSON object"));
    };
    if let Some(key) = map.keys().find(|k| k.as_str() != "queries") {
        return Err(ValidationError::unknown_field(key.as_str(), &["queries"]));
    }
    let Some(queries) = map.get("queries").and_then(JsonValue::as_array) else {
        return Err(ValidationError::new("queries", "required array is missing"));
    };

    let mut entries = Vec::with_capacity(queries.len());
    for (i, entry) in queries.iter().enumerate() {
        let at = format!("queries[{i}]");
        let Some(obj) = entry.as_object() else {
            return Err(ValidationError::new(at, "entry must be an object"));
        };
        if let Some(key) = obj.keys().find(|k| !matches!(k.as_str(), "id" | "query")) {
            return Err(ValidationError::unknown_field(format!("{at}.{key}"), &["id", "query"]));
        }
        let Some(id) = obj.get("id").and_then(JsonValue::as_str) else {
            return Err(ValidationError::new(format!("{at}.id"), "required string is missing"));
        };
        let Some(query) = obj.get("query") else {
            return Err(ValidationError::new(format!("{at}.query"), "required field is missing"));
        };
        entries.push((id.to_string(), query));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, EdgeLayer, Node, NodeType, Polarity, SnapshotDocument};

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
        .with_confidence(0.8)
    }

    fn snapshot() -> GraphSnapshot {
        GraphSnapshot::build(SnapshotDocument {
            nodes: vec![
                Node::new("D1", NodeType::Drug, "metformin"),
                Node::new("X1", NodeType::Disease, "type 2 diabetes"),
                Node::new("X2", NodeType::Disease, "colorectal cancer"),
            ],
            edges: vec![
                claim("c1", "D1", "X1", "PMC1", Polarity::Supports),
                claim("c2", "D1", "X2", "PMC2", Polarity::Supports),
                claim("c3", "D1", "X2", "PMC3", Polarity::Refutes),
            ],
        })
        .unwrap()
    }

    fn engine() -> Engine {
        Engine::new(snapshot(), EngineConfig::default())
    }

    #[test]
    fn execute_annotates_contradictions() {
        let engine = engine();
        let response = engine
            .execute_value(&json!({
                "find": "edges",
                "edge_pattern": {"relation_type": "treats"},
                "filters": [{"field": "target.name", "operator": "eq", "value": "colorectal cancer"}]
            }))
            .unwrap();
        assert_eq!(response.metadata.total_results, 2);
        assert_eq!(response.metadata.contradictions.len(), 1);
        assert_eq!(response.metadata.contradictions[0].object_id, "X2");
    }

    #[test]
    fn uncontested_results_carry_no_contradictions() {
        let engine = engine();
        let body = engine.execute_json(
            r#"{"find": "edges", "filters": [{"field": "r.object_id", "operator": "eq", "value": "X1"}]}"#,
        );
        assert_eq!(body["metadata"]["total_results"], 1);
        assert!(body["metadata"].get("contradictions").is_none());
        assert!(body["metadata"].get("truncated").is_none());
    }

    #[test]
    fn invalid_json_envelope() {
        let body = engine().execute_json("{find: nodes");
        assert_eq!(body["error"]["code"], "INVALID_JSON");
    }

    #[test]
    fn default_limit_applies_when_query_has_none() {
        let mut config = EngineConfig::default();
        config.default_limit = Some(1);
        let engine = Engine::new(snapshot(), config);
        let response = engine.execute_value(&json!({"find": "nodes"})).unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.metadata.total_results, 3);
    }

    #[test]
    fn programmatic_query_over_ceiling_is_rejected() {
        let engine = engine();
        let mut query = engine
            .parse(&json!({
                "find": "paths",
                "path_pattern": {"start": {"name": "metformin"}, "edges": [[{}, {}]]}
            }))
            .unwrap();
        if let Some(pp) = query.path_pattern.as_mut() {
            pp.max_hops = 99;
        }
        let err = engine.execute(&query).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn node_rows_follow_node_identity() {
        let engine = engine();
        let per_edge = engine
            .execute_value(&json!({
                "find": "nodes",
                "node_pattern": {"node_type": "drug"},
                "edge_pattern": {"relation_type": "treats"},
                "return_fields": ["n.name"]
            }))
            .unwrap();
        assert_eq!(per_edge.metadata.total_results, 1);

        engine.replace_snapshot(
            GraphSnapshot::build(SnapshotDocument {
                nodes: vec![
                    Node::new("D1", NodeType::Drug, "aspirin"),
                    Node::new("D2", NodeType::Drug, "aspirin"),
                ],
                edges: vec![],
            })
            .unwrap(),
        );
        let same_name = engine
            .execute_value(&json!({
                "find": "nodes",
                "node_pattern": {"node_type": "drug"},
                "return_fields": ["n.name"]
            }))
            .unwrap();
        assert_eq!(same_name.metadata.total_results, 2);
        assert_eq!(same_name.results, vec![json!({"n.name": "aspirin"}), json!({"n.name": "aspirin"})]);
    }

    #[test]
    fn programmatic_query_without_hops_is_rejected() {
        let engine = engine();
        let mut query = engine
            .parse(&json!({
                "find": "paths",
                "path_pattern": {"start": {"name": "metformin"}, "edges": [[{}, {}]]}
            }))
            .unwrap();
        if let Some(pp) = query.path_pattern.as_mut() {
            pp.hops.clear();
        }
        let err = engine.execute(&query).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(err.details()["field"], json!("path_pattern.edges"));
    }

    #[test]
    fn batch_keeps_caller_order_and_isolates_failures() {
        let engine = engine();
        let out = engine
            .execute_batch(&json!({"queries": [
                {"id": "a", "query": {"find": "nodes", "node_pattern": {"node_type": "drug"}}},
                {"id": "b", "query": {"find": "planets"}},
                {"id": "c", "query": {"find": "edges"}}
            ]}))
            .unwrap();
        let results = out["results"].as_array().unwrap();
        assert_eq!(results[0]["id"], "a");
        assert_eq!(results[0]["result"]["metadata"]["total_results"], 1);
        assert_eq!(results[1]["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(results[2]["result"]["metadata"]["total_results"], 3);
    }

    #[test]
    fn malformed_batch_is_rejected() {
        let err = engine().execute_batch(&json!({"queries": [{"id": 1}]})).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let err = engine().execute_batch(&json!({"jobs": []})).unwrap_err();
        assert_eq!(err.details()["field"], "jobs");
    }

    #[test]
    fn snapshot_replacement_is_atomic_for_readers() {
        let engine = engine();
        let pinned = engine.snapshot();
        engine.replace_snapshot(GraphSnapshot::default());
        assert_eq!(pinned.node_count(), 3);
        assert_eq!(engine.snapshot().node_count(), 0);
        assert_eq!(engine.find_contradictions().len(), 0);
    }
}
