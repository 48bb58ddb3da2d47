// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # medgraph
//!
//! A query execution engine for evidence-annotated medical knowledge graphs.
//!
//! ## Architecture
//!
//! - **Graph store** (`graph`): immutable petgraph-backed snapshots behind an
//!   atomically swappable reference, with derived confidences and a
//!   contradiction index over claim edges
//! - **Query AST** (`query`): strict validator from JSON documents to typed
//!   queries with pre-parsed field paths
//! - **Execution** (`exec`): pattern matching with variable binding, bounded
//!   path enumeration, filtering, aggregation and result assembly
//! - **Export** (`export`): optional Cypher rendering of the same AST
//!
//! ## Library usage
//!
//! ```no_run
//! use medgraph::config::EngineConfig;
//! use medgraph::engine::Engine;
//!
//! let engine = Engine::open("graph.json".as_ref(), EngineConfig::default()).unwrap();
//! let body = engine.execute_json(
//!     r#"{"find": "nodes", "node_pattern": {"node_type": "drug"}, "limit": 10}"#,
//! );
//! println!("{body}");
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod export;
pub mod graph;
pub mod query;
