//! Translation of typed queries into third-party graph query languages.
//!
//! Adapters consume the same [`Query`](crate::query::Query) AST the engine
//! executes and never run anything themselves.

pub mod cypher;

pub use cypher::to_cypher;
