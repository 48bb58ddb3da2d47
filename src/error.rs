//! Rich diagnostic error types for the medgraph query engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text. Query-facing errors additionally map to
//! the stable wire codes carried in the response envelope.

use miette::Diagnostic;
use serde_json::{Value as JsonValue, json};
use thiserror::Error;

/// Top-level error type for the medgraph crate.
#[derive(Debug, Error)]
pub enum MedGraphError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Export(#[from] ExportError),
}

// Transparent forwarding, written out by hand: `#[diagnostic(transparent)]`
// would call `x.code()`, which resolves to the inherent wire-code method
// `EngineError::code` instead of `Diagnostic::code`.
impl MedGraphError {
    fn inner(&self) -> &dyn Diagnostic {
        match self {
            MedGraphError::Graph(e) => e,
            MedGraphError::Engine(e) => e,
            MedGraphError::Config(e) => e,
            MedGraphError::Export(e) => e,
        }
    }
}

impl Diagnostic for MedGraphError {
    fn code<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        self.inner().code()
    }

    fn severity(&self) -> Option<miette::Severity> {
        self.inner().severity()
    }

    fn help<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        self.inner().help()
    }

    fn url<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        self.inner().url()
    }

    fn source_code(&self) -> Option<&dyn miette::SourceCode> {
        self.inner().source_code()
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = miette::LabeledSpan> + '_>> {
        self.inner().labels()
    }

    fn related<'a>(&'a self) -> Option<Box<dyn Iterator<Item = &'a dyn Diagnostic> + 'a>> {
        self.inner().related()
    }

    fn diagnostic_source(&self) -> Option<&dyn Diagnostic> {
        self.inner().diagnostic_source()
    }
}

// ---------------------------------------------------------------------------
// Graph errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("duplicate node id: {id}")]
    #[diagnostic(
        code(medgraph::graph::duplicate_node),
        help(
            "Node ids are canonical and must be unique within a snapshot. \
             Run entity resolution upstream so every mention maps to one node."
        )
    )]
    DuplicateNode { id: String },

    #[error("duplicate edge id: {id}")]
    #[diagnostic(
        code(medgraph::graph::duplicate_edge),
        help("Every edge in a snapshot needs its own id.")
    )]
    DuplicateEdge { id: String },

    #[error("edge {edge_id} references unknown node {node_id}")]
    #[diagnostic(
        code(medgraph::graph::dangling_edge),
        help("Load both endpoint nodes before the edge, or drop the edge from the snapshot.")
    )]
    DanglingEdge { edge_id: String, node_id: String },

    #[error("evidence edge {edge_id} supports unknown edge {target_id}")]
    #[diagnostic(
        code(medgraph::graph::dangling_evidence_link),
        help("The `supports` field of an evidence-layer edge must name an edge in the same snapshot.")
    )]
    DanglingEvidenceLink { edge_id: String, target_id: String },

    #[error("{field} of edge {edge_id} is {value}, outside [0.0, 1.0]")]
    #[diagnostic(
        code(medgraph::graph::out_of_range),
        help("Confidence and strength scores are probabilities and must lie in [0.0, 1.0].")
    )]
    ScoreOutOfRange {
        edge_id: String,
        field: &'static str,
        value: f64,
    },

    #[error("edge {edge_id} has evidence but no item names a paper")]
    #[diagnostic(
        code(medgraph::graph::evidence_without_paper),
        help(
            "Every claim or extraction edge with evidence must cite at least one paper_id. \
             The engine never fabricates evidence."
        )
    )]
    EvidenceWithoutPaper { edge_id: String },

    #[error("failed to read snapshot {path}")]
    #[diagnostic(
        code(medgraph::graph::io),
        help("Check that the snapshot file exists and is readable.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse snapshot: {message}")]
    #[diagnostic(
        code(medgraph::graph::parse),
        help(
            "A snapshot is a JSON object with `nodes` and `edges` arrays. \
             Each edge needs a `layer` and the fields that layer requires."
        )
    )]
    Parse { message: String },
}

// ---------------------------------------------------------------------------
// Query errors
// ---------------------------------------------------------------------------

/// A malformed, unknown or out-of-range query field.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("invalid query field `{field}`: {reason}")]
#[diagnostic(
    code(medgraph::query::validation),
    help("Fix the query document; validation errors are never retried.")
)]
pub struct ValidationError {
    /// Dotted location of the offending field inside the query document.
    pub field: String,
    pub reason: String,
    /// Recognized keys of the containing object, when the key itself was unknown.
    pub allowed_fields: Option<Vec<String>>,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
            allowed_fields: None,
        }
    }

    pub fn unknown_field(field: impl Into<String>, allowed: &[&str]) -> Self {
        Self {
            field: field.into(),
            reason: "unknown field".into(),
            allowed_fields: Some(allowed.iter().map(|s| s.to_string()).collect()),
        }
    }
}

/// A field path whose root variable is never bound by any pattern.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("`{path}` references variable `{variable}`, which no pattern binds")]
#[diagnostic(
    code(medgraph::query::unbound_variable),
    help("Bound variables: {bound}. Name the pattern with `var`, or use source/target/path.")
)]
pub struct ResolutionError {
    pub path: String,
    pub variable: String,
    /// Comma-separated list of the variables the query does bind.
    pub bound: String,
}

/// Errors surfaced by [`crate::engine::Engine::execute`].
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("request body is not valid JSON: {message}")]
    #[diagnostic(code(medgraph::query::invalid_json))]
    InvalidJson { message: String },
}

impl EngineError {
    /// Stable wire code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::Resolution(_) => "RESOLUTION_ERROR",
            EngineError::InvalidJson { .. } => "INVALID_JSON",
        }
    }

    /// Structured detail payload for the error envelope.
    pub fn details(&self) -> JsonValue {
        match self {
            EngineError::Validation(e) => {
                let mut details = json!({ "field": e.field, "reason": e.reason });
                if let Some(allowed) = &e.allowed_fields {
                    details["allowed_fields"] = json!(allowed);
                }
                details
            }
            EngineError::Resolution(e) => json!({ "path": e.path, "variable": e.variable }),
            EngineError::InvalidJson { .. } => json!({}),
        }
    }

    /// Render as `{"error": {"code", "message", "details"}}`.
    pub fn to_envelope(&self) -> JsonValue {
        json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "details": self.details(),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read engine config: {path}")]
    #[diagnostic(
        code(medgraph::config::read),
        help("Ensure the config file exists and is valid TOML.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse engine config: {path}: {message}")]
    #[diagnostic(
        code(medgraph::config::parse),
        help("Check the TOML syntax; unknown keys are rejected.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write engine config: {path}")]
    #[diagnostic(
        code(medgraph::config::write),
        help("Ensure you have write permissions to the target directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid engine config: {message}")]
    #[diagnostic(code(medgraph::config::invalid))]
    Invalid { message: String },
}

// ---------------------------------------------------------------------------
// Export errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ExportError {
    #[error("cannot express {construct} in Cypher")]
    #[diagnostic(
        code(medgraph::export::unsupported),
        help("Run this query on the in-process engine instead of delegating it.")
    )]
    Unsupported { construct: String },
}

/// Convenience alias for functions returning medgraph results.
pub type MedGraphResult<T> = std::result::Result<T, MedGraphError>;
