//! Evidence-annotated medical knowledge graph: data model and snapshot store.
//!
//! Nodes are canonical entities. Edges are directed relationships tagged with
//! an epistemic layer:
//!
//! - **Extraction**: a relationship an extractor pulled from text
//! - **Claim**: an assertion a paper makes, with a polarity
//! - **Evidence**: a study-backed observation with a study type and sample size
//!
//! Layer-specific fields live in [`EdgeLayer`], so an edge cannot exist without
//! the fields its layer requires.

pub mod confidence;
pub mod contradiction;
pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub use store::{GraphSnapshot, GraphStore, SnapshotDocument};

/// Fixed entity-type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Disease,
    Symptom,
    Drug,
    Gene,
    Mutation,
    Protein,
    Pathway,
    AnatomicalStructure,
    Procedure,
    Test,
    Biomarker,
    Paper,
    Author,
    Institution,
    ClinicalTrial,
}

impl NodeType {
    pub const ALL: [NodeType; 15] = [
        NodeType::Disease,
        NodeType::Symptom,
        NodeType::Drug,
        NodeType::Gene,
        NodeType::Mutation,
        NodeType::Protein,
        NodeType::Pathway,
        NodeType::AnatomicalStructure,
        NodeType::Procedure,
        NodeType::Test,
        NodeType::Biomarker,
        NodeType::Paper,
        NodeType::Author,
        NodeType::Institution,
        NodeType::ClinicalTrial,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Disease => "disease",
            NodeType::Symptom => "symptom",
            NodeType::Drug => "drug",
            NodeType::Gene => "gene",
            NodeType::Mutation => "mutation",
            NodeType::Protein => "protein",
            NodeType::Pathway => "pathway",
            NodeType::AnatomicalStructure => "anatomical_structure",
            NodeType::Procedure => "procedure",
            NodeType::Test => "test",
            NodeType::Biomarker => "biomarker",
            NodeType::Paper => "paper",
            NodeType::Author => "author",
            NodeType::Institution => "institution",
            NodeType::ClinicalTrial => "clinical_trial",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown node type \"{s}\""))
    }
}

/// Scalar node property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Number(f64),
    Text(String),
}

/// A canonical entity. Immutable once loaded into a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Canonical, globally unique id (e.g. a UMLS CUI).
    pub id: String,
    pub node_type: NodeType,
    pub name: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Scalar>,
    /// Ontology name → identifier in that ontology.
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type,
            name: name.into(),
            synonyms: Vec::new(),
            properties: BTreeMap::new(),
            external_ids: BTreeMap::new(),
        }
    }

    pub fn with_synonym(mut self, synonym: impl Into<String>) -> Self {
        self.synonyms.push(synonym.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Scalar) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_external_id(mut self, ontology: impl Into<String>, id: impl Into<String>) -> Self {
        self.external_ids.insert(ontology.into(), id.into());
        self
    }

    /// Case-insensitive match against the canonical name or any synonym.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name) || self.synonyms.iter().any(|s| s.eq_ignore_ascii_case(name))
    }
}

/// Study design of a piece of evidence, ordered by the weight table in
/// [`confidence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyType {
    Rct,
    MetaAnalysis,
    Cohort,
    CaseControl,
    Observational,
    Review,
    CaseReport,
}

impl StudyType {
    pub const ALL: [StudyType; 7] = [
        StudyType::Rct,
        StudyType::MetaAnalysis,
        StudyType::Cohort,
        StudyType::CaseControl,
        StudyType::Observational,
        StudyType::Review,
        StudyType::CaseReport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StudyType::Rct => "rct",
            StudyType::MetaAnalysis => "meta_analysis",
            StudyType::Cohort => "cohort",
            StudyType::CaseControl => "case_control",
            StudyType::Observational => "observational",
            StudyType::Review => "review",
            StudyType::CaseReport => "case_report",
        }
    }
}

impl FromStr for StudyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StudyType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown study type \"{s}\""))
    }
}

/// Stance of a claim toward its relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Supports,
    Refutes,
    Neutral,
}

impl Polarity {
    pub fn as_str(self) -> &'static str {
        match self {
            Polarity::Supports => "supports",
            Polarity::Refutes => "refutes",
            Polarity::Neutral => "neutral",
        }
    }
}

/// Quantitative result reported alongside a piece of evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub value_type: Option<String>,
    #[serde(default)]
    pub p_value: Option<f64>,
}

/// One supporting item attached to an edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    #[serde(default)]
    pub paper_id: Option<String>,
    #[serde(default)]
    pub study_type: Option<StudyType>,
    #[serde(default)]
    pub sample_size: Option<u64>,
    #[serde(default)]
    pub paper_publication_date: Option<NaiveDate>,
    #[serde(default)]
    pub measurement: Option<Measurement>,
}

impl EvidenceItem {
    pub fn paper(paper_id: impl Into<String>, study_type: StudyType) -> Self {
        Self {
            paper_id: Some(paper_id.into()),
            study_type: Some(study_type),
            ..Default::default()
        }
    }
}

/// Epistemic layer of an edge together with the fields that layer requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "snake_case")]
pub enum EdgeLayer {
    Extraction {
        extractor_name: String,
        extraction_confidence: f64,
    },
    Claim {
        predicate: String,
        /// Paper id of the asserting paper.
        asserted_by: String,
        polarity: Polarity,
    },
    Evidence {
        evidence_type: String,
        evidence_strength: f64,
        study_type: StudyType,
        sample_size: u64,
        text_span: String,
        paper_id: String,
        /// Id of the claim or extraction edge this evidence backs.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        supports: Option<String>,
    },
}

/// Layer discriminator without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Extraction,
    Claim,
    Evidence,
}

impl LayerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LayerKind::Extraction => "extraction",
            LayerKind::Claim => "claim",
            LayerKind::Evidence => "evidence",
        }
    }
}

impl FromStr for LayerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "extraction" => Ok(LayerKind::Extraction),
            "claim" => Ok(LayerKind::Claim),
            "evidence" => Ok(LayerKind::Evidence),
            _ => Err(format!("unknown layer \"{s}\"")),
        }
    }
}

impl EdgeLayer {
    pub fn kind(&self) -> LayerKind {
        match self {
            EdgeLayer::Extraction { .. } => LayerKind::Extraction,
            EdgeLayer::Claim { .. } => LayerKind::Claim,
            EdgeLayer::Evidence { .. } => LayerKind::Evidence,
        }
    }
}

/// A directed relationship `subject --relation_type--> object`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub relation_type: String,
    pub subject_id: String,
    pub object_id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Authored confidence. Filled with the derived value when a snapshot is built.
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,
    #[serde(flatten)]
    pub layer: EdgeLayer,
}

impl Edge {
    pub fn new(
        id: impl Into<String>,
        subject_id: impl Into<String>,
        relation_type: impl Into<String>,
        object_id: impl Into<String>,
        layer: EdgeLayer,
    ) -> Self {
        Self {
            id: id.into(),
            relation_type: relation_type.into(),
            subject_id: subject_id.into(),
            object_id: object_id.into(),
            created_at: None,
            confidence: None,
            evidence: Vec::new(),
            layer,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_evidence(mut self, item: EvidenceItem) -> Self {
        self.evidence.push(item);
        self
    }

    /// Effective confidence in [0.0, 1.0].
    pub fn confidence(&self) -> f64 {
        self.confidence.unwrap_or(0.0)
    }

    pub fn layer_kind(&self) -> LayerKind {
        self.layer.kind()
    }

    /// Case-insensitive relation type comparison.
    pub fn has_relation(&self, relation_type: &str) -> bool {
        self.relation_type.eq_ignore_ascii_case(relation_type)
    }

    /// Paper ids of the evidence items, in order, skipping items without one.
    pub fn paper_ids(&self) -> impl Iterator<Item = &str> {
        self.evidence.iter().filter_map(|e| e.paper_id.as_deref())
    }
}

/// Which endpoint of an edge a traversal starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The bound node is the edge's subject.
    #[default]
    Outgoing,
    /// The bound node is the edge's object.
    Incoming,
    /// Either endpoint.
    Both,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "outgoing" => Ok(Direction::Outgoing),
            "incoming" => Ok(Direction::Incoming),
            "both" => Ok(Direction::Both),
            _ => Err(format!("unknown direction \"{s}\"")),
        }
    }
}
