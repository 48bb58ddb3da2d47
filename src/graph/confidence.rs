//! Evidence-quality confidence derivation.
//!
//! Each study design carries a fixed weight. An edge's derived confidence is the
//! *maximum* weight among its supporting evidence, so a single RCT is never
//! diluted by weaker studies cited next to it.

use super::{Edge, EdgeLayer, EvidenceItem, StudyType};

impl StudyType {
    /// Fixed study-type weight.
    pub fn weight(self) -> f64 {
        match self {
            StudyType::Rct => 1.0,
            StudyType::MetaAnalysis => 0.95,
            StudyType::Cohort => 0.8,
            StudyType::CaseControl => 0.7,
            StudyType::Observational => 0.6,
            StudyType::Review => 0.5,
            StudyType::CaseReport => 0.4,
        }
    }
}

/// Maximum study weight over the items, or `None` when no item names a study type.
pub fn max_study_weight<'a>(items: impl IntoIterator<Item = &'a EvidenceItem>) -> Option<f64> {
    items
        .into_iter()
        .filter_map(|item| item.study_type.map(StudyType::weight))
        .reduce(f64::max)
}

/// Effective confidence of an edge whose evidence list is final.
///
/// Evidence-layer edges always derive, folding in their own study type.
/// Claim and extraction edges keep an authored value; without one they derive
/// from evidence, then fall back to the extractor's score, then to 0.0.
pub fn effective_confidence(edge: &Edge) -> f64 {
    let derived = max_study_weight(&edge.evidence);
    match &edge.layer {
        EdgeLayer::Evidence { study_type, .. } => {
            derived.map_or(study_type.weight(), |w| w.max(study_type.weight()))
        }
        EdgeLayer::Claim { .. } => edge.confidence.or(derived).unwrap_or(0.0),
        EdgeLayer::Extraction {
            extraction_confidence,
            ..
        } => edge
            .confidence
            .or(derived)
            .unwrap_or(*extraction_confidence),
    }
}
