//! Contradiction detection over claim-layer edges.
//!
//! Claims are grouped by `(subject_id, predicate, object_id)`. A group is
//! contradictory iff it contains more than one distinct polarity. Groups are
//! *reported*, never resolved: the engine does not pick a winner.

use std::collections::HashMap;

use serde::Serialize;

use super::{Edge, EdgeLayer, Polarity};

/// A set of claims about one relationship that disagree on polarity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContradictionGroup {
    pub subject_id: String,
    pub predicate: String,
    pub object_id: String,
    /// Distinct polarities, in first-seen order.
    pub polarities: Vec<Polarity>,
    /// Distinct asserting paper ids, in first-seen order.
    pub papers: Vec<String>,
    /// Member claim edges, in input order.
    pub edges: Vec<Edge>,
}

impl ContradictionGroup {
    pub fn edge_ids(&self) -> impl Iterator<Item = &str> {
        self.edges.iter().map(|e| e.id.as_str())
    }
}

/// Group claim edges by `(subject, predicate, object)` and report the groups
/// holding more than one polarity. Non-claim edges are ignored. Output order
/// follows the first claim of each group.
pub fn find_contradictions<'a>(edges: impl IntoIterator<Item = &'a Edge>) -> Vec<ContradictionGroup> {
    let mut groups: Vec<ContradictionGroup> = Vec::new();
    let mut by_key: HashMap<(String, String, String), usize> = HashMap::new();

    for edge in edges {
        let EdgeLayer::Claim {
            predicate,
            asserted_by,
            polarity,
        } = &edge.layer
        else {
            continue;
        };

        let key = (
            edge.subject_id.clone(),
            predicate.to_ascii_lowercase(),
            edge.object_id.clone(),
        );
        let idx = *by_key.entry(key).or_insert_with(|| {
            groups.push(ContradictionGroup {
                subject_id: edge.subject_id.clone(),
                predicate: predicate.clone(),
                object_id: edge.object_id.clone(),
                polarities: Vec::new(),
                papers: Vec::new(),
                edges: Vec::new(),
            });
            groups.len() - 1
        });

        let group = &mut groups[idx];
        if !group.polarities.contains(polarity) {
            group.polarities.push(*polarity);
        }
        if !group.papers.iter().any(|p| p == asserted_by) {
            group.papers.push(asserted_by.clone());
        }
        group.edges.push(edge.clone());
    }

    groups.retain(|g| g.polarities.len() > 1);
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(id: &str, subject: &str, predicate: &str, object: &str, paper: &str, polarity: Polarity) -> Edge {
        Edge::new(
            id,
            subject,
            predicate,
            object,
            EdgeLayer::Claim {
                predicate: predicate.into(),
                asserted_by: paper.into(),
                polarity,
            },
        )
        .with_confidence(0.7)
    }

    #[test]
    fn mixed_polarity_is_reported() {
        let edges = vec![
            claim("c1", "HIV", "causes", "AIDS", "PMC1", Polarity::Supports),
            claim("c2", "HIV", "causes", "AIDS", "PMC2", Polarity::Refutes),
            claim("c3", "HIV", "infects", "CD4", "PMC1", Polarity::Supports),
        ];
        let groups = find_contradictions(&edges);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].subject_id, "HIV");
        assert_eq!(groups[0].polarities, vec![Polarity::Supports, Polarity::Refutes]);
        assert_eq!(groups[0].papers, vec!["PMC1", "PMC2"]);
        assert_eq!(groups[0].edge_ids().collect::<Vec<_>>(), vec!["c1", "c2"]);
    }

    #[test]
    fn repeated_support_is_not_a_contradiction() {
        let edges = vec![
            claim("c1", "HIV", "causes", "AIDS", "PMC1", Polarity::Supports),
            claim("c2", "HIV", "causes", "AIDS", "PMC1", Polarity::Supports),
        ];
        assert!(find_contradictions(&edges).is_empty());
    }

    #[test]
    fn neutral_counts_as_distinct_polarity() {
        let edges = vec![
            claim("c1", "A", "treats", "B", "PMC1", Polarity::Supports),
            claim("c2", "A", "TREATS", "B", "PMC2", Polarity::Neutral),
        ];
        assert_eq!(find_contradictions(&edges).len(), 1);
    }

    #[test]
    fn non_claim_edges_are_ignored() {
        let extraction = Edge::new(
            "x1",
            "A",
            "treats",
            "B",
            EdgeLayer::Extraction {
                extractor_name: "llm".into(),
                extraction_confidence: 0.9,
            },
        );
        let edges = vec![
            claim("c1", "A", "treats", "B", "PMC1", Polarity::Supports),
            extraction,
        ];
        assert!(find_contradictions(&edges).is_empty());
    }
}
