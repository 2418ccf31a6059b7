//! Text similarity used to backfill retrieval snapshots.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::SimilarityKind;

/// Scores how close a side-index summary is to the query text.
pub trait SimilarityMetric: Send + Sync {
    /// Stable name recorded in snapshot filters.
    fn name(&self) -> &'static str;

    fn score(&self, query: &str, candidate: &str) -> f64;
}

pub fn metric_for(kind: SimilarityKind) -> Box<dyn SimilarityMetric> {
    match kind {
        SimilarityKind::TokenJaccard => Box::new(TokenJaccard),
        SimilarityKind::Cosine => Box::new(TermCosine),
    }
}

/// Jaccard overlap of the lower-cased token sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenJaccard;

impl SimilarityMetric for TokenJaccard {
    fn name(&self) -> &'static str {
        "token_jaccard"
    }

    fn score(&self, query: &str, candidate: &str) -> f64 {
        let a: BTreeSet<String> = tokenize(query).collect();
        let b: BTreeSet<String> = tokenize(candidate).collect();
        let union = a.union(&b).count();
        if union == 0 {
            return 0.0;
        }
        a.intersection(&b).count() as f64 / union as f64
    }
}

/// Cosine similarity of term-frequency vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct TermCosine;

impl SimilarityMetric for TermCosine {
    fn name(&self) -> &'static str {
        "cosine"
    }

    fn score(&self, query: &str, candidate: &str) -> f64 {
        let mut counts: BTreeMap<String, (f64, f64)> = BTreeMap::new();
        for token in tokenize(query) {
            counts.entry(token).or_default().0 += 1.0;
        }
        for token in tokenize(candidate) {
            counts.entry(token).or_default().1 += 1.0;
        }
        let (a, b): (Vec<f64>, Vec<f64>) = counts.into_values().unzip();
        cosine_similarity(&a, &b)
    }
}

/// Cosine similarity between two vectors; 0.0 for empty, mismatched or zero
/// vectors.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_token_jaccard() {
        let m = TokenJaccard;
        assert!((m.score("Open the Gate", "gate open") - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(m.score("", ""), 0.0);
        assert_eq!(m.score("boss", "gate"), 0.0);
    }

    #[test]
    fn test_term_cosine_counts_repeats() {
        let m = TermCosine;
        assert!((m.score("gate gate", "gate") - 1.0).abs() < 1e-9);
        let partial = m.score("open gate", "gate boss");
        assert!(partial > 0.0 && partial < 1.0);
    }

    #[test]
    fn test_metric_for_names() {
        assert_eq!(metric_for(SimilarityKind::TokenJaccard).name(), "token_jaccard");
        assert_eq!(metric_for(SimilarityKind::Cosine).name(), "cosine");
    }
}
