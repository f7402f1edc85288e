//! Score normalization and fusion
//!
//! Lexical scores are unbounded and corpus-dependent, vector similarities
//! are bounded. Each list is min-max normalized over the candidates of the
//! current query, then combined linearly:
//!
//! `fused = alpha * vector + (1 - alpha) * lexical`
//!
//! A document returned by only one store gets 0 for the other side.

use serde::Serialize;
use std::collections::HashMap;

use crate::document::{DocId, Metadata};
use crate::lexical::LexicalHit;
use crate::vectordb::VectorHit;

/// A fused search result with per-component scores for explainability
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedResult {
    pub doc_id: DocId,
    /// Final score in [0, 1]
    pub fused_score: f32,
    /// Normalized lexical score (0 when the lexical store did not return it)
    pub lexical_score: f32,
    /// Normalized vector score (0 when the vector store did not return it)
    pub vector_score: f32,
    /// Raw BM25 score
    pub lexical_raw: Option<f32>,
    /// Raw cosine similarity
    pub vector_raw: Option<f32>,
    /// 1-based rank within the lexical candidates
    pub lexical_rank: Option<usize>,
    /// 1-based rank within the vector candidates
    pub vector_rank: Option<usize>,
    pub metadata: Metadata,
}

/// Min-max normalize to [0, 1] over this list only
///
/// When every score is equal (including a single score) each maps to 1.0.
/// Non-finite scores map to 0.0 and are ignored for the bounds.
pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    let finite = scores.iter().copied().filter(|s| s.is_finite());
    let (min, max) = finite.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), s| {
        (lo.min(s), hi.max(s))
    });
    let range = max - min;

    scores
        .iter()
        .map(|&s| {
            if !s.is_finite() {
                0.0
            } else if range > 0.0 {
                ((s - min) / range).clamp(0.0, 1.0)
            } else {
                1.0
            }
        })
        .collect()
}

/// Fuse both candidate lists into one ranking
///
/// Sorted by fused score descending, ties broken by ascending doc id.
/// Nothing is truncated here: post-filtering must see every candidate.
pub fn fuse(lexical: &[LexicalHit], vector: &[VectorHit], alpha: f32) -> Vec<FusedResult> {
    let alpha = alpha.clamp(0.0, 1.0);
    let lexical_norm = min_max_normalize(&lexical.iter().map(|h| h.score).collect::<Vec<_>>());
    let vector_norm = min_max_normalize(&vector.iter().map(|h| h.similarity).collect::<Vec<_>>());

    let mut merged: HashMap<&DocId, FusedResult> =
        HashMap::with_capacity(lexical.len() + vector.len());

    for (rank, (hit, norm)) in lexical.iter().zip(lexical_norm).enumerate() {
        let entry = merged
            .entry(&hit.doc_id)
            .or_insert_with(|| empty_result(&hit.doc_id, &hit.metadata));
        // Stores never return an id twice, but keep the best rank if one does
        if entry.lexical_rank.is_none() {
            entry.lexical_score = norm;
            entry.lexical_raw = Some(hit.score);
            entry.lexical_rank = Some(rank + 1);
        }
    }

    for (rank, (hit, norm)) in vector.iter().zip(vector_norm).enumerate() {
        let entry = merged
            .entry(&hit.doc_id)
            .or_insert_with(|| empty_result(&hit.doc_id, &hit.metadata));
        if entry.vector_rank.is_none() {
            entry.vector_score = norm;
            entry.vector_raw = Some(hit.similarity);
            entry.vector_rank = Some(rank + 1);
        }
    }

    let mut results: Vec<FusedResult> = merged
        .into_values()
        .map(|mut r| {
            r.fused_score =
                (alpha * r.vector_score + (1.0 - alpha) * r.lexical_score).clamp(0.0, 1.0);
            r
        })
        .collect();

    sort_fused(&mut results);
    results
}

/// Fused score descending, then doc id ascending
pub fn sort_fused(results: &mut [FusedResult]) {
    results.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
}

fn empty_result(doc_id: &DocId, metadata: &Metadata) -> FusedResult {
    FusedResult {
        doc_id: doc_id.clone(),
        fused_score: 0.0,
        lexical_score: 0.0,
        vector_score: 0.0,
        lexical_raw: None,
        vector_raw: None,
        lexical_rank: None,
        vector_rank: None,
        metadata: metadata.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lex(id: &str, score: f32) -> LexicalHit {
        LexicalHit {
            doc_id: id.into(),
            score,
            metadata: Metadata::new(),
        }
    }

    fn vec_hit(id: &str, similarity: f32) -> VectorHit {
        VectorHit {
            doc_id: id.into(),
            similarity,
            metadata: Metadata::new(),
        }
    }

    fn ids(results: &[FusedResult]) -> Vec<&str> {
        results.iter().map(|r| r.doc_id.as_str()).collect()
    }

    #[test]
    fn test_min_max_normalize() {
        assert_eq!(min_max_normalize(&[2.0, 4.0, 3.0]), vec![0.0, 1.0, 0.5]);
        assert_eq!(min_max_normalize(&[7.5]), vec![1.0]);
        assert_eq!(min_max_normalize(&[0.3, 0.3]), vec![1.0, 1.0]);
        assert!(min_max_normalize(&[]).is_empty());
        assert_eq!(min_max_normalize(&[f32::NAN, 1.0, 3.0]), vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_negative_similarities_normalize_into_range() {
        let normalized = min_max_normalize(&[-0.5, 0.0, 0.5]);
        assert_eq!(normalized, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_fuse_one_sided_documents_score_zero_on_missing_side() {
        let results = fuse(
            &[lex("a", 10.0), lex("b", 5.0)],
            &[vec_hit("b", 0.9), vec_hit("c", 0.1)],
            0.5,
        );

        assert_eq!(results.len(), 3);
        let a = results.iter().find(|r| r.doc_id.as_str() == "a").unwrap();
        assert_eq!(a.vector_score, 0.0);
        assert_eq!(a.vector_raw, None);
        assert_eq!(a.lexical_score, 1.0);
        assert_eq!(a.fused_score, 0.5);

        let b = results.iter().find(|r| r.doc_id.as_str() == "b").unwrap();
        assert_eq!(b.lexical_score, 0.0);
        assert_eq!(b.vector_score, 1.0);
        assert_eq!(b.lexical_rank, Some(2));
        assert_eq!(b.vector_rank, Some(1));
    }

    #[test]
    fn test_ties_break_by_doc_id() {
        let results = fuse(&[lex("zeta", 3.0), lex("alpha", 3.0), lex("mid", 1.0)], &[], 0.0);
        assert_eq!(ids(&results), vec!["alpha", "zeta", "mid"]);
    }

    #[test]
    fn test_alpha_extremes_follow_single_store_order() {
        let lexical = [lex("a", 9.0), lex("b", 4.0), lex("c", 1.0)];
        let vector = [vec_hit("c", 0.8), vec_hit("a", 0.5), vec_hit("b", 0.2)];

        assert_eq!(ids(&fuse(&lexical, &vector, 0.0)), vec!["a", "b", "c"]);
        assert_eq!(ids(&fuse(&lexical, &vector, 1.0)), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_fused_scores_bounded_and_sorted() {
        let results = fuse(
            &[lex("a", 120.0), lex("b", 0.01), lex("c", 44.0)],
            &[vec_hit("a", -0.2), vec_hit("d", 0.99), vec_hit("c", 0.4)],
            0.3,
        );
        assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.fused_score)));
        assert!(results
            .windows(2)
            .all(|w| w[0].fused_score >= w[1].fused_score));
    }
}
