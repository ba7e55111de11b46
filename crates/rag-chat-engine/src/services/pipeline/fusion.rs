use std::collections::{BTreeMap, HashSet};

use crate::services::gateways::RetrievedChunk;

#[derive(Debug, Clone, PartialEq)]
pub struct FusedChunk {
    pub document_id: String,
    pub content: String,
    pub score: f64,
}

/// Reciprocal-rank fusion: `score(d) = Σ 1 / (k + rank)` with 1-based ranks.
///
/// Documents appearing twice in one list count only at their best rank.
/// Ordered by score descending, then document id ascending.
pub fn reciprocal_rank_fusion(lists: &[Vec<RetrievedChunk>], k: f64) -> Vec<FusedChunk> {
    let mut scores: BTreeMap<&str, (f64, &str)> = BTreeMap::new();

    for list in lists {
        let mut seen = HashSet::new();
        for (idx, chunk) in list.iter().enumerate() {
            if !seen.insert(chunk.document_id.as_str()) {
                continue;
            }
            let rank = (idx + 1) as f64;
            let entry = scores
                .entry(chunk.document_id.as_str())
                .or_insert((0.0, chunk.content.as_str()));
            entry.0 += 1.0 / (k + rank);
        }
    }

    let mut fused: Vec<FusedChunk> = scores
        .into_iter()
        .map(|(id, (score, content))| FusedChunk {
            document_id: id.to_string(),
            content: content.to_string(),
            score,
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(ids: &[&str]) -> Vec<RetrievedChunk> {
        ids.iter()
            .map(|id| RetrievedChunk {
                document_id: id.to_string(),
                content: format!("text of {}", id),
                score: 0.0,
            })
            .collect()
    }

    #[test]
    fn test_scores_follow_formula() {
        let fused = reciprocal_rank_fusion(&[list(&["a", "b"]), list(&["b", "c"])], 60.0);

        let b = fused.iter().find(|f| f.document_id == "b").unwrap();
        assert!((b.score - (1.0 / 62.0 + 1.0 / 61.0)).abs() < 1e-12);
        let a = fused.iter().find(|f| f.document_id == "a").unwrap();
        assert!((a.score - 1.0 / 61.0).abs() < 1e-12);

        assert_eq!(fused[0].document_id, "b");
    }

    #[test]
    fn test_ties_broken_by_id() {
        let fused = reciprocal_rank_fusion(&[list(&["z"]), list(&["a"])], 60.0);
        let ids: Vec<_> = fused.iter().map(|f| f.document_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "z"]);
    }

    #[test]
    fn test_deterministic_regardless_of_list_order() {
        let l1 = list(&["a", "b", "c"]);
        let l2 = list(&["c", "d"]);
        let l3 = list(&["d", "a"]);
        let forward = reciprocal_rank_fusion(&[l1.clone(), l2.clone(), l3.clone()], 60.0);
        let again = reciprocal_rank_fusion(&[l1.clone(), l2.clone(), l3.clone()], 60.0);
        assert_eq!(forward, again);

        let backward = reciprocal_rank_fusion(&[l3, l2, l1], 60.0);
        let ids = |v: &[FusedChunk]| v.iter().map(|f| f.document_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&forward), ids(&backward));
    }

    #[test]
    fn test_absent_documents_never_appear() {
        let fused = reciprocal_rank_fusion(&[list(&["a"]), vec![]], 60.0);
        assert_eq!(fused.len(), 1);
        assert!(reciprocal_rank_fusion(&[], 60.0).is_empty());
    }

    #[test]
    fn test_duplicate_in_one_list_counts_once() {
        let fused = reciprocal_rank_fusion(&[list(&["a", "a"])], 60.0);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 1.0 / 61.0).abs() < 1e-12);
    }
}
