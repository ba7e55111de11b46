use std::collections::HashSet;

use super::fusion::FusedChunk;
use crate::utils::text::normalized_hash;
use crate::utils::token_estimator::estimate_tokens;

#[derive(Debug, Clone, PartialEq)]
pub struct ContextChunk {
    pub document_id: String,
    pub content: String,
    pub score: f64,
    pub tokens: usize,
}

/// Grounding context within `token_budget`, in fused order.
///
/// Near-identical chunks (same normalized text) are kept once. Chunks are
/// never split; one that would overflow is skipped and smaller ones after
/// it may still fit.
pub fn build_context(fused: &[FusedChunk], token_budget: usize) -> Vec<ContextChunk> {
    let mut seen = HashSet::new();
    let mut used = 0usize;
    let mut context = Vec::new();

    for chunk in fused {
        if chunk.content.trim().is_empty() {
            continue;
        }
        if !seen.insert(normalized_hash(&chunk.content)) {
            continue;
        }

        let tokens = estimate_tokens(&chunk.content);
        if used + tokens > token_budget {
            continue;
        }

        used += tokens;
        context.push(ContextChunk {
            document_id: chunk.document_id.clone(),
            content: chunk.content.clone(),
            score: chunk.score,
            tokens,
        });
    }

    context
}

/// Numbered context block used in prompts.
pub fn render_context(chunks: &[ContextChunk]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(i, c)| format!("[{}] {}", i + 1, c.content.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fused(id: &str, content: &str, score: f64) -> FusedChunk {
        FusedChunk {
            document_id: id.into(),
            content: content.into(),
            score,
        }
    }

    #[test]
    fn test_near_duplicates_dropped() {
        let input = vec![
            fused("1", "AI improves diagnosis", 0.3),
            fused("2", "ai   improves DIAGNOSIS", 0.2),
            fused("3", "AI lowers costs", 0.1),
        ];
        let ctx = build_context(&input, 1000);
        let ids: Vec<_> = ctx.iter().map(|c| c.document_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn test_overflowing_chunk_skipped_not_split() {
        let big = "word ".repeat(100); // 135 tokens
        let input = vec![
            fused("small-1", "three small words", 0.5), // 9 tokens
            fused("big", &big, 0.4),
            fused("small-2", "two words", 0.3), // 8 tokens
        ];
        let ctx = build_context(&input, 20);
        let ids: Vec<_> = ctx.iter().map(|c| c.document_id.as_str()).collect();
        assert_eq!(ids, vec!["small-1", "small-2"]);
        assert!(ctx.iter().map(|c| c.tokens).sum::<usize>() <= 20);
        assert!(ctx.iter().all(|c| c.content == "three small words" || c.content == "two words"));
    }

    #[test]
    fn test_zero_budget_yields_nothing() {
        assert!(build_context(&[fused("1", "text", 1.0)], 0).is_empty());
    }

    #[test]
    fn test_render_context_numbers_chunks() {
        let ctx = build_context(&[fused("1", "alpha", 1.0), fused("2", "beta", 0.5)], 100);
        assert_eq!(render_context(&ctx), "[1] alpha\n\n[2] beta");
    }
}
