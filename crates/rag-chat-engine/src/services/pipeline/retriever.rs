use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::services::gateways::{RetrievalTarget, RetrievedChunk, VectorRetrievalGateway};
use crate::utils::limiters::Limiters;
use crate::utils::{ChatError, ChatResult};

#[derive(Debug, Clone)]
pub struct VariantHits {
    pub variant: String,
    pub hits: Vec<RetrievedChunk>,
}

#[derive(Debug, Clone)]
pub struct VariantFailure {
    pub variant: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub per_variant: Vec<VariantHits>,
    pub failures: Vec<VariantFailure>,
    pub elapsed_ms: u128,
}

impl RetrievalOutcome {
    /// Ranked hit lists, one per successful variant, in variant order.
    pub fn ranked_lists(&self) -> Vec<Vec<RetrievedChunk>> {
        self.per_variant.iter().map(|v| v.hits.clone()).collect()
    }

    pub fn total_hits(&self) -> usize {
        self.per_variant.iter().map(|v| v.hits.len()).sum()
    }
}

/// Fans similarity searches out across query variants.
pub struct ParallelRetriever {
    vectors: Arc<dyn VectorRetrievalGateway>,
    limiters: Limiters,
}

impl ParallelRetriever {
    pub fn new(vectors: Arc<dyn VectorRetrievalGateway>, limiters: Limiters) -> Self {
        Self { vectors, limiters }
    }

    /// One search per variant, bounded by the retrieval limiter.
    /// Fails only when every variant failed.
    pub async fn retrieve_all(
        &self,
        variants: &[String],
        target: &RetrievalTarget,
        top_k: usize,
    ) -> ChatResult<RetrievalOutcome> {
        if variants.is_empty() {
            return Err(ChatError::RetrievalUnavailable(
                "no query variants to search".to_string(),
            ));
        }

        let start = Instant::now();
        let calls = variants.iter().map(|variant| async move {
            let result = self
                .limiters
                .retrieval_call(
                    "similarity_search",
                    self.vectors.similarity_search(variant, target, top_k),
                )
                .await;
            (variant, result)
        });

        let mut outcome = RetrievalOutcome::default();
        for (variant, result) in join_all(calls).await {
            match result {
                Ok(mut hits) => {
                    hits.truncate(top_k);
                    outcome.per_variant.push(VariantHits {
                        variant: variant.clone(),
                        hits,
                    });
                }
                Err(e) => {
                    warn!(stage = "RETRIEVED", store = %target.store_name, "Variant search failed: {}", e);
                    outcome.failures.push(VariantFailure {
                        variant: variant.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        outcome.elapsed_ms = start.elapsed().as_millis();

        if outcome.per_variant.is_empty() {
            return Err(ChatError::RetrievalUnavailable(
                "document search is currently unavailable".to_string(),
            ));
        }

        debug!(
            variants = variants.len(),
            failures = outcome.failures.len(),
            hits = outcome.total_hits(),
            elapsed_ms = outcome.elapsed_ms as u64,
            "Parallel retrieval finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::{LimitsConfig, RetrievalConfig};
    use crate::services::gateways::MockVectorRetrievalGateway;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;

    struct SlowVectors {
        delay: Duration,
    }

    #[async_trait]
    impl VectorRetrievalGateway for SlowVectors {
        async fn similarity_search(
            &self,
            query: &str,
            _target: &RetrievalTarget,
            _top_k: usize,
        ) -> Result<Vec<RetrievedChunk>> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![chunk(query)])
        }
    }

    fn target() -> RetrievalTarget {
        RetrievalTarget {
            store_name: "default".into(),
            collection: "docs".into(),
            embedding_model: None,
        }
    }

    fn chunk(id: &str) -> RetrievedChunk {
        RetrievedChunk {
            document_id: id.into(),
            content: format!("content {}", id),
            score: 0.9,
        }
    }

    #[tokio::test]
    async fn test_partial_failures_are_excluded() {
        let mut mock = MockVectorRetrievalGateway::new();
        mock.expect_similarity_search().returning(|query, _, _| {
            if query == "bad" {
                Err(anyhow::anyhow!("store down"))
            } else {
                Ok(vec![chunk(query)])
            }
        });
        let retriever = ParallelRetriever::new(Arc::new(mock), Limiters::default());

        let variants = vec!["a".to_string(), "bad".to_string(), "b".to_string()];
        let outcome = retriever.retrieve_all(&variants, &target(), 5).await.unwrap();

        assert_eq!(outcome.per_variant.len(), 2);
        assert_eq!(outcome.per_variant[0].variant, "a");
        assert_eq!(outcome.per_variant[1].variant, "b");
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].variant, "bad");
    }

    #[tokio::test]
    async fn test_all_failures_is_retrieval_unavailable() {
        let mut mock = MockVectorRetrievalGateway::new();
        mock.expect_similarity_search()
            .returning(|_, _, _| Err(anyhow::anyhow!("store down")));
        let retriever = ParallelRetriever::new(Arc::new(mock), Limiters::default());

        let err = retriever
            .retrieve_all(&["x".to_string(), "y".to_string()], &target(), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RetrievalUnavailable(_)));
    }

    #[tokio::test]
    async fn test_hits_truncated_to_top_k() {
        let mut mock = MockVectorRetrievalGateway::new();
        mock.expect_similarity_search()
            .times(1)
            .returning(|_, _, _| Ok(vec![chunk("1"), chunk("2"), chunk("3")]));
        let retriever = ParallelRetriever::new(Arc::new(mock), Limiters::default());

        let outcome = retriever
            .retrieve_all(&["q".to_string()], &target(), 2)
            .await
            .unwrap();
        assert_eq!(outcome.total_hits(), 2);
    }

    #[tokio::test]
    async fn test_variants_beyond_concurrency_wait_for_a_slot() {
        let limits = LimitsConfig {
            acquire_timeout_ms: 50,
            call_timeout_ms: 5_000,
            ..LimitsConfig::default()
        };
        let retrieval = RetrievalConfig {
            concurrency: 2,
            ..RetrievalConfig::default()
        };
        let vectors = Arc::new(SlowVectors {
            delay: Duration::from_millis(150),
        });
        let retriever = ParallelRetriever::new(vectors, Limiters::new(&limits, &retrieval));

        let variants: Vec<String> = (0..8).map(|i| format!("v{}", i)).collect();
        let outcome = retriever.retrieve_all(&variants, &target(), 5).await.unwrap();

        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.per_variant.len(), 8);
        let order: Vec<_> = outcome.per_variant.iter().map(|v| v.variant.clone()).collect();
        assert_eq!(order, variants);
    }
}
