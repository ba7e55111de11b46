use anyhow::Result;
use async_trait::async_trait;
use pgvector::Vector;
use std::sync::Arc;

use crate::database::Repository;
use crate::services::embedding_service::EmbeddingService;
use crate::services::gateways::{RetrievalTarget, RetrievedChunk, VectorRetrievalGateway};

/// pgvector-backed retrieval: embed the query, then cosine search the collection.
pub struct PgVectorStore {
    repository: Arc<Repository>,
    embedder: Arc<EmbeddingService>,
}

impl PgVectorStore {
    pub fn new(repository: Arc<Repository>, embedder: Arc<EmbeddingService>) -> Self {
        Self {
            repository,
            embedder,
        }
    }
}

#[async_trait]
impl VectorRetrievalGateway for PgVectorStore {
    async fn similarity_search(
        &self,
        query: &str,
        target: &RetrievalTarget,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let embedding = self
            .embedder
            .embed(query, target.embedding_model.as_deref())
            .await?;

        self.repository
            .search_chunks(&target.collection, Vector::from(embedding), top_k)
            .await
    }
}
