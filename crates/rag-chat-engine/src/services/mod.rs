pub mod conversation;
pub mod embedding_service;
pub mod gateways;
pub mod llm_service;
pub mod orchestrator;
pub mod pipeline;
pub mod vector_store;

pub use embedding_service::EmbeddingService;
pub use gateways::{LanguageModelGateway, PersistenceGateway, VectorRetrievalGateway};
pub use llm_service::LlmService;
pub use orchestrator::{EngineConfig, Gateways, RagOrchestrator, RequestStage};
pub use vector_store::PgVectorStore;
