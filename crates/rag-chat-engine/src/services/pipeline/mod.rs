//! Retrieval pipeline stages
//!
//! decompose -> expand -> retrieve -> fuse -> build context -> generate -> evaluate.
//! Every stage except retrieval and generation degrades instead of failing.

pub mod decomposer;
pub mod evaluator;
pub mod expander;
pub mod fusion;
pub mod generator;
pub mod post_processor;
pub mod retriever;

pub use decomposer::QueryDecomposer;
pub use evaluator::{EvaluationOutcome, ResponseEvaluator, NEUTRAL_SCORE};
pub use expander::MultiQueryExpander;
pub use fusion::{reciprocal_rank_fusion, FusedChunk};
pub use generator::{GeneratedAnswer, ResponseGenerator};
pub use post_processor::{build_context, ContextChunk};
pub use retriever::{ParallelRetriever, RetrievalOutcome, VariantFailure, VariantHits};
