use std::sync::Arc;
use tracing::warn;

use super::post_processor::{render_context, ContextChunk};
use crate::services::gateways::LanguageModelGateway;
use crate::utils::limiters::Limiters;
use crate::utils::text::truncate_chars;

/// Score reported when the evaluator cannot produce one.
pub const NEUTRAL_SCORE: f32 = 0.5;

const MAX_CONTEXT_CHARS: usize = 6000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationOutcome {
    /// Always within [0, 1]
    pub score: f32,
    /// True when `score` is the neutral fallback
    pub degraded: bool,
}

impl EvaluationOutcome {
    fn neutral() -> Self {
        Self {
            score: NEUTRAL_SCORE,
            degraded: true,
        }
    }
}

/// Rates an answer against its grounding context. Never fails.
pub struct ResponseEvaluator {
    llm: Arc<dyn LanguageModelGateway>,
    model: String,
    limiters: Limiters,
}

impl ResponseEvaluator {
    pub fn new(llm: Arc<dyn LanguageModelGateway>, model: impl Into<String>, limiters: Limiters) -> Self {
        Self {
            llm,
            model: model.into(),
            limiters,
        }
    }

    pub fn build_prompt(query: &str, answer: &str, chunks: &[ContextChunk]) -> String {
        let context = render_context(chunks);
        format!(
            "Evaluate the quality of the following response to a user query based on the given context.\n\
             Rate the response on a scale of 0.0 to 1.0 considering:\n\
             - Relevance to the query\n\
             - Accuracy based on context\n\
             - Completeness of the answer\n\n\
             Query: {}\n\
             Context: {}\n\
             Response: {}\n\n\
             Provide only a numeric score (0.0-1.0):",
            query,
            truncate_chars(&context, MAX_CONTEXT_CHARS),
            answer
        )
    }

    pub async fn evaluate(&self, query: &str, answer: &str, chunks: &[ContextChunk]) -> EvaluationOutcome {
        let prompt = Self::build_prompt(query, answer, chunks);
        let result = self
            .limiters
            .llm_call("evaluate", self.llm.score_text(&prompt, &self.model))
            .await;

        match result {
            Ok(Some(score)) if score.is_finite() => EvaluationOutcome {
                score: score.clamp(0.0, 1.0) as f32,
                degraded: false,
            },
            Ok(_) => {
                warn!(stage = "EVALUATED", "Evaluator output had no usable score, using neutral score");
                EvaluationOutcome::neutral()
            }
            Err(e) => {
                warn!(stage = "EVALUATED", "Evaluation failed, using neutral score: {:#}", e);
                EvaluationOutcome::neutral()
            }
        }
    }
}
