use futures::future::join_all;
use std::sync::Arc;
use tracing::warn;

use crate::services::gateways::LanguageModelGateway;
use crate::utils::limiters::Limiters;
use crate::utils::text::{dedup_normalized, parse_model_list};

/// Rewrites a sub-question into alternative phrasings for retrieval.
pub struct MultiQueryExpander {
    llm: Arc<dyn LanguageModelGateway>,
    model: String,
    limiters: Limiters,
    fanout: usize,
}

impl MultiQueryExpander {
    pub fn new(
        llm: Arc<dyn LanguageModelGateway>,
        model: impl Into<String>,
        limiters: Limiters,
        fanout: usize,
    ) -> Self {
        Self {
            llm,
            model: model.into(),
            limiters,
            fanout,
        }
    }

    pub fn build_prompt(question: &str, fanout: usize) -> String {
        format!(
            "You are an AI language model assistant. Your task is to generate {} different versions \
             of the given user question to retrieve relevant documents from a vector database. \
             By generating multiple perspectives on the user question, your goal is to help the user \
             overcome some of the limitations of the distance-based similarity search. \
             Provide these alternative questions separated by newlines. Original question: {}",
            fanout, question
        )
    }

    /// Original first, then up to `fanout` distinct variants.
    pub async fn expand(&self, sub_question: &str, fanout: usize) -> Vec<String> {
        if fanout == 0 {
            return vec![sub_question.to_string()];
        }

        let prompt = Self::build_prompt(sub_question, fanout);
        match self
            .limiters
            .llm_call("multiquery", self.llm.generate_text(&prompt, &self.model))
            .await
        {
            Ok(raw) => Self::assemble(sub_question, &raw, fanout),
            Err(e) => {
                warn!(stage = "EXPANDED", "Expansion failed for sub-question, using it alone: {}", e);
                vec![sub_question.to_string()]
            }
        }
    }

    /// Expand every sub-question concurrently; output order matches input order.
    pub async fn expand_all(&self, sub_questions: &[String]) -> Vec<Vec<String>> {
        join_all(sub_questions.iter().map(|q| self.expand(q, self.fanout))).await
    }

    pub fn assemble(original: &str, raw: &str, fanout: usize) -> Vec<String> {
        let mut variants = vec![original.to_string()];
        variants.extend(parse_model_list(raw));
        let mut variants = dedup_normalized(variants);
        if variants.is_empty() {
            // original was whitespace only
            return vec![original.to_string()];
        }
        variants.truncate(fanout + 1);
        variants
    }
}
