use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::services::gateways::LanguageModelGateway;
use crate::utils::limiters::Limiters;
use crate::utils::text::{dedup_normalized, normalize, parse_model_list};

/// Breaks a query into sub-questions that can be answered in isolation.
pub struct QueryDecomposer {
    llm: Arc<dyn LanguageModelGateway>,
    model: String,
    limiters: Limiters,
    max_sub_questions: usize,
    include_original: bool,
}

impl QueryDecomposer {
    pub fn new(
        llm: Arc<dyn LanguageModelGateway>,
        model: impl Into<String>,
        limiters: Limiters,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            llm,
            model: model.into(),
            limiters,
            max_sub_questions: config.max_sub_questions.max(1),
            include_original: config.include_original_query,
        }
    }

    pub fn build_prompt(&self, query: &str) -> String {
        format!(
            "You are a helpful assistant that generates multiple sub-questions related to an input question.\n\
             The goal is to break down the input into a set of sub-problems / sub-questions that can be answered in isolation.\n\
             Generate multiple search queries related to: {}\n\
             Output ({} queries, one per line):",
            query, self.max_sub_questions
        )
    }

    /// Never empty. Falls back to `[query]` on gateway failure or unparsable output.
    pub async fn decompose(&self, query: &str) -> Vec<String> {
        let prompt = self.build_prompt(query);
        let output = self
            .limiters
            .llm_call("decompose", self.llm.generate_text(&prompt, &self.model))
            .await;

        match output {
            Ok(raw) => {
                let subs = self.assemble(query, &raw);
                debug!(count = subs.len(), "Query decomposed");
                subs
            }
            Err(e) => {
                warn!(stage = "DECOMPOSED", "Decomposition failed, using original query: {}", e);
                vec![query.to_string()]
            }
        }
    }

    /// Parsed sub-questions, capped, with the original query first when configured.
    pub fn assemble(&self, query: &str, raw: &str) -> Vec<String> {
        let mut subs = dedup_normalized(parse_model_list(raw));
        subs.truncate(self.max_sub_questions);

        if subs.is_empty() {
            return vec![query.to_string()];
        }

        let original = normalize(query);
        if self.include_original && !subs.iter().any(|s| normalize(s) == original) {
            subs.insert(0, query.to_string());
        }
        subs
    }
}
