use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::post_processor::{render_context, ContextChunk};
use crate::config::LimitsConfig;
use crate::services::conversation::SessionContext;
use crate::services::gateways::LanguageModelGateway;
use crate::utils::limiters::Limiters;
use crate::utils::text::parse_model_list;
use crate::utils::{ChatError, ChatResult};

pub const MAX_SUGGESTIONS: usize = 3;

pub const FALLBACK_SUGGESTION: &str =
    "Could you clarify which part of your question you would like me to explore further?";

static SUGGESTIONS_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*\**\s*suggested\s+(?:follow[- ]up\s+)?questions\s*\**\s*:?\s*\**\s*$")
        .expect("valid suggestions header regex")
});

static ANSWER_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*\**\s*answer\s*\**\s*:\s*\**").expect("valid answer regex"));

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAnswer {
    pub answer: String,
    /// Never empty
    pub suggested_questions: Vec<String>,
    pub attempts: u32,
}

/// Produces the answer and follow-up suggestions in one model call.
pub struct ResponseGenerator {
    llm: Arc<dyn LanguageModelGateway>,
    model: String,
    limiters: Limiters,
    retries: u32,
    backoff: Duration,
}

impl ResponseGenerator {
    pub fn new(
        llm: Arc<dyn LanguageModelGateway>,
        model: impl Into<String>,
        limiters: Limiters,
        limits: &LimitsConfig,
    ) -> Self {
        Self {
            llm,
            model: model.into(),
            limiters,
            retries: limits.generation_retries.max(1),
            backoff: Duration::from_millis(limits.retry_backoff_ms),
        }
    }

    pub fn build_prompt(query: &str, chunks: &[ContextChunk], memory: &SessionContext) -> String {
        let mut prompt = String::from(
            "You are a helpful assistant. Answer the question based only on the provided context \
             and the conversation so far. If the context does not contain the answer, say so.\n\n",
        );

        if let Some(summary) = memory.summary.as_deref().filter(|s| !s.trim().is_empty()) {
            prompt.push_str("Conversation summary:\n");
            prompt.push_str(summary.trim());
            prompt.push_str("\n\n");
        }

        if !memory.history.is_empty() {
            prompt.push_str("Recent conversation:\n");
            for message in &memory.history {
                prompt.push_str(&format!("{}: {}\n", message.role.as_str(), message.content.trim()));
            }
            prompt.push('\n');
        }

        prompt.push_str("Context:\n");
        if chunks.is_empty() {
            prompt.push_str("(no relevant documents found)");
        } else {
            prompt.push_str(&render_context(chunks));
        }

        prompt.push_str(&format!(
            "\n\nQuestion: {}\n\n\
             Respond in exactly this format:\n\
             ANSWER:\n<your answer>\n\n\
             SUGGESTED QUESTIONS:\n- <follow-up question>\n- <follow-up question>\n- <follow-up question>",
            query
        ));
        prompt
    }

    /// Split raw model output into answer and suggestions.
    pub fn parse_output(raw: &str) -> (String, Vec<String>) {
        let (answer_part, suggestions_part) = match SUGGESTIONS_HEADER.find(raw) {
            Some(m) => (&raw[..m.start()], &raw[m.end()..]),
            None => (raw, ""),
        };

        let answer = ANSWER_PREFIX.replace(answer_part, "").trim().to_string();
        let mut suggestions: Vec<String> = parse_model_list(suggestions_part)
            .into_iter()
            .filter(|s| s.len() > 3)
            .collect();
        suggestions.truncate(MAX_SUGGESTIONS);
        (answer, suggestions)
    }

    /// Retries with linear backoff; `GenerationFailed` when every attempt failed
    /// or produced an empty answer.
    pub async fn generate(
        &self,
        query: &str,
        chunks: &[ContextChunk],
        memory: &SessionContext,
    ) -> ChatResult<GeneratedAnswer> {
        let prompt = Self::build_prompt(query, chunks, memory);

        for attempt in 1..=self.retries {
            let result = self
                .limiters
                .llm_call("generate", self.llm.generate_text(&prompt, &self.model))
                .await;

            match result {
                Ok(raw) => {
                    let (answer, mut suggestions) = Self::parse_output(&raw);
                    if !answer.is_empty() {
                        if suggestions.is_empty() {
                            suggestions.push(FALLBACK_SUGGESTION.to_string());
                        }
                        debug!(attempt, suggestions = suggestions.len(), "Response generated");
                        return Ok(GeneratedAnswer {
                            answer,
                            suggested_questions: suggestions,
                            attempts: attempt,
                        });
                    }
                    warn!(
                        session_id = %memory.session_id,
                        stage = "GENERATED",
                        attempt,
                        "Model returned an empty answer"
                    );
                }
                Err(e) => {
                    warn!(
                        session_id = %memory.session_id,
                        stage = "GENERATED",
                        attempt,
                        "LLM call failed: {:#}",
                        e
                    );
                }
            }

            if attempt < self.retries {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }

        Err(ChatError::GenerationFailed(
            "the assistant could not generate a response".to_string(),
        ))
    }
}
