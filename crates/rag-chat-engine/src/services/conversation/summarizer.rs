use anyhow::{bail, Result};
use std::sync::Arc;

use crate::config::SessionConfig;
use crate::models::ChatMessage;
use crate::services::gateways::LanguageModelGateway;
use crate::utils::limiters::Limiters;
use crate::utils::token_estimator::estimate_tokens;

/// Tokens reserved for the fixed instruction text of the summary prompt.
const PROMPT_OVERHEAD_TOKENS: usize = 64;

/// How far a summarization pass should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryMode {
    /// Fold until the tail is within the threshold, keeping the newest message
    Threshold,
    /// Fold every unsummarized message except the newest, regardless of size
    Force,
}

/// Folds conversation history into a rolling summary.
pub struct Summarizer {
    llm: Arc<dyn LanguageModelGateway>,
    model: String,
    limiters: Limiters,
    input_budget: usize,
    batch_size: usize,
}

impl Summarizer {
    pub fn new(
        llm: Arc<dyn LanguageModelGateway>,
        model: impl Into<String>,
        limiters: Limiters,
        config: &SessionConfig,
    ) -> Self {
        Self {
            llm,
            model: model.into(),
            limiters,
            input_budget: config.max_context_length,
            batch_size: config.summarization_batch_size.max(1),
        }
    }

    /// Number of oldest tail messages to fold in the next call.
    ///
    /// Bounded by the input budget left after the existing summary and by the
    /// batch size. Always at least one, never the newest message. Zero means
    /// there is nothing to fold.
    pub fn select_batch(&self, tail: &[ChatMessage], summary: Option<&str>) -> usize {
        let foldable = tail.len().saturating_sub(1);
        if foldable == 0 {
            return 0;
        }

        let summary_tokens = summary.map(estimate_tokens).unwrap_or(0);
        let mut budget_left = self
            .input_budget
            .saturating_sub(PROMPT_OVERHEAD_TOKENS + summary_tokens);

        let mut count = 0;
        for message in tail.iter().take(foldable.min(self.batch_size)) {
            let cost = estimate_tokens(&message.content);
            if count > 0 && cost > budget_left {
                break;
            }
            budget_left = budget_left.saturating_sub(cost);
            count += 1;
        }
        count
    }

    pub fn build_prompt(summary: Option<&str>, messages: &[ChatMessage]) -> String {
        let history = messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content.trim()))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "The following is a chat history between a user and an assistant. \
             Summarize the conversation so far, keeping all important context for future questions.\n\n\
             Previous Summary:\n{}\n\n\
             New Messages:\n{}\n\n\
             Summarized Context:",
            summary.filter(|s| !s.trim().is_empty()).unwrap_or("(none)"),
            history
        )
    }

    /// New summary replacing `summary`, covering `messages` as well.
    pub async fn fold(&self, summary: Option<&str>, messages: &[ChatMessage]) -> Result<String> {
        let prompt = Self::build_prompt(summary, messages);
        let output = self
            .limiters
            .llm_call("summarize", self.llm.generate_text(&prompt, &self.model))
            .await?;

        let output = output.trim();
        if output.is_empty() {
            bail!("summarizer returned empty output");
        }
        Ok(output.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::services::gateways::MockLanguageModelGateway;
    use chrono::Utc;

    fn msg(seq: i64, words: usize) -> ChatMessage {
        ChatMessage {
            session_id: "s".into(),
            seq,
            role: Role::User,
            content: "w ".repeat(words),
            created_at: Utc::now(),
            evaluation_score: None,
            processing_time_ms: None,
        }
    }

    fn summarizer(max_context_length: usize, batch: usize) -> Summarizer {
        let config = SessionConfig {
            max_context_length,
            summarization_threshold: max_context_length / 2,
            summarization_batch_size: batch,
            ..SessionConfig::default()
        };
        Summarizer::new(
            Arc::new(MockLanguageModelGateway::new()),
            "sum",
            Limiters::default(),
            &config,
        )
    }

    #[test]
    fn test_batch_never_includes_newest() {
        let s = summarizer(10_000, 10);
        let tail: Vec<_> = (1..=3).map(|i| msg(i, 5)).collect();
        assert_eq!(s.select_batch(&tail, None), 2);
        assert_eq!(s.select_batch(&tail[..1], None), 0);
    }

    #[test]
    fn test_batch_size_caps_fan_in() {
        let s = summarizer(10_000, 2);
        let tail: Vec<_> = (1..=6).map(|i| msg(i, 5)).collect();
        assert_eq!(s.select_batch(&tail, None), 2);
    }

    #[test]
    fn test_input_budget_limits_batch_but_allows_one() {
        // budget 200 - 64 overhead = 136; each message is 135 tokens
        let s = summarizer(200, 10);
        let tail: Vec<_> = (1..=4).map(|i| msg(i, 100)).collect();
        assert_eq!(s.select_batch(&tail, None), 1);

        // an oversized summary still leaves room for one message
        let big_summary = "x ".repeat(500);
        assert_eq!(
            s.select_batch(&tail, Some(&big_summary)),
            1
        );
    }

    #[test]
    fn test_prompt_includes_previous_summary() {
        let prompt = Summarizer::build_prompt(Some("earlier facts"), &[msg(1, 2)]);
        assert!(prompt.contains("earlier facts"));
        assert!(prompt.contains("user: w w"));
    }

    #[tokio::test]
    async fn test_fold_rejects_empty_output() {
        let mut mock = MockLanguageModelGateway::new();
        mock.expect_generate_text().returning(|_, _| Ok("   ".to_string()));
        let s = Summarizer::new(Arc::new(mock), "sum", Limiters::default(), &SessionConfig::default());
        assert!(s.fold(None, &[msg(1, 3)]).await.is_err());
    }
}
