//! Context compaction.
//!
//! Before every request the history is bounded to the context budget. The
//! newest messages are kept as they are and everything older is replaced by
//! a single summary message. The session itself is never rewritten, only
//! the view sent to the provider is.
//!
//! Messages are kept or dropped by unit: an assistant message together with
//! the tool-result message answering its calls, so the provider never sees
//! a call without its result or the other way around.

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use steward_model::ModelMessage;

use crate::conversation::{Message, MessageId, Role};

/// Estimates the token cost of a message.
pub trait CostEstimator: Send + Sync {
    /// Returns the estimated cost of `message`.
    fn estimate(&self, message: &Message) -> usize;
}

/// Produces the text of a summary message.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarizes `messages`, oldest first.
    async fn summarize(&self, messages: &[Message]) -> String;
}

/// Estimates a token per four characters of content, plus a fixed
/// overhead per message.
#[derive(Clone, Copy, Debug)]
pub struct CharEstimator {
    /// Cost added to every message.
    pub overhead: usize,
}

impl Default for CharEstimator {
    fn default() -> Self {
        Self { overhead: 4 }
    }
}

impl CostEstimator for CharEstimator {
    fn estimate(&self, message: &Message) -> usize {
        let mut chars = message.text.chars().count();
        for call in &message.tool_calls {
            chars += call.name.len() + call.arguments.to_string().len();
        }
        for result in &message.tool_results {
            chars += result.content.chars().count();
        }
        chars.div_ceil(4) + self.overhead
    }
}

/// Summarizes by quoting the beginning of every message.
///
/// The output only depends on the messages, which keeps tests reproducible.
#[derive(Clone, Copy, Debug)]
pub struct ExtractiveSummarizer {
    /// Characters quoted per message.
    pub excerpt_chars: usize,
    /// Upper bound of the whole summary.
    pub max_chars: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self {
            excerpt_chars: 80,
            max_chars: 2_000,
        }
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, messages: &[Message]) -> String {
        let mut summary = format!("{} earlier messages.", messages.len());
        for msg in messages {
            let text = excerpt(&msg.text, self.excerpt_chars);
            let line = match msg.role {
                Role::User => format!("user: {text}"),
                Role::Assistant if msg.tool_calls.is_empty() => {
                    format!("assistant: {text}")
                }
                Role::Assistant => {
                    let tools: Vec<_> = msg
                        .tool_calls
                        .iter()
                        .map(|call| call.name.as_str())
                        .collect();
                    format!("assistant called {}", tools.join(", "))
                }
                Role::ToolResult => continue,
                Role::Summary => text,
            };
            if summary.len() + line.len() + 1 > self.max_chars {
                break;
            }
            summary.push('\n');
            summary.push_str(&line);
        }
        summary
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_owned(),
    }
}

/// The bounded history sent with one request.
#[derive(Clone, Debug, PartialEq)]
pub struct View {
    /// The messages, starting with the summary if any.
    pub messages: Vec<Message>,
    /// Estimated cost of `messages`.
    pub cost: usize,
    /// Session messages replaced by the summary.
    pub summarized: usize,
    /// The newest message replaced by the summary.
    pub watermark: Option<MessageId>,
}

impl View {
    /// Returns `true` if some messages were left out.
    #[inline]
    pub fn is_compacted(&self) -> bool {
        self.summarized > 0
    }

    /// Converts the view to the form sent to the provider.
    pub fn to_model_messages(&self) -> Vec<ModelMessage> {
        self.messages
            .iter()
            .flat_map(Message::to_model_messages)
            .collect()
    }
}

/// Error of [`Compactor::build_view`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CompactionError {
    /// The newest unit alone costs more than the budget.
    #[error("context budget of {budget} exceeded, {needed} needed")]
    BudgetExceeded {
        /// Estimated cost of the newest unit.
        needed: usize,
        /// The budget.
        budget: usize,
    },
}

/// Bounds histories to a budget.
#[derive(Clone)]
pub struct Compactor {
    estimator: Arc<dyn CostEstimator>,
    summarizer: Arc<dyn Summarizer>,
}

impl Default for Compactor {
    fn default() -> Self {
        Self::new(
            Arc::new(CharEstimator::default()),
            Arc::new(ExtractiveSummarizer::default()),
        )
    }
}

impl Compactor {
    /// Creates a compactor with the given capabilities.
    #[inline]
    pub fn new(
        estimator: Arc<dyn CostEstimator>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            estimator,
            summarizer,
        }
    }

    /// Returns the estimated cost of `messages`.
    pub fn cost(&self, messages: &[Message]) -> usize {
        messages.iter().map(|msg| self.estimator.estimate(msg)).sum()
    }

    /// Builds the view of `messages` that fits `budget`.
    ///
    /// A history that fits is returned unchanged, so building the view of
    /// a view gives the same view back.
    pub async fn build_view(
        &self,
        messages: &[Message],
        budget: usize,
    ) -> Result<View, CompactionError> {
        let costs: Vec<_> = messages
            .iter()
            .map(|msg| self.estimator.estimate(msg))
            .collect();
        let total: usize = costs.iter().sum();
        if total <= budget {
            return Ok(View {
                messages: messages.to_vec(),
                cost: total,
                summarized: 0,
                watermark: None,
            });
        }

        let units = split_units(messages);
        let unit_cost =
            |unit: &Range<usize>| costs[unit.clone()].iter().sum::<usize>();

        // Newest units that fit on their own.
        let mut kept_cost = 0;
        let mut first_kept = units.len();
        for unit in units.iter().rev() {
            let cost = unit_cost(unit);
            if kept_cost + cost > budget {
                break;
            }
            kept_cost += cost;
            first_kept -= 1;
        }
        if first_kept == units.len() {
            let needed = units.last().map_or(0, |unit| unit_cost(unit));
            return Err(CompactionError::BudgetExceeded { needed, budget });
        }

        // Make room for the summary by folding more units into it.
        while first_kept < units.len() {
            let start = units[first_kept].start;
            let summarized = &messages[..start];
            let text = self.summarizer.summarize(summarized).await;
            let watermark = summarized.last().map(|msg| msg.id);
            let summary =
                Message::summary(watermark.unwrap_or_default(), text);
            let summary_cost = self.estimator.estimate(&summary);
            if summary_cost + kept_cost <= budget {
                trace!("compacted {start} messages, summary {summary_cost}");
                let mut view = Vec::with_capacity(messages.len() - start + 1);
                view.push(summary);
                view.extend_from_slice(&messages[start..]);
                return Ok(View {
                    messages: view,
                    cost: summary_cost + kept_cost,
                    summarized: start,
                    watermark,
                });
            }
            if first_kept + 1 == units.len() {
                break;
            }
            kept_cost -= unit_cost(&units[first_kept]);
            first_kept += 1;
        }

        let start = units[first_kept].start;
        warn!("summary doesn't fit the context budget, leaving it out");
        Ok(View {
            messages: messages[start..].to_vec(),
            cost: kept_cost,
            summarized: start,
            watermark: start.checked_sub(1).map(|idx| messages[idx].id),
        })
    }
}

/// Splits messages into units that are kept or dropped together.
fn split_units(messages: &[Message]) -> Vec<Range<usize>> {
    let mut units: Vec<Range<usize>> = vec![];
    for (idx, msg) in messages.iter().enumerate() {
        match units.last_mut() {
            Some(unit) if msg.role == Role::ToolResult => unit.end = idx + 1,
            _ => units.push(idx..idx + 1),
        }
    }
    units
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::conversation::{ToolCall, ToolOutcome, ToolResultEntry};

    /// Every message costs its text length, a summary costs 3.
    struct LenEstimator;

    impl CostEstimator for LenEstimator {
        fn estimate(&self, message: &Message) -> usize {
            match message.role {
                Role::Summary => 3,
                _ => message.text.len() + message.tool_calls.len(),
            }
        }
    }

    struct FixedSummarizer;

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, messages: &[Message]) -> String {
            format!("{} messages", messages.len())
        }
    }

    fn compactor() -> Compactor {
        Compactor::new(Arc::new(LenEstimator), Arc::new(FixedSummarizer))
    }

    fn history() -> Vec<Message> {
        let call = ToolCall::new("call_1", "glob", json!({}));
        vec![
            Message::user(0, "aaaa"),
            Message::assistant(1, "bbb", vec![call], None),
            Message::tool_results(
                2,
                vec![ToolResultEntry {
                    call_id: "call_1".to_owned(),
                    tool_name: "glob".to_owned(),
                    outcome: ToolOutcome::Succeeded,
                    content: String::new(),
                }],
            ),
            Message::assistant(3, "cc", vec![], None),
            Message::user(4, "dddd"),
        ]
    }

    #[tokio::test]
    async fn test_fitting_history_is_unchanged() {
        let messages = history();
        let view = compactor().build_view(&messages, 100).await.unwrap();
        assert_eq!(view.messages, messages);
        assert!(!view.is_compacted());
    }

    #[tokio::test]
    async fn test_units_stay_together() {
        let messages = history();
        // Costs: 4, 4, 0, 2, 4. The tool unit costs 4 and can't be split.
        let view = compactor().build_view(&messages, 11).await.unwrap();
        assert_eq!(view.summarized, 3);
        assert_eq!(view.watermark, Some(2));
        assert_eq!(view.messages[0].role, Role::Summary);
        assert_eq!(view.messages[0].text, "3 messages");
        assert_eq!(view.messages[1].id, 3);
        assert!(view.cost <= 11);
    }

    #[tokio::test]
    async fn test_view_of_view_is_stable() {
        let messages = history();
        let compactor = compactor();
        for budget in 4..16 {
            let view = compactor.build_view(&messages, budget).await.unwrap();
            assert!(view.cost <= budget);
            assert_eq!(view.cost, compactor.cost(&view.messages));

            let again =
                compactor.build_view(&view.messages, budget).await.unwrap();
            assert_eq!(again.cost, view.cost);
            assert_eq!(again.messages, view.messages);
        }
    }

    #[tokio::test]
    async fn test_summary_left_out_when_it_never_fits() {
        let messages = history();
        let view = compactor().build_view(&messages, 5).await.unwrap();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].id, 4);
        assert_eq!(view.watermark, Some(3));
    }

    #[tokio::test]
    async fn test_budget_exceeded() {
        let messages = history();
        let err = compactor().build_view(&messages, 3).await.unwrap_err();
        assert_eq!(
            err,
            CompactionError::BudgetExceeded {
                needed: 4,
                budget: 3
            }
        );
    }

    #[tokio::test]
    async fn test_extractive_summary_is_deterministic() {
        let summarizer = ExtractiveSummarizer::default();
        let messages = history();
        let first = summarizer.summarize(&messages).await;
        assert_eq!(first, summarizer.summarize(&messages).await);
        assert!(first.contains("assistant called glob"));
    }
}
