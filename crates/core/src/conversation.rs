//! Conversation-related types.
//!
//! A session is an ordered list of [`Message`]s. Assistant messages own the
//! [`ToolCall`]s the model asked for, and the tool-result message that
//! follows them carries one [`ToolResultEntry`] per call, in the same order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use steward_model::{
    ModelMessage, TokenUsage, ToolCallRequest, ToolCallResult,
};

use crate::tool::Error as ToolError;

/// Identifier of a message, unique within its session.
pub type MessageId = u64;

/// Author of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Text typed by the user.
    User,
    /// Output of the model.
    Assistant,
    /// Results of the tool calls of the preceding assistant message.
    ToolResult,
    /// A synthetic digest of compacted history. Only found in views built
    /// by the compactor, never in a session.
    Summary,
}

/// A message in the conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Identifier of the message.
    pub id: MessageId,
    /// Author of the message.
    pub role: Role,
    /// Text content, may be empty for tool-only messages.
    pub text: String,
    /// Tool calls requested by an assistant message, in request order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Results carried by a tool-result message, in call order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResultEntry>,
    /// Token usage reported by the provider for an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a user message.
    pub fn user<S: Into<String>>(id: MessageId, text: S) -> Self {
        Self::new(id, Role::User, text.into())
    }

    /// Creates an assistant message.
    pub fn assistant<S: Into<String>>(
        id: MessageId,
        text: S,
        tool_calls: Vec<ToolCall>,
        usage: Option<TokenUsage>,
    ) -> Self {
        Self {
            tool_calls,
            usage,
            ..Self::new(id, Role::Assistant, text.into())
        }
    }

    /// Creates a tool-result message.
    pub fn tool_results(id: MessageId, results: Vec<ToolResultEntry>) -> Self {
        Self {
            tool_results: results,
            ..Self::new(id, Role::ToolResult, String::new())
        }
    }

    /// Creates a summary message standing for compacted history.
    pub fn summary<S: Into<String>>(id: MessageId, text: S) -> Self {
        Self::new(id, Role::Summary, text.into())
    }

    fn new(id: MessageId, role: Role, text: String) -> Self {
        Self {
            id,
            role,
            text,
            tool_calls: vec![],
            tool_results: vec![],
            usage: None,
            timestamp: Utc::now(),
        }
    }

    /// Returns `true` if every tool call of this message is terminal.
    #[inline]
    pub fn is_settled(&self) -> bool {
        self.tool_calls.iter().all(|call| call.status().is_terminal())
    }

    /// Converts this message to the form sent to the provider.
    ///
    /// A tool-result message expands to one provider message per result.
    pub fn to_model_messages(&self) -> Vec<ModelMessage> {
        match self.role {
            Role::User => vec![ModelMessage::user(self.text.clone())],
            Role::Assistant => vec![ModelMessage::Assistant {
                text: self.text.clone(),
                tool_calls: self
                    .tool_calls
                    .iter()
                    .map(ToolCall::to_request)
                    .collect(),
            }],
            Role::ToolResult => self
                .tool_results
                .iter()
                .map(|result| {
                    ModelMessage::Tool(ToolCallResult {
                        id: result.call_id.clone(),
                        content: result.content.clone(),
                        is_error: result.outcome != ToolOutcome::Succeeded,
                    })
                })
                .collect(),
            Role::Summary => vec![ModelMessage::system(format!(
                "Summary of the earlier conversation:\n{}",
                self.text
            ))],
        }
    }
}

/// A tool call requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier assigned by the provider.
    pub id: String,
    /// Name of the requested tool.
    pub name: String,
    /// Raw arguments, validated when the call is executed.
    pub arguments: Value,
    status: ToolCallStatus,
}

impl ToolCall {
    /// Creates a pending tool call.
    pub fn new<S1, S2>(id: S1, name: S2, arguments: Value) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            status: ToolCallStatus::Pending,
        }
    }

    /// Returns the current status.
    #[inline]
    pub fn status(&self) -> &ToolCallStatus {
        &self.status
    }

    /// Moves the call to `next`.
    ///
    /// Calls only move forward: a state is never revisited and a terminal
    /// call doesn't change anymore.
    pub fn advance(
        &mut self,
        next: ToolCallStatus,
    ) -> Result<(), InvalidTransition> {
        if next.rank() <= self.status.rank() {
            return Err(InvalidTransition {
                call_id: self.id.clone(),
                from: self.status.name(),
                to: next.name(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Returns the result entry of a terminal call.
    pub fn result_entry(&self) -> Option<ToolResultEntry> {
        let (outcome, content) = match &self.status {
            ToolCallStatus::Succeeded { output } => {
                (ToolOutcome::Succeeded, output.clone())
            }
            ToolCallStatus::Failed { error } => {
                (ToolOutcome::Failed, format!("error: {error}"))
            }
            ToolCallStatus::Cancelled { reason } => {
                (ToolOutcome::Cancelled, format!("cancelled: {reason}"))
            }
            _ => return None,
        };
        Some(ToolResultEntry {
            call_id: self.id.clone(),
            tool_name: self.name.clone(),
            outcome,
            content,
        })
    }

    fn to_request(&self) -> ToolCallRequest {
        ToolCallRequest {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

/// Status of a tool call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Declared by the model, not looked at yet.
    Pending,
    /// Waiting for the user to approve it.
    AwaitingApproval,
    /// Being executed.
    Running,
    /// Finished with an output.
    Succeeded {
        /// What the tool returned.
        output: String,
    },
    /// Finished with an error, possibly without running at all.
    Failed {
        /// What went wrong.
        error: ToolError,
    },
    /// Given up on before it could finish.
    Cancelled {
        /// Why the call was given up on.
        reason: String,
    },
}

impl ToolCallStatus {
    /// Returns `true` for succeeded, failed and cancelled calls.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    fn rank(&self) -> u8 {
        match self {
            ToolCallStatus::Pending => 0,
            ToolCallStatus::AwaitingApproval => 1,
            ToolCallStatus::Running => 2,
            ToolCallStatus::Succeeded { .. }
            | ToolCallStatus::Failed { .. }
            | ToolCallStatus::Cancelled { .. } => 3,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ToolCallStatus::Pending => "pending",
            ToolCallStatus::AwaitingApproval => "awaiting-approval",
            ToolCallStatus::Running => "running",
            ToolCallStatus::Succeeded { .. } => "succeeded",
            ToolCallStatus::Failed { .. } => "failed",
            ToolCallStatus::Cancelled { .. } => "cancelled",
        }
    }
}

/// A tool call was asked to move backward.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("tool call `{call_id}` cannot move from {from} to {to}")]
pub struct InvalidTransition {
    /// The call.
    pub call_id: String,
    /// Its current state.
    pub from: &'static str,
    /// The rejected state.
    pub to: &'static str,
}

/// How a tool call ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    /// The tool returned an output.
    Succeeded,
    /// The call failed, see the content for why.
    Failed,
    /// The call was given up on.
    Cancelled,
}

/// The result of one tool call, as reported back to the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultEntry {
    /// The call this result belongs to.
    pub call_id: String,
    /// Name of the tool.
    pub tool_name: String,
    /// How the call ended.
    pub outcome: ToolOutcome,
    /// Output or error text.
    pub content: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_forward_only_transitions() {
        let mut call = ToolCall::new("call_1", "write_file", json!({}));
        call.advance(ToolCallStatus::AwaitingApproval).unwrap();
        call.advance(ToolCallStatus::Running).unwrap();

        let err = call.advance(ToolCallStatus::Pending).unwrap_err();
        assert_eq!(err.from, "running");
        assert_eq!(err.to, "pending");

        call.advance(ToolCallStatus::Succeeded {
            output: "done".to_owned(),
        })
        .unwrap();
        assert!(call.status().is_terminal());
        assert!(
            call.advance(ToolCallStatus::Cancelled {
                reason: "late".to_owned()
            })
            .is_err()
        );
    }

    #[test]
    fn test_approval_can_be_skipped() {
        let mut call = ToolCall::new("call_1", "glob", json!({}));
        call.advance(ToolCallStatus::Running).unwrap();
        assert!(call.advance(ToolCallStatus::AwaitingApproval).is_err());
    }

    #[test]
    fn test_result_entry() {
        let mut call = ToolCall::new("call_1", "glob", json!({}));
        assert!(call.result_entry().is_none());

        call.advance(ToolCallStatus::Failed {
            error: ToolError::permission_denied().with_reason("nope"),
        })
        .unwrap();
        let entry = call.result_entry().unwrap();
        assert_eq!(entry.outcome, ToolOutcome::Failed);
        assert_eq!(entry.content, "error: permission denied: nope");
    }

    #[test]
    fn test_tool_result_message_expands() {
        let msg = Message::tool_results(
            3,
            vec![
                ToolResultEntry {
                    call_id: "a".to_owned(),
                    tool_name: "glob".to_owned(),
                    outcome: ToolOutcome::Succeeded,
                    content: "src/lib.rs".to_owned(),
                },
                ToolResultEntry {
                    call_id: "b".to_owned(),
                    tool_name: "shell".to_owned(),
                    outcome: ToolOutcome::Cancelled,
                    content: "cancelled: turn cancelled".to_owned(),
                },
            ],
        );
        let model_messages = msg.to_model_messages();
        assert_eq!(model_messages.len(), 2);
        assert!(matches!(
            &model_messages[1],
            ModelMessage::Tool(ToolCallResult {
                id,
                is_error: true,
                ..
            }) if id == "b"
        ));
    }
}
