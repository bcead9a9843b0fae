use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::response::ToolCallRequest;

/// A request to be sent to the model provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// The input messages.
    pub messages: Vec<ModelMessage>,
    /// Tools that are available to the model.
    pub tools: Vec<ModelTool>,
}

/// A complete message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ModelMessage {
    /// The system instructions.
    System {
        /// Instruction text.
        text: String,
    },
    /// A user input text.
    User {
        /// Input text.
        text: String,
    },
    /// An assistant message, optionally requesting tool calls.
    Assistant {
        /// Text the assistant produced.
        text: String,
        /// Tool calls the assistant requested, in request order.
        tool_calls: Vec<ToolCallRequest>,
    },
    /// A tool call result.
    Tool(ToolCallResult),
}

impl ModelMessage {
    /// Creates a user message.
    #[inline]
    pub fn user<S: Into<String>>(text: S) -> Self {
        ModelMessage::User { text: text.into() }
    }

    /// Creates a system message.
    #[inline]
    pub fn system<S: Into<String>>(text: S) -> Self {
        ModelMessage::System { text: text.into() }
    }
}

/// The result of calling a tool.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// The unique identifier for the tool call request.
    pub id: String,
    /// The result of the tool call.
    pub content: String,
    /// Whether the tool call failed.
    pub is_error: bool,
}

/// Describes a tool that can be used by the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTool {
    /// Name of the tool.
    pub name: String,
    /// Description of the tool.
    pub description: String,
    /// Parameters definition of the tool.
    ///
    /// For most model providers, the parameters should typically be
    /// defined by a [JSON schema](https://json-schema.org/).
    pub parameters: Value,
}
