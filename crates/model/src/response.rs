use std::pin::Pin;
use std::task::{self, Poll};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provider::ModelProviderError;

/// A response from the model provider.
///
/// A response is a finite, non-restartable sequence of events. Dropping it
/// closes the underlying stream early.
pub trait ModelResponse: Sized + Send + 'static {
    /// The error type that may be returned by the provider.
    type Error: ModelProviderError;

    /// Attempts to pull out the next event from the response.
    ///
    /// # Return value
    ///
    /// There are several possible return values, each indicating a
    /// distinct response state:
    ///
    /// - `Poll::Pending` means that this response is still waiting for
    ///   the next event. Implementations will ensure that the current
    ///   task will be notified when the next event may be ready.
    /// - `Poll::Ready(Ok(Some(event)))` means the response has an event
    ///   to deliver, and may produce further events on subsequent
    ///   `poll_next_event` calls.
    /// - `Poll::Ready(Ok(None))` means the response has completed.
    /// - `Poll::Ready(Err(error))` means an error occurred while
    ///   processing the response.
    ///
    /// Calling this method after completion should always return `None`.
    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>>;
}

/// The reason why a model response has finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFinishReason {
    /// The model needs to call a tool.
    ToolCalls,
    /// The model has finished generating text.
    Stop,
    /// The model ran out of output tokens.
    Length,
}

/// Describes a tool call request from the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// The unique identifier for the tool call request.
    pub id: String,
    /// The name of the tool to call.
    pub name: String,
    /// The arguments to pass to the tool.
    pub arguments: Value,
}

/// A fragment of a tool call that is still being streamed.
///
/// Fragments sharing the same `index` belong to the same call. The first
/// fragment of a call usually carries its `id` and `name`, later fragments
/// only append to `arguments`, which is JSON text split at arbitrary
/// positions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Position of the call within the response.
    pub index: usize,
    /// The call id, if this fragment declares it.
    pub id: Option<String>,
    /// The tool name, if this fragment declares it.
    pub name: Option<String>,
    /// A piece of the JSON-encoded arguments.
    pub arguments: String,
}

/// Token usage reported by the provider.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct TokenUsage {
    /// Tokens consumed by the input.
    pub input_tokens: u64,
    /// Tokens produced by the model.
    pub output_tokens: u64,
}

/// The event from a model response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelResponseEvent {
    /// The response has been completed.
    Completed(ModelFinishReason),
    /// Received a message delta.
    MessageDelta(String),
    /// Received a complete tool call request.
    ToolCall(ToolCallRequest),
    /// Received a fragment of a tool call request.
    ToolCallDelta(ToolCallDelta),
    /// Received a usage report.
    Usage(TokenUsage),
}
