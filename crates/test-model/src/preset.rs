use serde::{Deserialize, Serialize};
use steward_model::{ErrorKind, TokenUsage, ToolCallDelta, ToolCallRequest};

/// The events in a preset response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PresetEvent {
    #[serde(rename = "message_delta")]
    MessageDelta(String),
    #[serde(rename = "tool_call")]
    ToolCall(ToolCallRequest),
    #[serde(rename = "tool_call_delta")]
    ToolCallDelta(ToolCallDelta),
    #[serde(rename = "usage")]
    Usage(TokenUsage),
    /// Fails the stream at this point.
    #[serde(rename = "error")]
    Error(ErrorKind),
    /// Stops producing events without ever completing.
    #[serde(rename = "hang")]
    Hang,
}

impl PresetEvent {
    #[inline]
    pub fn text<S: Into<String>>(text: S) -> Self {
        PresetEvent::MessageDelta(text.into())
    }

    #[inline]
    pub fn tool_call<S1, S2>(
        id: S1,
        name: S2,
        arguments: serde_json::Value,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        PresetEvent::ToolCall(ToolCallRequest {
            id: id.into(),
            name: name.into(),
            arguments,
        })
    }
}

/// The preset response for an assistant step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetResponse {
    /// Events in this response.
    pub events: Vec<PresetEvent>,
    /// If set, the request will fail in the first `failures` attempts.
    /// `Some(0)` means the request will fail infinitely.
    #[serde(default)]
    pub failures: Option<u64>,
    /// The kind of error the failed attempts report.
    #[serde(default = "default_failure_kind")]
    pub failure_kind: ErrorKind,
}

fn default_failure_kind() -> ErrorKind {
    ErrorKind::RateLimitExceeded
}

impl PresetResponse {
    /// Creates a `PresetResponse` with the specified events.
    #[inline]
    pub fn with_events(events: impl Into<Vec<PresetEvent>>) -> Self {
        Self {
            events: events.into(),
            failures: None,
            failure_kind: default_failure_kind(),
        }
    }

    /// Creates a `PresetResponse` that only streams the given text.
    #[inline]
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self::with_events([PresetEvent::text(text)])
    }

    /// Sets failure times before a successful response. `0` means the
    /// response will always be a failure.
    #[inline]
    pub fn with_failures(mut self, failures: u64) -> Self {
        self.failures = Some(failures);
        self
    }

    /// Sets the kind of error reported by failed attempts.
    #[inline]
    pub fn with_failure_kind(mut self, kind: ErrorKind) -> Self {
        self.failure_kind = kind;
        self
    }

    pub(crate) fn requests_tools(&self) -> bool {
        self.events.iter().any(|event| {
            matches!(
                event,
                PresetEvent::ToolCall(_) | PresetEvent::ToolCallDelta(_)
            )
        })
    }
}
