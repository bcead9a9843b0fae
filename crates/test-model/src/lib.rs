//! A local fake model for testing purpose.

mod preset;

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::future::ready;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use steward_model::{
    ErrorKind, ModelFinishReason, ModelProvider, ModelProviderError,
    ModelRequest, ModelResponse, ModelResponseEvent,
};
use tokio::time::{Sleep, sleep};

pub use preset::*;

#[derive(Debug)]
pub struct Error {
    message: &'static str,
    kind: ErrorKind,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub struct TestModelResponse {
    events: VecDeque<PresetEvent>,
    finish_reason: Option<ModelFinishReason>,
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl ModelResponse for TestModelResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.get_mut();

        if matches!(this.events.front(), Some(PresetEvent::Hang)) {
            // Never woken up again, the consumer has to give up on us.
            return Poll::Pending;
        }

        if let Some(sleep) = &mut this.sleep {
            ready!(sleep.as_mut().poll(cx));
            this.sleep = None;

            let event = match this.events.pop_front() {
                Some(PresetEvent::MessageDelta(msg)) => {
                    ModelResponseEvent::MessageDelta(msg)
                }
                Some(PresetEvent::ToolCall(req)) => {
                    ModelResponseEvent::ToolCall(req)
                }
                Some(PresetEvent::ToolCallDelta(delta)) => {
                    ModelResponseEvent::ToolCallDelta(delta)
                }
                Some(PresetEvent::Usage(usage)) => {
                    ModelResponseEvent::Usage(usage)
                }
                Some(PresetEvent::Error(kind)) => {
                    // Anything after a failure is unreachable.
                    this.events.clear();
                    this.finish_reason = None;
                    return Poll::Ready(Err(Error {
                        message: "scripted stream failure",
                        kind,
                    }));
                }
                Some(PresetEvent::Hang) => unreachable!(),
                None => match this.finish_reason.take() {
                    Some(reason) => ModelResponseEvent::Completed(reason),
                    // In case this method is called after completion.
                    None => return Poll::Ready(Ok(None)),
                },
            };
            return Poll::Ready(Ok(Some(event)));
        }
        this.sleep = Some(Box::pin(sleep(this.delay)));
        Pin::new(this).poll_next_event(cx)
    }
}

#[derive(Default)]
struct Script {
    responses: VecDeque<PresetResponse>,
    failed_attempts: u64,
    requests: Vec<ModelRequest>,
}

/// A local fake model for testing purpose.
///
/// Before sending requests, you need to setup the conversation script, which
/// is how the model should respond to each request. Responses are consumed in
/// order, one per successful request. A response with `failures` set makes
/// the requests fail before it is finally delivered. If there are no enough
/// responses in the script, an error will be returned.
///
/// Clones share the same script, so a test can keep a clone around to
/// inspect the requests received by the engine.
///
/// # Note
///
/// This type is not optimized for production use, there are heavy memory
/// copies involved. You should only use it for testing.
#[derive(Clone, Default)]
pub struct TestModelProvider {
    script: Arc<Mutex<Script>>,
    delay: Option<Duration>,
}

impl TestModelProvider {
    /// Creates a provider that replays the given responses.
    pub fn with_script(
        responses: impl IntoIterator<Item = PresetResponse>,
    ) -> Self {
        let provider = Self::default();
        provider.lock().responses.extend(responses);
        provider
    }

    #[inline]
    pub fn add_assistant_response_step(&mut self, preset: PresetResponse) {
        self.lock().responses.push_back(preset);
    }

    #[inline]
    pub fn set_delay(&mut self, duration: Duration) {
        self.delay = Some(duration);
    }

    /// Returns the number of requests received, including failed ones.
    #[inline]
    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    /// Returns a copy of every request received so far.
    #[inline]
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.lock().requests.clone()
    }

    /// Returns the number of responses not delivered yet.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.lock().responses.len()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        // A panicking test thread must not hide the script from the others.
        self.script.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn next_response(
        &self,
        req: &ModelRequest,
    ) -> Result<TestModelResponse, Error> {
        let mut script = self.lock();
        script.requests.push(req.clone());

        let Some(preset) = script.responses.front() else {
            return Err(Error {
                message: "no enough steps",
                kind: ErrorKind::InvalidRequest,
            });
        };

        if let Some(failures) = preset.failures {
            let kind = preset.failure_kind;
            if failures == 0 || script.failed_attempts < failures {
                script.failed_attempts += 1;
                return Err(Error {
                    message: "scripted request failure",
                    kind,
                });
            }
        }

        script.failed_attempts = 0;
        let Some(preset) = script.responses.pop_front() else {
            unreachable!("the front response was checked above");
        };
        let finish_reason = if preset.requests_tools() {
            ModelFinishReason::ToolCalls
        } else {
            ModelFinishReason::Stop
        };
        Ok(TestModelResponse {
            events: preset.events.into(),
            finish_reason: Some(finish_reason),
            delay: self.delay.unwrap_or(Duration::from_millis(1)),
            sleep: None,
        })
    }
}

impl ModelProvider for TestModelProvider {
    type Error = crate::Error;
    type Response = TestModelResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        ready(self.next_response(req))
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::pin::pin;

    use serde_json::json;
    use steward_model::{ModelMessage, ModelTool, ToolCallRequest};

    use super::*;

    async fn collect_response(
        resp: TestModelResponse,
    ) -> (String, Option<ToolCallRequest>, Option<ModelFinishReason>) {
        let mut resp = pin!(resp);
        let mut msg = String::new();
        let mut tool_call = None;
        let mut finish_reason = None;
        loop {
            let event = poll_fn(|cx| resp.as_mut().poll_next_event(cx))
                .await
                .unwrap();
            match event {
                None => break,
                Some(ModelResponseEvent::Completed(reason)) => {
                    finish_reason = Some(reason);
                }
                Some(ModelResponseEvent::MessageDelta(delta)) => {
                    msg.push_str(&delta);
                }
                Some(ModelResponseEvent::ToolCall(req)) => tool_call = Some(req),
                Some(event) => unreachable!("unexpected event: {event:?}"),
            }
        }
        (msg, tool_call, finish_reason)
    }

    fn request(text: &str) -> ModelRequest {
        ModelRequest {
            messages: vec![ModelMessage::user(text)],
            tools: vec![ModelTool {
                name: "read_file".to_owned(),
                description: "Reads a file".to_owned(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "The path of the file to read"
                        }
                    }
                }),
            }],
        }
    }

    #[tokio::test]
    async fn test_send_request() {
        let mut provider = TestModelProvider::default();
        provider.add_assistant_response_step(PresetResponse::with_events([
            PresetEvent::text("Hello, "),
            PresetEvent::text("world!"),
        ]));
        provider.add_assistant_response_step(PresetResponse::with_events([
            PresetEvent::text("Sure, "),
            PresetEvent::text("let me take a "),
            PresetEvent::text("look."),
            PresetEvent::tool_call(
                "tool:1",
                "read_file",
                json!({ "path": "todo.txt" }),
            ),
        ]));

        let resp = provider.send_request(&request("Hi")).await.unwrap();
        let (msg, _, finish_reason) = collect_response(resp).await;
        assert_eq!(msg, "Hello, world!");
        assert_eq!(finish_reason, Some(ModelFinishReason::Stop));

        let resp = provider
            .send_request(&request("Check my todo"))
            .await
            .unwrap();
        let (msg, tool_call, finish_reason) = collect_response(resp).await;
        assert_eq!(msg, "Sure, let me take a look.");
        assert_eq!(finish_reason, Some(ModelFinishReason::ToolCalls));
        let tool_call = tool_call.unwrap();
        assert_eq!(tool_call.name, "read_file");
        assert_eq!(tool_call.arguments, json!({ "path": "todo.txt" }));

        assert_eq!(provider.request_count(), 2);
        assert_eq!(provider.remaining(), 0);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let provider = TestModelProvider::with_script([
            PresetResponse::text("finally").with_failures(2),
        ]);
        let observer = provider.clone();

        for _ in 0..2 {
            let err =
                provider.send_request(&request("Hi")).await.err().unwrap();
            assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
        }
        let resp = provider.send_request(&request("Hi")).await.unwrap();
        let (msg, _, _) = collect_response(resp).await;
        assert_eq!(msg, "finally");
        assert_eq!(observer.request_count(), 3);

        let err = provider.send_request(&request("Hi")).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_stream_error() {
        let provider = TestModelProvider::with_script([
            PresetResponse::with_events([
                PresetEvent::text("partial"),
                PresetEvent::Error(ErrorKind::ServerError),
            ]),
        ]);
        let resp = provider.send_request(&request("Hi")).await.unwrap();
        let mut resp = pin!(resp);

        let first = poll_fn(|cx| resp.as_mut().poll_next_event(cx)).await;
        assert!(matches!(
            first,
            Ok(Some(ModelResponseEvent::MessageDelta(_)))
        ));
        let second = poll_fn(|cx| resp.as_mut().poll_next_event(cx)).await;
        assert_eq!(second.err().unwrap().kind(), ErrorKind::ServerError);
    }
}
