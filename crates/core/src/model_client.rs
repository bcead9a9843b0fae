use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use steward_model::{
    ModelProvider, ModelProviderError, ModelRequest, ModelResponse,
    ModelResponseEvent,
};
use tracing::Instrument;

pub(crate) type ProviderError = Box<dyn ModelProviderError>;

type OpenResult = Result<ModelStream, ProviderError>;
type HandlerFn =
    Arc<dyn Fn(&ModelRequest) -> BoxFuture<'static, OpenResult> + Send + Sync>;

/// A wrapper around a model provider that provides a type-erased interface
/// for the other modules.
#[derive(Clone)]
pub(crate) struct ModelClient {
    handler_fn: HandlerFn,
}

impl ModelClient {
    pub fn new<P: ModelProvider + 'static>(provider: P) -> Self {
        // We have to erase the type `P`, since `ModelClient` doesn't have a
        // generic parameter and we don't want it either.
        let handler_fn: HandlerFn = Arc::new(move |req: &ModelRequest| {
            trace!("sending a request with {} messages", req.messages.len());
            let fut = provider.send_request(req);
            Box::pin(
                async move {
                    match fut.await {
                        Ok(resp) => Ok(ModelStream::new(resp)),
                        Err(err) => {
                            debug!("request failed: {err}");
                            Err(Box::new(err) as ProviderError)
                        }
                    }
                }
                .instrument(trace_span!("model client req")),
            )
        });
        Self { handler_fn }
    }

    /// Sends a request and returns the opened response stream.
    #[inline]
    pub async fn open(&self, req: &ModelRequest) -> OpenResult {
        (self.handler_fn)(req).await
    }
}

trait ErasedResponse: Send {
    fn poll_next(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, ProviderError>>;
}

struct Erased<R>(Pin<Box<R>>);

impl<R: ModelResponse> ErasedResponse for Erased<R> {
    fn poll_next(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, ProviderError>> {
        self.0
            .as_mut()
            .poll_next_event(cx)
            .map_err(|err| Box::new(err) as ProviderError)
    }
}

/// An opened response. Dropping it closes the underlying stream.
pub(crate) struct ModelStream {
    inner: Box<dyn ErasedResponse>,
}

impl ModelStream {
    fn new<R: ModelResponse>(resp: R) -> Self {
        Self {
            inner: Box::new(Erased(Box::pin(resp))),
        }
    }

    /// Waits for the next event, `None` once the response completed.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe.
    pub async fn next_event(
        &mut self,
    ) -> Result<Option<ModelResponseEvent>, ProviderError> {
        poll_fn(|cx| self.inner.poll_next(cx)).await
    }
}

#[cfg(test)]
mod tests {
    use steward_model::{ErrorKind, ModelMessage};
    use steward_test_model::{PresetEvent, PresetResponse, TestModelProvider};

    use super::*;

    fn request() -> ModelRequest {
        ModelRequest {
            messages: vec![ModelMessage::user("Hi")],
            tools: vec![],
        }
    }

    #[tokio::test]
    async fn test_stream_events() {
        let provider =
            TestModelProvider::with_script([PresetResponse::with_events([
                PresetEvent::text("How "),
                PresetEvent::text("are you?"),
            ])]);
        let client = ModelClient::new(provider);

        let mut stream = client.open(&request()).await.unwrap();
        let mut transcript = String::new();
        while let Some(event) = stream.next_event().await.unwrap() {
            if let ModelResponseEvent::MessageDelta(delta) = event {
                transcript.push_str(&delta);
            }
        }
        assert_eq!(transcript, "How are you?");
    }

    #[tokio::test]
    async fn test_error_handling() {
        let client = ModelClient::new(TestModelProvider::default());
        let err = client.open(&request()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }
}
