//! Requesting the provider and assembling its streamed reply.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};
use std::time::Duration;

use backoff::backoff::Backoff;
use serde_json::Value;
use steward_model::{
    ErrorKind, ModelFinishReason, ModelProviderError, ModelRequest,
    ModelResponseEvent, TokenUsage, ToolCallDelta,
};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::conversation::{MessageId, ToolCall, ToolCallStatus};
use crate::error::TurnFailure;
use crate::event::{Emitter, EventKind};
use crate::model_client::ModelClient;
use crate::tool::Error as ToolError;

/// What the model produced in one round.
#[derive(Debug, Default)]
pub(super) struct Reply {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<ModelFinishReason>,
}

impl Reply {
    /// Returns `true` if nothing worth keeping was produced.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.tool_calls.is_empty()
    }
}

pub(super) enum StreamOutcome {
    Completed(Reply),
    /// Cancelled by the caller, with what was streamed so far.
    Cancelled(Reply),
    /// Failed, with what was streamed so far.
    Failed(TurnFailure, Reply),
}

/// Sends `request`, retrying transient failures of attempts that didn't
/// publish anything yet.
pub(super) async fn request_with_retry(
    client: &ModelClient,
    request: &ModelRequest,
    config: &EngineConfig,
    message_id: MessageId,
    emitter: &Emitter,
    cancel: &CancellationToken,
) -> StreamOutcome {
    let max_attempts = config.retry.max_attempts.max(1);
    let mut backoff = config.retry.backoff();
    let mut attempt = 1;
    loop {
        let mut assembler = ReplyAssembler::new(message_id);
        let result = stream_once(
            client,
            request,
            config.provider_timeout(),
            &mut assembler,
            emitter,
            cancel,
        )
        .await;
        let err = match result {
            Ok(AttemptEnd::Finished) => {
                let reply = assembler.finish(Some(emitter));
                return StreamOutcome::Completed(reply);
            }
            Ok(AttemptEnd::Cancelled) => {
                return StreamOutcome::Cancelled(assembler.finish(None));
            }
            Err(err) => err,
        };

        if assembler.has_output() {
            // Published deltas can't be taken back, so this attempt can't
            // be replayed.
            warn!("provider failed mid-stream: {err}");
            let failure = if err.kind.is_transient() {
                TurnFailure::ProviderTransientError {
                    kind: err.kind,
                    message: err.message,
                    attempts: attempt,
                }
            } else {
                err.into_fatal()
            };
            return StreamOutcome::Failed(failure, assembler.finish(None));
        }
        if !err.kind.is_transient() {
            warn!("provider failed: {err}");
            return StreamOutcome::Failed(err.into_fatal(), Reply::default());
        }
        if attempt >= max_attempts {
            warn!("provider failed after {attempt} attempt(s): {err}");
            let failure = TurnFailure::ProviderTransientError {
                kind: err.kind,
                message: err.message,
                attempts: attempt,
            };
            return StreamOutcome::Failed(failure, Reply::default());
        }

        let mut delay = backoff
            .next_backoff()
            .unwrap_or_else(|| config.retry.max_interval());
        if let Some(retry_after) = err.retry_after {
            delay = delay.max(retry_after);
        }
        attempt += 1;
        debug!("retrying in {delay:?}, attempt {attempt}: {err}");
        emitter.emit(EventKind::RequestRetrying {
            attempt,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error: err.message,
        });
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return StreamOutcome::Cancelled(Reply::default());
            }
            _ = sleep(delay) => {}
        }
    }
}

enum AttemptEnd {
    Finished,
    Cancelled,
}

/// A failed attempt.
#[derive(Debug)]
struct AttemptError {
    kind: ErrorKind,
    message: String,
    retry_after: Option<Duration>,
}

impl AttemptError {
    fn from_provider(err: &dyn ModelProviderError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            retry_after: err.retry_after(),
        }
    }

    fn timeout(after: Duration) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: format!("no response from the provider in {after:?}"),
            retry_after: None,
        }
    }

    fn into_fatal(self) -> TurnFailure {
        TurnFailure::ProviderFatalError {
            kind: self.kind,
            message: self.message,
        }
    }
}

impl Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

async fn stream_once(
    client: &ModelClient,
    request: &ModelRequest,
    limit: Duration,
    assembler: &mut ReplyAssembler,
    emitter: &Emitter,
    cancel: &CancellationToken,
) -> Result<AttemptEnd, AttemptError> {
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(AttemptEnd::Cancelled),
        opened = timeout(limit, client.open(request)) => opened,
    };
    let mut stream = match opened {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(AttemptError::from_provider(err.as_ref())),
        Err(_) => return Err(AttemptError::timeout(limit)),
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(AttemptEnd::Cancelled),
            next = timeout(limit, stream.next_event()) => next,
        };
        match next {
            Ok(Ok(Some(event))) => assembler.push(event, emitter),
            Ok(Ok(None)) => return Ok(AttemptEnd::Finished),
            Ok(Err(err)) => {
                return Err(AttemptError::from_provider(err.as_ref()));
            }
            Err(_) => return Err(AttemptError::timeout(limit)),
        }
    }
}

/// A tool call assembled from fragments.
#[derive(Default)]
struct Fragments {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

enum Slot {
    Complete(ToolCall),
    Partial(Fragments),
}

/// Folds stream events into a [`Reply`], publishing them on the way.
pub(super) struct ReplyAssembler {
    message_id: MessageId,
    text: String,
    slots: Vec<Slot>,
    by_index: HashMap<usize, usize>,
    ids: HashSet<String>,
    usage: Option<TokenUsage>,
    finish_reason: Option<ModelFinishReason>,
    published: bool,
}

impl ReplyAssembler {
    pub fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            text: String::new(),
            slots: vec![],
            by_index: HashMap::new(),
            ids: HashSet::new(),
            usage: None,
            finish_reason: None,
            published: false,
        }
    }

    /// Returns `true` once something was published for this attempt.
    #[inline]
    pub fn has_output(&self) -> bool {
        self.published
    }

    pub fn push(&mut self, event: ModelResponseEvent, emitter: &Emitter) {
        trace!("got an event: {event:?}");
        match event {
            ModelResponseEvent::MessageDelta(text) => {
                if text.is_empty() {
                    return;
                }
                self.text.push_str(&text);
                self.published = true;
                emitter.emit(EventKind::AssistantDelta {
                    message_id: self.message_id,
                    text,
                });
            }
            ModelResponseEvent::ToolCall(req) => {
                let id = self.unique_id(Some(req.id), self.slots.len());
                let call = ToolCall::new(id, req.name, req.arguments);
                self.published = true;
                emitter.emit(EventKind::ToolCallRequested {
                    message_id: self.message_id,
                    call: call.clone(),
                });
                self.slots.push(Slot::Complete(call));
            }
            ModelResponseEvent::ToolCallDelta(delta) => {
                self.push_delta(delta, emitter);
            }
            ModelResponseEvent::Usage(usage) => self.usage = Some(usage),
            ModelResponseEvent::Completed(reason) => {
                self.finish_reason = Some(reason);
            }
        }
    }

    fn push_delta(&mut self, delta: ToolCallDelta, emitter: &Emitter) {
        let ToolCallDelta {
            index,
            id,
            name,
            arguments,
        } = delta;
        let slot = *self.by_index.entry(index).or_insert_with(|| {
            self.slots.push(Slot::Partial(Fragments::default()));
            self.slots.len() - 1
        });
        let Slot::Partial(fragments) = &mut self.slots[slot] else {
            return;
        };
        if fragments.id.is_none() {
            fragments.id = id;
        }
        if fragments.name.is_none() {
            fragments.name = name;
        }
        fragments.arguments.push_str(&arguments);
        self.published = true;
        emitter.emit(EventKind::ToolCallDelta {
            message_id: self.message_id,
            index,
            arguments,
        });
    }

    /// Keeps `id` unless it is missing or already taken in this reply, in
    /// which case one is made up from the position of the call.
    fn unique_id(&mut self, id: Option<String>, position: usize) -> String {
        let id = match id {
            Some(id) if !id.is_empty() && !self.ids.contains(&id) => id,
            id => {
                if let Some(id) = id.filter(|id| !id.is_empty()) {
                    warn!("tool call id `{id}` is used more than once");
                }
                let mut generated =
                    format!("call_{}_{position}", self.message_id);
                while self.ids.contains(&generated) {
                    generated.push('_');
                }
                generated
            }
        };
        self.ids.insert(id.clone());
        id
    }

    /// Completes the fragmented calls and returns the reply.
    ///
    /// With an emitter, every completed call is announced.
    pub fn finish(mut self, emitter: Option<&Emitter>) -> Reply {
        let message_id = self.message_id;
        let slots = std::mem::take(&mut self.slots);
        let tool_calls = slots
            .into_iter()
            .enumerate()
            .map(|(position, slot)| match slot {
                Slot::Complete(call) => call,
                Slot::Partial(mut fragments) => {
                    let id = self.unique_id(fragments.id.take(), position);
                    let call = complete(id, fragments);
                    if let Some(emitter) = emitter {
                        emitter.emit(EventKind::ToolCallRequested {
                            message_id,
                            call: call.clone(),
                        });
                    }
                    call
                }
            })
            .collect();
        if self.finish_reason == Some(ModelFinishReason::Length) {
            warn!("the model ran out of output tokens");
        }
        Reply {
            text: self.text,
            tool_calls,
            usage: self.usage,
            finish_reason: self.finish_reason,
        }
    }
}

fn complete(id: String, fragments: Fragments) -> ToolCall {
    let Fragments { name, arguments, .. } = fragments;
    let name = name.unwrap_or_default();
    let parsed = if arguments.trim().is_empty() {
        Ok(Value::Object(Default::default()))
    } else {
        serde_json::from_str(&arguments)
    };
    match parsed {
        Ok(arguments) => ToolCall::new(id, name, arguments),
        Err(err) => {
            // Left for the engine to report, like any invalid input.
            let mut call = ToolCall::new(id, name, Value::String(arguments));
            let error = ToolError::invalid_input()
                .with_reason(format!("malformed arguments: {err}"));
            if let Err(err) = call.advance(ToolCallStatus::Failed { error }) {
                error!("{err}");
            }
            call
        }
    }
}
