mod builder;
mod stream;

use std::sync::Arc;

use steward_model::{ModelMessage, ModelProvider, ModelRequest};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::compact::{CompactionError, Compactor};
use crate::config::EngineConfig;
use crate::conversation::{Message, MessageId, ToolCall, ToolCallStatus};
use crate::error::TurnFailure;
use crate::event::{Emitter, EventBus, EventKind, Subscription};
use crate::model_client::ModelClient;
use crate::session::{Session, SessionId, SessionSummary};
use crate::store::{SessionStore, StoreError};
use crate::tool::{ToolEngine, ToolRegistry};
pub use builder::CoordinatorBuilder;
use stream::{Reply, StreamOutcome};

/// How a turn ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model answered without asking for more tools.
    Completed {
        /// The final assistant message.
        message_id: MessageId,
        /// Tool rounds executed during the turn.
        rounds: u32,
    },
    /// The caller cancelled the turn.
    Cancelled,
    /// The turn failed.
    Failed(TurnFailure),
}

impl TurnOutcome {
    fn into_event(self) -> EventKind {
        match self {
            TurnOutcome::Completed { message_id, rounds } => {
                EventKind::TurnFinished { message_id, rounds }
            }
            TurnOutcome::Cancelled => EventKind::TurnCancelled,
            TurnOutcome::Failed(failure) => EventKind::TurnFailed { failure },
        }
    }
}

/// Drives conversation turns.
///
/// A turn sends the history to the model, runs the tools it asks for and
/// feeds their results back, until the model answers with text only. A
/// coordinator can serve any number of sessions. Turns of one session are
/// serialized by `run_turn` borrowing it mutably.
pub struct Coordinator {
    model_client: ModelClient,
    registry: Arc<ToolRegistry>,
    engine: ToolEngine,
    compactor: Compactor,
    bus: EventBus,
    store: Option<Arc<dyn SessionStore>>,
    config: EngineConfig,
}

impl Coordinator {
    /// Creates a builder with the specified model provider.
    #[inline]
    pub fn builder<P: ModelProvider + 'static>(
        provider: P,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder::with_model_provider(provider)
    }

    /// Subscribes to the events of every session.
    #[inline]
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// Returns the bus events are published on.
    #[inline]
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Returns the configuration.
    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the registered tools.
    #[inline]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Creates an empty session.
    pub fn new_session(&self) -> Session {
        let id = SessionId::generate();
        debug!("new session {id}");
        Session::new(id, self.config.permission_policy())
    }

    /// Loads a session from the configured store.
    pub async fn load_session(
        &self,
        id: &SessionId,
    ) -> Result<Session, StoreError> {
        let Some(store) = &self.store else {
            return Err(StoreError::NotFound(id.clone()));
        };
        let record = store.load_session(id).await?;
        debug!("loaded session {id} with {} messages", record.messages.len());
        Ok(Session::restore(record, self.config.permission_policy()))
    }

    /// Runs a turn for `input` until the model gives its final answer.
    ///
    /// Every way out of a turn is also published as its last event:
    /// `TurnFinished`, `TurnFailed` or `TurnCancelled`. Whatever the model
    /// and the tools produced before the end stays in the session.
    pub async fn run_turn(
        &self,
        session: &mut Session,
        input: impl Into<String>,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let turn = session.begin_turn();
        let emitter = self.bus.emitter(session.id().clone(), turn);
        let span = debug_span!("turn", session = %session.id(), turn);
        let outcome = self
            .drive_turn(session, input.into(), &emitter, &cancel)
            .instrument(span)
            .await;
        debug!("turn {turn} ended: {outcome:?}");
        emitter.emit(outcome.clone().into_event());
        outcome
    }

    async fn drive_turn(
        &self,
        session: &mut Session,
        input: String,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        emitter.emit(EventKind::TurnStarted {
            input: input.clone(),
        });
        let user = Message::user(session.next_message_id(), input);
        if let Err(failure) = self.commit(session, user, emitter).await {
            return TurnOutcome::Failed(failure);
        }

        let mut rounds = 0;
        loop {
            if cancel.is_cancelled() {
                return TurnOutcome::Cancelled;
            }
            let request = match self.prepare_request(session, emitter).await {
                Ok(request) => request,
                Err(failure) => return TurnOutcome::Failed(failure),
            };

            let message_id = session.next_message_id();
            let outcome = stream::request_with_retry(
                &self.model_client,
                &request,
                &self.config,
                message_id,
                emitter,
                cancel,
            )
            .await;
            let reply = match outcome {
                StreamOutcome::Completed(reply) => reply,
                StreamOutcome::Cancelled(reply) => {
                    let kept = self
                        .keep_unfinished(session, message_id, reply, emitter)
                        .await;
                    return match kept {
                        Ok(()) => TurnOutcome::Cancelled,
                        Err(failure) => TurnOutcome::Failed(failure),
                    };
                }
                StreamOutcome::Failed(failure, reply) => {
                    // The provider failure is what the caller needs to see.
                    let _ = self
                        .keep_unfinished(session, message_id, reply, emitter)
                        .await;
                    return TurnOutcome::Failed(failure);
                }
            };

            if reply.tool_calls.is_empty() {
                let Reply { text, usage, .. } = reply;
                let message =
                    Message::assistant(message_id, text, vec![], usage);
                let committed = self.commit(session, message, emitter).await;
                if let Err(failure) = committed {
                    return TurnOutcome::Failed(failure);
                }
                return TurnOutcome::Completed { message_id, rounds };
            }

            let limit = self.config.max_rounds;
            if rounds >= limit {
                warn!("the model asked for tools after {rounds} rounds");
                let _ = self
                    .keep_unfinished(session, message_id, reply, emitter)
                    .await;
                return TurnOutcome::Failed(TurnFailure::RoundLimitExceeded {
                    limit,
                });
            }

            rounds += 1;
            trace!("round {rounds}: {} tool calls", reply.tool_calls.len());
            let gate = Arc::clone(session.permissions());
            let calls = self
                .engine
                .execute_batch(reply.tool_calls, &gate, emitter, cancel)
                .await;
            let assistant =
                Message::assistant(message_id, reply.text, calls, reply.usage);
            if let Err(failure) =
                self.commit_round(session, assistant, emitter).await
            {
                return TurnOutcome::Failed(failure);
            }
        }
    }

    /// Builds the request of the next round from the session.
    async fn prepare_request(
        &self,
        session: &mut Session,
        emitter: &Emitter,
    ) -> Result<ModelRequest, TurnFailure> {
        let view = self
            .compactor
            .build_view(session.messages(), self.config.context_budget)
            .await
            .map_err(|err| match err {
                CompactionError::BudgetExceeded { needed, budget } => {
                    warn!("{err}");
                    TurnFailure::ContextBudgetExceeded { needed, budget }
                }
            })?;

        let summary = SessionSummary {
            token_estimate: view.cost,
            compaction_watermark: view.watermark,
        };
        if summary != session.summary() {
            session.set_summary(summary);
            if let Some(store) = &self.store
                && let Err(err) =
                    store.update_summary(session.id(), summary).await
            {
                self.persistence_failed(err, emitter)?;
            }
        }
        if view.is_compacted() {
            let kept = session.messages().len() - view.summarized;
            debug!("compacted {} messages, kept {kept}", view.summarized);
            emitter.emit(EventKind::ContextCompacted {
                summarized: view.summarized,
                kept,
            });
        }

        let mut messages = vec![];
        if let Some(prompt) = &self.config.system_prompt {
            messages.push(ModelMessage::system(prompt.clone()));
        }
        messages.extend(view.to_model_messages());
        Ok(ModelRequest {
            messages,
            tools: self.registry.definitions(),
        })
    }

    /// Keeps what an interrupted round produced. Calls that never ran are
    /// cancelled, so the history stays answerable.
    async fn keep_unfinished(
        &self,
        session: &mut Session,
        message_id: MessageId,
        reply: Reply,
        emitter: &Emitter,
    ) -> Result<(), TurnFailure> {
        if reply.is_empty() {
            return Ok(());
        }
        let Reply {
            text,
            mut tool_calls,
            usage,
            ..
        } = reply;
        for call in &mut tool_calls {
            if !call.status().is_terminal() {
                let cancelled = ToolCallStatus::Cancelled {
                    reason: "turn ended before the call ran".to_owned(),
                };
                if let Err(err) = call.advance(cancelled) {
                    error!("{err}");
                }
            }
            emitter.emit(EventKind::ToolCallFinished { call: call.clone() });
        }
        let assistant = Message::assistant(message_id, text, tool_calls, usage);
        self.commit_round(session, assistant, emitter).await
    }

    /// Commits an assistant message, followed by the results of its calls
    /// if it made any.
    async fn commit_round(
        &self,
        session: &mut Session,
        assistant: Message,
        emitter: &Emitter,
    ) -> Result<(), TurnFailure> {
        let results: Vec<_> = assistant
            .tool_calls
            .iter()
            .filter_map(ToolCall::result_entry)
            .collect();
        self.commit(session, assistant, emitter).await?;
        if !results.is_empty() {
            let id = session.next_message_id();
            let message = Message::tool_results(id, results);
            self.commit(session, message, emitter).await?;
        }
        Ok(())
    }

    /// Adds a message to the session and hands it to the store.
    async fn commit(
        &self,
        session: &mut Session,
        message: Message,
        emitter: &Emitter,
    ) -> Result<(), TurnFailure> {
        trace!("committing message #{} ({:?})", message.id, message.role);
        let result = match &self.store {
            Some(store) => store.append_message(session.id(), &message).await,
            None => Ok(()),
        };
        session.push(message);
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.persistence_failed(err, emitter),
        }
    }

    fn persistence_failed(
        &self,
        err: StoreError,
        emitter: &Emitter,
    ) -> Result<(), TurnFailure> {
        let message = err.to_string();
        if self.config.fail_on_persistence_error {
            warn!("persistence failed, failing the turn: {message}");
            return Err(TurnFailure::PersistenceError { message });
        }
        warn!("persistence failed: {message}");
        emitter.emit(EventKind::PersistenceWarning { message });
        Ok(())
    }
}
