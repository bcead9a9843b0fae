//! Event fan-out to frontends, loggers and test harnesses.
//!
//! Every subscriber owns a bounded queue. Publishing never waits for
//! subscribers: one that falls behind loses its oldest unread events and
//! learns about it through [`Received::Lagged`]. Delivery is best-effort,
//! but events reach each subscriber in publication order, and `seq` is
//! strictly increasing across the whole bus.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::Stream;
use futures::stream::unfold;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::conversation::{MessageId, ToolCall};
use crate::error::TurnFailure;
use crate::permission::PermissionRequest;
use crate::session::SessionId;

/// A state change of a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position of the event on its bus.
    pub seq: u64,
    /// The session the event belongs to.
    pub session_id: SessionId,
    /// The turn the event belongs to, starting from 1.
    pub turn: u32,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    #[serde(flatten)]
    pub kind: EventKind,
}

/// What happened.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A turn started with the given user input.
    TurnStarted {
        /// Text typed by the user.
        input: String,
    },
    /// The model streamed a piece of text.
    AssistantDelta {
        /// The assistant message being streamed.
        message_id: MessageId,
        /// The new text.
        text: String,
    },
    /// The model streamed a piece of a tool call.
    ToolCallDelta {
        /// The assistant message being streamed.
        message_id: MessageId,
        /// Position of the call within the message.
        index: usize,
        /// A fragment of the JSON arguments.
        arguments: String,
    },
    /// The model finished declaring a tool call.
    ToolCallRequested {
        /// The assistant message owning the call.
        message_id: MessageId,
        /// The call, still pending.
        call: ToolCall,
    },
    /// A call waits for the user's decision.
    PermissionRequested {
        /// The request to resolve.
        request: PermissionRequest,
    },
    /// A call started running.
    ToolCallStarted {
        /// The call.
        call_id: String,
        /// Name of the tool.
        tool_name: String,
    },
    /// A call reached a terminal state.
    ToolCallFinished {
        /// The call, in its terminal state.
        call: ToolCall,
    },
    /// A provider request failed and is about to be sent again.
    RequestRetrying {
        /// The attempt about to be made, starting from 2.
        attempt: u32,
        /// The wait before it.
        delay_ms: u64,
        /// The error of the failed attempt.
        error: String,
    },
    /// Older messages were summarized to fit the context budget.
    ContextCompacted {
        /// Messages folded into the summary.
        summarized: usize,
        /// Messages sent as they are.
        kept: usize,
    },
    /// A message couldn't be persisted, the turn goes on.
    PersistenceWarning {
        /// The storage error.
        message: String,
    },
    /// The turn ended with a final answer.
    TurnFinished {
        /// The final assistant message.
        message_id: MessageId,
        /// Tool rounds executed during the turn.
        rounds: u32,
    },
    /// The turn ended with an error.
    TurnFailed {
        /// What went wrong.
        failure: TurnFailure,
    },
    /// The turn was cancelled by the caller.
    TurnCancelled,
}

impl EventKind {
    /// Returns `true` for the events ending a turn. Nothing is published
    /// for a turn after one of them.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::TurnFinished { .. }
                | EventKind::TurnFailed { .. }
                | EventKind::TurnCancelled
        )
    }
}

/// What a subscriber receives.
#[derive(Clone, Debug, PartialEq)]
pub enum Received {
    /// The next event.
    Event(Event),
    /// The subscriber fell behind and lost this many events.
    Lagged(u64),
}

struct BusInner {
    sender: broadcast::Sender<Event>,
    next_seq: Mutex<u64>,
}

/// A multi-subscriber event bus.
///
/// Clones publish to the same subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Creates a bus whose subscribers each buffer at least `capacity`
    /// events.
    ///
    /// The queue length is `capacity` rounded up to the next power of two.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                sender,
                next_seq: Mutex::new(0),
            }),
        }
    }

    /// Publishes an event and returns its sequence number.
    pub fn publish(
        &self,
        session_id: &SessionId,
        turn: u32,
        kind: EventKind,
    ) -> u64 {
        // Holding the lock while sending keeps queue order equal to `seq`
        // order.
        let mut next_seq = self
            .inner
            .next_seq
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let seq = *next_seq;
        *next_seq += 1;
        trace!("publishing event #{seq}: {kind:?}");
        let event = Event {
            seq,
            session_id: session_id.clone(),
            turn,
            timestamp: Utc::now(),
            kind,
        };
        // No subscriber is fine.
        let _ = self.inner.sender.send(event);
        seq
    }

    /// Subscribes to events published from now on.
    #[inline]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.inner.sender.subscribe(),
        }
    }

    /// Returns the number of live subscribers.
    #[inline]
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }

    /// Returns a publisher bound to one turn of a session.
    #[inline]
    pub fn emitter(&self, session_id: SessionId, turn: u32) -> Emitter {
        Emitter {
            bus: self.clone(),
            session_id,
            turn,
        }
    }
}

/// A subscriber's end of an [`EventBus`].
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Waits for the next event.
    ///
    /// Returns `None` once the bus is dropped and every buffered event was
    /// received.
    pub async fn recv(&mut self) -> Option<Received> {
        match self.receiver.recv().await {
            Ok(event) => Some(Received::Event(event)),
            Err(RecvError::Lagged(missed)) => Some(Received::Lagged(missed)),
            Err(RecvError::Closed) => None,
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Received> {
        match self.receiver.try_recv() {
            Ok(event) => Some(Received::Event(event)),
            Err(TryRecvError::Lagged(missed)) => {
                Some(Received::Lagged(missed))
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }

    /// Converts the subscription into a stream.
    pub fn into_stream(self) -> impl Stream<Item = Received> + Send {
        unfold(self, |mut subscription| async move {
            let received = subscription.recv().await?;
            Some((received, subscription))
        })
    }
}

/// Publishes the events of one turn.
#[derive(Clone)]
pub struct Emitter {
    bus: EventBus,
    session_id: SessionId,
    turn: u32,
}

impl Emitter {
    /// Publishes an event for the turn.
    #[inline]
    pub fn emit(&self, kind: EventKind) -> u64 {
        self.bus.publish(&self.session_id, self.turn, kind)
    }

    /// Returns the turn events are published for.
    #[inline]
    pub fn turn(&self) -> u32 {
        self.turn
    }
}
