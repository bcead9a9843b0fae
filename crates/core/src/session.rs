use std::fmt::{self, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::{Message, MessageId, Role};
use crate::permission::{PermissionGate, PermissionPolicy};

/// Identifier of a session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a random identifier.
    #[inline]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    #[inline]
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    #[inline]
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Compaction metadata of a session, refreshed before every request.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct SessionSummary {
    /// Estimated cost of the last view sent to the provider.
    pub token_estimate: usize,
    /// The newest message folded into a summary by the last compaction.
    pub compaction_watermark: Option<MessageId>,
}

/// The persisted form of a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Identifier of the session.
    pub id: SessionId,
    /// Messages in conversation order.
    pub messages: Vec<Message>,
    /// Compaction metadata.
    #[serde(default)]
    pub summary: SessionSummary,
}

/// A conversation with its history and approval memory.
///
/// A turn borrows the session mutably for its whole duration, so there is
/// at most one active turn per session. The permission gate is shared, so
/// that a frontend can keep resolving requests while a turn runs.
pub struct Session {
    id: SessionId,
    messages: Vec<Message>,
    summary: SessionSummary,
    turns: u32,
    permissions: Arc<PermissionGate>,
}

impl Session {
    /// Creates an empty session.
    pub fn new(id: SessionId, policy: PermissionPolicy) -> Self {
        Self {
            id,
            messages: vec![],
            summary: SessionSummary::default(),
            turns: 0,
            permissions: Arc::new(PermissionGate::new(policy)),
        }
    }

    /// Restores a persisted session.
    ///
    /// Remembered approvals are not persisted, the restored session starts
    /// with none.
    pub fn restore(record: SessionRecord, policy: PermissionPolicy) -> Self {
        let turns = record
            .messages
            .iter()
            .filter(|msg| msg.role == Role::User)
            .count();
        Self {
            id: record.id,
            messages: record.messages,
            summary: record.summary,
            turns: u32::try_from(turns).unwrap_or(u32::MAX),
            permissions: Arc::new(PermissionGate::new(policy)),
        }
    }

    /// Returns the identifier.
    #[inline]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the messages in conversation order.
    #[inline]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Returns the compaction metadata.
    #[inline]
    pub fn summary(&self) -> SessionSummary {
        self.summary
    }

    /// Returns the number of turns run so far.
    #[inline]
    pub fn turns(&self) -> u32 {
        self.turns
    }

    /// Returns the permission gate.
    #[inline]
    pub fn permissions(&self) -> &Arc<PermissionGate> {
        &self.permissions
    }

    /// Returns the persisted form of the session.
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            messages: self.messages.clone(),
            summary: self.summary,
        }
    }

    #[inline]
    pub(crate) fn begin_turn(&mut self) -> u32 {
        self.turns += 1;
        self.turns
    }

    #[inline]
    pub(crate) fn next_message_id(&self) -> MessageId {
        self.messages.last().map_or(0, |msg| msg.id + 1)
    }

    #[inline]
    pub(crate) fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    #[inline]
    pub(crate) fn set_summary(&mut self, summary: SessionSummary) {
        self.summary = summary;
    }
}
