//! Core logic of the engine: the turn loop, tool execution, permission
//! gating, context compaction and event fan-out.
//!
//! A [`Coordinator`] drives one conversation turn at a time for a
//! [`Session`]. It talks to a model provider, hands the tool calls the model
//! asks for to the [`tool::ToolEngine`], gates risky calls through the
//! session's [`permission::PermissionGate`] and reports everything it does on
//! an [`event::EventBus`].

#![deny(missing_docs)]
#![deny(clippy::missing_safety_doc)]

#[macro_use]
extern crate tracing;

pub mod compact;
pub mod config;
pub mod conversation;
mod coordinator;
mod error;
pub mod event;
mod model_client;
pub mod permission;
mod session;
pub mod store;
#[cfg(test)]
mod testing;
pub mod tool;

pub use config::{EngineConfig, RetryConfig};
pub use coordinator::{Coordinator, CoordinatorBuilder, TurnOutcome};
pub use error::TurnFailure;
pub use session::{Session, SessionId, SessionRecord, SessionSummary};
pub use tokio_util::sync::CancellationToken;
