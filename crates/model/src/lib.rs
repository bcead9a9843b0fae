//! An abstraction layer for different LLM providers.
//!
//! This crate establishes a unified protocol for the engine to talk to
//! any model provider, so that the engine can switch between them without
//! touching the core codebase. A provider opens a streamed response for a
//! request, and the response yields text deltas, tool call declarations,
//! usage reports and a completion marker.
//!
//! Types in this crate don't define any behavior, instead they are the
//! constraints that the implementors should adhere to.

#![deny(missing_docs)]

mod error;
mod provider;
mod request;
mod response;

pub use error::*;
pub use provider::*;
pub use request::*;
pub use response::*;
