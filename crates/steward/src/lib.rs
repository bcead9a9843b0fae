//! An out-of-the-box assistant that assembles the engine with a set of
//! built-in tools.
//!
//! The crate includes a CLI tool that replays a scripted model in the
//! terminal. You can also use it as a library to bring the engine into your
//! own host apps.

#![deny(missing_docs)]

#[allow(unused_imports)]
#[macro_use]
extern crate tracing;

mod session;
pub mod tools;

pub use session::{Assistant, AssistantBuilder};

/// Re-exports of [`steward_core`] crate.
pub mod core {
    pub use steward_core::*;
}
