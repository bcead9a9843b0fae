//! Tool call supports.
//!
//! Tools are registered once in a [`ToolRegistry`] and dispatched by name.
//! Each batch of calls requested in a round is run by the [`ToolEngine`].

mod engine;
mod error;
mod lane;
mod object;
mod registry;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub use engine::ToolEngine;
pub use error::{Error, ErrorKind};
pub(crate) use object::{ToolObject, ToolObjectImpl};
pub use registry::{ToolDescriptor, ToolRegistry};

/// The result of a tool call.
pub type ToolResult = Result<String, Error>;

/// Whether a tool's side effects need serializing.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Concurrency {
    /// Never runs alongside another exclusive call of the same batch.
    /// Calls run one at a time, in the order the model requested them.
    Exclusive,
    /// May run concurrently with anything.
    #[default]
    Shared,
}

/// Whether a tool needs the user's consent before it runs.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalRequirement {
    /// Runs without asking.
    #[default]
    None,
    /// Runs only after being approved.
    Required,
}

/// A human-readable description of what a call is going to do.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Action {
    /// What is going to happen, e.g. "Write 12 lines to src/main.rs".
    pub description: String,
    /// The object acted upon, e.g. a path or a command line. Approvals
    /// remembered for a session are keyed by tool name and target.
    pub target: String,
}

impl Action {
    /// Creates a new action.
    #[inline]
    pub fn new<S1: Into<String>, S2: Into<String>>(
        description: S1,
        target: S2,
    ) -> Self {
        Self {
            description: description.into(),
            target: target.into(),
        }
    }
}

/// A tool that can be called by the model.
///
/// Implementations of this trait should be stateless, and may not maintain any
/// internal state.
///
/// The tool can be context-aware, meaning it can access additional information
/// about the current execution context, such as the working directory or the
/// current user. To do this, make the context an immutable state of the tool,
/// which can be set during initialization, and copy it when executing.
pub trait Tool: Send + Sync + 'static {
    /// The type of input that the tool accepts.
    ///
    /// Arguments that don't deserialize into it fail validation, and the
    /// tool is never invoked with them.
    type Input: DeserializeOwned + Send + 'static;

    /// Returns the name of the tool.
    fn name(&self) -> &str;

    /// Returns the description of the tool.
    fn description(&self) -> &str;

    /// Returns the parameter schema of the tool.
    fn parameter_schema(&self) -> &Value;

    /// Returns the concurrency class of the tool.
    fn concurrency(&self) -> Concurrency {
        Concurrency::Shared
    }

    /// Returns whether the tool needs approval before running.
    fn approval(&self) -> ApprovalRequirement {
        ApprovalRequirement::None
    }

    /// Describes what a call with `input` is going to do.
    fn describe(&self, input: &Self::Input) -> Action {
        let _ = input;
        Action::new(format!("Run `{}`", self.name()), "")
    }

    /// Executes the tool with the given input.
    ///
    /// This method must return a future that is fully independent of `self`.
    /// The tool should stop promptly once `cancel` is triggered, the engine
    /// may stop polling the future after that.
    fn execute(
        &self,
        input: Self::Input,
        cancel: CancellationToken,
    ) -> impl Future<Output = ToolResult> + Send + 'static;
}
