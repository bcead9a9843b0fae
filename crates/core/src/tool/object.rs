use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{
    Action, ApprovalRequirement, Concurrency, Error, Tool, ToolResult,
};

type RunFn =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ToolResult> + Send>;

/// A call whose arguments passed validation, ready to be run once.
pub(crate) struct PreparedCall {
    pub action: Action,
    run: RunFn,
}

impl PreparedCall {
    #[inline]
    pub fn run(
        self,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ToolResult> {
        (self.run)(cancel)
    }
}

pub(crate) trait ToolObject: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameter_schema(&self) -> &Value;

    fn concurrency(&self) -> Concurrency;

    fn approval(&self) -> ApprovalRequirement;

    fn prepare(self: Arc<Self>, arguments: Value)
    -> Result<PreparedCall, Error>;
}

pub(crate) struct ToolObjectImpl<T: Tool>(pub T);

impl<T: Tool> ToolObject for ToolObjectImpl<T> {
    #[inline]
    fn name(&self) -> &str {
        self.0.name()
    }

    #[inline]
    fn description(&self) -> &str {
        self.0.description()
    }

    #[inline]
    fn parameter_schema(&self) -> &Value {
        self.0.parameter_schema()
    }

    #[inline]
    fn concurrency(&self) -> Concurrency {
        self.0.concurrency()
    }

    #[inline]
    fn approval(&self) -> ApprovalRequirement {
        self.0.approval()
    }

    fn prepare(
        self: Arc<Self>,
        arguments: Value,
    ) -> Result<PreparedCall, Error> {
        let input: T::Input =
            serde_json::from_value(arguments).map_err(|err| {
                Error::invalid_input().with_reason(err.to_string())
            })?;
        let action = self.0.describe(&input);
        let run: RunFn = Box::new(move |cancel| {
            let span = debug_span!("tool execute", tool = self.0.name());
            Box::pin(self.0.execute(input, cancel).instrument(span))
        });
        Ok(PreparedCall { action, run })
    }
}
