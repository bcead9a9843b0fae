//! Tools shared by the tests of this crate.

use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::tool::{
    Action, ApprovalRequirement, Concurrency, Error, Tool, ToolResult,
};

static EMPTY_SCHEMA: &Value = &Value::Null;

static TEXT_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "type": "object",
        "properties": { "text": { "type": "string" } },
        "required": ["text"]
    })
});

static WRITE_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "type": "object",
        "properties": {
            "path": { "type": "string" },
            "ms": { "type": "integer" }
        },
        "required": ["path"]
    })
});

#[derive(Deserialize)]
pub struct TextInput {
    pub text: String,
}

/// Echoes its input right away. Shared, no approval.
pub struct EchoTool;

impl Tool for EchoTool {
    type Input = TextInput;

    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes the text"
    }

    fn parameter_schema(&self) -> &Value {
        &TEXT_SCHEMA
    }

    fn execute(
        &self,
        input: Self::Input,
        _cancel: CancellationToken,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        std::future::ready(Ok(input.text))
    }
}

#[derive(Deserialize)]
pub struct SleepInput {
    pub ms: u64,
}

/// Sleeps, then reports whether it noticed a cancellation. Shared, no
/// approval.
pub struct SleepTool;

impl Tool for SleepTool {
    type Input = SleepInput;

    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleeps for a while"
    }

    fn parameter_schema(&self) -> &Value {
        EMPTY_SCHEMA
    }

    fn execute(
        &self,
        input: Self::Input,
        cancel: CancellationToken,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    Err(Error::execution_error().with_reason("interrupted"))
                }
                _ = sleep(Duration::from_millis(input.ms)) => {
                    Ok(format!("slept {}ms", input.ms))
                }
            }
        }
    }
}

#[derive(Deserialize)]
pub struct WriteInput {
    pub path: String,
    #[serde(default)]
    pub ms: u64,
}

/// A finished run of [`WriteTool`].
#[derive(Clone, Debug)]
pub struct WriteRun {
    pub path: String,
    pub started: Instant,
    pub finished: Instant,
}

/// Pretends to write a file, taking `ms` milliseconds and ignoring
/// cancellation. Exclusive, needs approval.
#[derive(Clone, Default)]
pub struct WriteTool {
    pub runs: Arc<Mutex<Vec<WriteRun>>>,
}

impl WriteTool {
    pub fn runs(&self) -> Vec<WriteRun> {
        self.runs.lock().unwrap().clone()
    }
}

impl Tool for WriteTool {
    type Input = WriteInput;

    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Writes a file"
    }

    fn parameter_schema(&self) -> &Value {
        &WRITE_SCHEMA
    }

    fn concurrency(&self) -> Concurrency {
        Concurrency::Exclusive
    }

    fn approval(&self) -> ApprovalRequirement {
        ApprovalRequirement::Required
    }

    fn describe(&self, input: &Self::Input) -> Action {
        Action::new(format!("Write {}", input.path), input.path.clone())
    }

    fn execute(
        &self,
        input: Self::Input,
        _cancel: CancellationToken,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let runs = Arc::clone(&self.runs);
        async move {
            let started = Instant::now();
            sleep(Duration::from_millis(input.ms)).await;
            runs.lock().unwrap().push(WriteRun {
                path: input.path.clone(),
                started,
                finished: Instant::now(),
            });
            Ok(format!("wrote {}", input.path))
        }
    }
}

/// Always fails. Shared, no approval.
pub struct FailTool;

impl Tool for FailTool {
    type Input = Value;

    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Fails"
    }

    fn parameter_schema(&self) -> &Value {
        EMPTY_SCHEMA
    }

    fn execute(
        &self,
        _input: Self::Input,
        _cancel: CancellationToken,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        std::future::ready(Err(Error::execution_error().with_reason("boom")))
    }
}
