use std::env;
use std::io;
use std::process::Stdio;

use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::Value;
use steward_core::CancellationToken;
use steward_core::tool::{
    Action, ApprovalRequirement, Concurrency, Error as ToolError, Tool,
    ToolResult,
};
use tokio::process::Command;

#[derive(Deserialize, JsonSchema)]
pub struct ShellToolParameters {
    #[schemars(description = "The command line to run.")]
    cmdline: String,
}

/// A tool for running shell commands.
pub struct ShellTool {
    parameter_schema: Value,
}

impl ShellTool {
    /// Creates a new shell tool.
    #[inline]
    pub fn new() -> Self {
        ShellTool {
            parameter_schema: schema_for!(ShellToolParameters).to_value(),
        }
    }
}

impl Default for ShellTool {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for ShellTool {
    type Input = ShellToolParameters;

    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        r#"
Runs a command line with the user's shell and returns what it printed.
Keep the command on a single line when possible. The exit status is reported
when the command fails."#
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn concurrency(&self) -> Concurrency {
        Concurrency::Exclusive
    }

    fn approval(&self) -> ApprovalRequirement {
        ApprovalRequirement::Required
    }

    fn describe(&self, input: &Self::Input) -> Action {
        Action::new("Run the command", input.cmdline.trim())
    }

    fn execute(
        &self,
        input: ShellToolParameters,
        cancel: CancellationToken,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    Err(ToolError::execution_error().with_reason("interrupted"))
                }
                output = run_command_line(&input.cmdline) => {
                    output.map_err(|err| {
                        let reason = err.to_string();
                        ToolError::execution_error().with_reason(reason)
                    })
                }
            }
        }
    }
}

#[inline]
fn create_command_with_inferred_shell() -> Command {
    let Some(shell) = env::var_os("SHELL") else {
        return Command::new("/bin/sh");
    };
    Command::new(shell)
}

async fn run_command_line(cmdline: &str) -> Result<String, io::Error> {
    let output = create_command_with_inferred_shell()
        .arg("-c")
        .arg(cmdline)
        .stdin(Stdio::null())
        // Dropped when the call is interrupted or times out.
        .kill_on_drop(true)
        .output()
        .await?;

    let mut result = String::new();
    if !output.stdout.is_empty() {
        result.push_str("==> STDOUT <==\n");
        result.push_str(&String::from_utf8_lossy(&output.stdout));
    }
    if !output.stderr.is_empty() {
        result.push_str("\n==> STDERR <==\n");
        result.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    if !output.status.success() {
        result.push_str(&format!("\n==> {} <==\n", output.status));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_line() {
        let result = run_command_line("echo 'Hello, World!'").await;
        assert_eq!(result.unwrap(), "==> STDOUT <==\nHello, World!\n");
    }

    #[tokio::test]
    async fn test_failed_command_reports_status() {
        let result = run_command_line("exit 3").await.unwrap();
        assert!(result.contains("exit status: 3"));
    }

    #[tokio::test]
    async fn test_interrupted() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let input = ShellToolParameters {
            cmdline: "sleep 5".to_owned(),
        };
        let err = ShellTool::new().execute(input, cancel).await.unwrap_err();
        assert_eq!(err.reason(), "interrupted");
    }
}
