use std::path::PathBuf;

use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::Value;
use steward_core::CancellationToken;
use steward_core::tool::{Action, Error as ToolError, Tool, ToolResult};
use tokio::fs;

use super::resolve;

const DEFAULT_LIMIT: usize = 200;

#[derive(Deserialize, JsonSchema)]
pub struct ReadFileParameters {
    #[schemars(description = "Path to the file.")]
    path: String,
    #[schemars(description = "1-based line to start from, default to 1.")]
    offset: Option<usize>,
    #[schemars(description = "Maximum number of lines, default to 200.")]
    limit: Option<usize>,
}

/// A tool for reading file content with line numbers.
pub struct ReadFileTool {
    root: PathBuf,
    parameter_schema: Value,
}

impl ReadFileTool {
    /// Creates a new read file tool resolving relative paths against
    /// `root`.
    #[inline]
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        ReadFileTool {
            root: root.into(),
            parameter_schema: schema_for!(ReadFileParameters).to_value(),
        }
    }
}

impl Tool for ReadFileTool {
    type Input = ReadFileParameters;

    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        r#"
Reads a file and returns its content prefixed with line numbers.
Use `offset` and `limit` to page through long files."#
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn describe(&self, input: &Self::Input) -> Action {
        Action::new(format!("Read {}", input.path), input.path.clone())
    }

    fn execute(
        &self,
        input: ReadFileParameters,
        _cancel: CancellationToken,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let path = resolve(&self.root, &input.path);
        async move {
            let offset = input.offset.unwrap_or(1);
            if offset == 0 {
                return Err(ToolError::invalid_input()
                    .with_reason("`offset` must be 1-based"));
            }
            let limit = input.limit.unwrap_or(DEFAULT_LIMIT);

            let content = fs::read_to_string(&path).await.map_err(|err| {
                ToolError::execution_error()
                    .with_reason(format!("{}: {err}", path.display()))
            })?;
            Ok(number_lines(&content, offset, limit))
        }
    }
}

/// Formats `limit` lines of `content` from `offset` on, each prefixed
/// with its number.
fn number_lines(content: &str, offset: usize, limit: usize) -> String {
    let total = content.lines().count();
    if offset > total {
        return format!("(the file has {total} lines)\n");
    }
    let last = total.min(offset - 1 + limit);
    let width = last.to_string().len();

    let mut result = String::new();
    for (index, line) in content.lines().enumerate().take(last).skip(offset - 1)
    {
        result.push_str(&format!("{:>width$}: {line}\n", index + 1));
    }
    if last < total {
        result.push_str(&format!("({} more lines)\n", total - last));
    }
    result
}
