use std::path::PathBuf;

use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::Value;
use steward_core::CancellationToken;
use steward_core::tool::{
    Action, ApprovalRequirement, Concurrency, Error as ToolError, Tool,
    ToolResult,
};
use tokio::fs;

use super::resolve;

#[derive(Deserialize, JsonSchema)]
pub struct WriteFileParameters {
    #[schemars(description = "Path to the file, created if missing.")]
    path: String,
    #[schemars(description = "The whole new content of the file.")]
    content: String,
}

/// A tool for creating or overwriting files.
pub struct WriteFileTool {
    root: PathBuf,
    parameter_schema: Value,
}

impl WriteFileTool {
    /// Creates a new write file tool resolving relative paths against
    /// `root`.
    #[inline]
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        WriteFileTool {
            root: root.into(),
            parameter_schema: schema_for!(WriteFileParameters).to_value(),
        }
    }
}

impl Tool for WriteFileTool {
    type Input = WriteFileParameters;

    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        r#"
Writes a file, replacing its content if it already exists.
Parent directories are created as needed."#
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
        let lines = input.content.lines().count();
        Action::new(
            format!("Write {lines} lines to {}", input.path),
            input.path.clone(),
        )
    }

    fn execute(
        &self,
        input: WriteFileParameters,
        _cancel: CancellationToken,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        // A half-written file is worse than a late one, cancellation is
        // not observed.
        let path = resolve(&self.root, &input.path);
        async move {
            let failed = |err: std::io::Error| {
                ToolError::execution_error()
                    .with_reason(format!("{}: {err}", path.display()))
            };
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.map_err(failed)?;
            }
            fs::write(&path, input.content.as_bytes())
                .await
                .map_err(failed)?;
            Ok(format!(
                "wrote {} bytes to {}",
                input.content.len(),
                path.display()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::process;

    use super::*;

    #[test]
    fn test_describe() {
        let tool = WriteFileTool::new("/");
        let action = tool.describe(&WriteFileParameters {
            path: "src/main.rs".to_owned(),
            content: "fn main() {\n}\n".to_owned(),
        });
        assert_eq!(action.description, "Write 2 lines to src/main.rs");
        assert_eq!(action.target, "src/main.rs");
    }

    #[tokio::test]
    async fn test_write_creates_parents() {
        let root = env::temp_dir().join(format!("steward-{}", process::id()));
        let tool = WriteFileTool::new(&root);
        let input = WriteFileParameters {
            path: "nested/notes.txt".to_owned(),
            content: "hello".to_owned(),
        };
        let output = tool.execute(input, CancellationToken::new()).await;
        assert!(output.unwrap().starts_with("wrote 5 bytes"));

        let written = fs::read_to_string(root.join("nested/notes.txt")).await;
        assert_eq!(written.unwrap(), "hello");
        fs::remove_dir_all(&root).await.unwrap();
    }
}
