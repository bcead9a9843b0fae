use std::path::{Path, PathBuf};

use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::Value;
use steward_core::CancellationToken;
use steward_core::tool::{Action, Error as ToolError, Tool, ToolResult};
use tokio::task::spawn_blocking;

use super::resolve;

const MAX_MATCHES: usize = 100;

#[derive(Deserialize, JsonSchema)]
pub struct GlobToolParameters {
    #[schemars(description = "The glob pattern, relative to `path`.")]
    pattern: String,
    #[schemars(
        description = "Directory to search in, default to the workspace root."
    )]
    path: Option<String>,
}

/// A tool for finding files using glob patterns.
pub struct GlobTool {
    root: PathBuf,
    parameter_schema: Value,
}

impl GlobTool {
    /// Creates a new glob tool searching under `root` by default.
    #[inline]
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        GlobTool {
            root: root.into(),
            parameter_schema: schema_for!(GlobToolParameters).to_value(),
        }
    }
}

impl Tool for GlobTool {
    type Input = GlobToolParameters;

    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        r#"
Finds files and directories using glob patterns.
Standard glob syntax like *, ? and ** for recursive searches is supported.
At most 100 matches are returned."#
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn describe(&self, input: &Self::Input) -> Action {
        let dir = input.path.as_deref().unwrap_or(".");
        Action::new(format!("List `{}` in {dir}", input.pattern), dir)
    }

    fn execute(
        &self,
        input: GlobToolParameters,
        _cancel: CancellationToken,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let root = self.root.clone();
        async move {
            if Path::new(&input.pattern).is_absolute() {
                return Err(ToolError::invalid_input()
                    .with_reason("`pattern` must be relative to `path`"));
            }
            let dir = match &input.path {
                Some(path) => resolve(&root, path),
                None => root,
            };
            let pattern = dir.join(&input.pattern);
            let paths = glob::glob(&pattern.to_string_lossy()).map_err(|err| {
                ToolError::invalid_input().with_reason(err.to_string())
            })?;

            spawn_blocking(move || {
                let mut result = String::new();
                let mut matches = 0;
                for item in paths.flatten() {
                    if matches == MAX_MATCHES {
                        result.push_str("(more matches omitted)\n");
                        break;
                    }
                    result.push_str(&item.to_string_lossy());
                    result.push('\n');
                    matches += 1;
                }
                if matches == 0 {
                    result.push_str("no matches\n");
                }
                result
            })
            .await
            .map_err(|_| {
                ToolError::execution_error().with_reason("failed to run glob")
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pattern: &str, path: Option<&str>) -> GlobToolParameters {
        GlobToolParameters {
            pattern: pattern.to_owned(),
            path: path.map(str::to_owned),
        }
    }

    #[tokio::test]
    async fn test_input_validation() {
        let tool = GlobTool::new("/");
        let cancel = CancellationToken::new();

        let result = tool.execute(params("/*.*", None), cancel.clone()).await;
        assert!(result.is_err());

        let result = tool.execute(params("[", None), cancel).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_relative_to_root() {
        let tool = GlobTool::new(env!("CARGO_MANIFEST_DIR"));
        let cancel = CancellationToken::new();

        let result = tool.execute(params("src/*.rs", None), cancel.clone());
        assert!(result.await.unwrap().contains("lib.rs"));

        let result = tool.execute(params("*.md", Some("src/tools")), cancel);
        assert_eq!(result.await.unwrap(), "no matches\n");
    }
}
