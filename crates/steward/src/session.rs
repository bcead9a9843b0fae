use std::path::PathBuf;
use std::sync::Arc;

use steward_core::event::Subscription;
use steward_core::permission::PermissionGate;
use steward_core::store::SessionStore;
use steward_core::{
    CancellationToken, Coordinator, CoordinatorBuilder, EngineConfig, Session,
    TurnOutcome,
};
use steward_model::ModelProvider;

use crate::tools::*;

/// An [`Assistant`] builder.
pub struct AssistantBuilder {
    coordinator_builder: CoordinatorBuilder,
    config: EngineConfig,
    root: Option<PathBuf>,
}

impl AssistantBuilder {
    /// Creates an assistant builder with a specified model provider.
    pub fn with_model_provider<M: ModelProvider + 'static>(
        provider: M,
    ) -> Self {
        Self {
            coordinator_builder: Coordinator::builder(provider),
            config: EngineConfig::default(),
            root: None,
        }
    }

    /// Replaces the engine configuration.
    #[inline]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the system prompt for the assistant.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.config = self.config.with_system_prompt(prompt);
        self
    }

    /// Resolves the relative paths given to the file tools against `root`
    /// instead of the current directory.
    #[inline]
    pub fn with_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Persists the conversation to `store`.
    #[inline]
    pub fn with_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: SessionStore + 'static,
    {
        self.coordinator_builder = self.coordinator_builder.with_store(store);
        self
    }

    /// Builds a new assistant with a fresh session.
    pub fn build(self) -> Assistant {
        let Self {
            coordinator_builder,
            config,
            root,
        } = self;
        let root = root.unwrap_or_default();

        let coordinator = coordinator_builder
            .with_config(config)
            .with_tool(ReadFileTool::new(root.clone()))
            .with_tool(GlobTool::new(root.clone()))
            .with_tool(WriteFileTool::new(root))
            .with_tool(ShellTool::new())
            .build();
        let session = coordinator.new_session();
        debug!("assistant ready, session {}", session.id());

        Assistant {
            coordinator,
            session,
        }
    }
}

/// A conversation with the model, like a window that displays messages and
/// has an input box.
///
/// The assistant holds a fully configured coordinator and the session it
/// drives.
pub struct Assistant {
    coordinator: Coordinator,
    session: Session,
}

impl Assistant {
    /// Subscribes to the events of the conversation.
    #[inline]
    pub fn subscribe(&self) -> Subscription {
        self.coordinator.subscribe()
    }

    /// Returns the gate to resolve permission requests with.
    #[inline]
    pub fn permissions(&self) -> Arc<PermissionGate> {
        Arc::clone(self.session.permissions())
    }

    /// Returns the conversation so far.
    #[inline]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Returns the underlying coordinator.
    #[inline]
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Sends a message and waits until the turn it starts is over.
    pub async fn send_message(
        &mut self,
        message: &str,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        self.coordinator
            .run_turn(&mut self.session, message, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use steward_core::conversation::ToolOutcome;
    use steward_test_model::{PresetEvent, PresetResponse, TestModelProvider};

    use super::*;

    #[tokio::test]
    async fn test_builtin_tools_are_registered() {
        let provider = TestModelProvider::with_script([
            PresetResponse::with_events([PresetEvent::tool_call(
                "g1",
                "glob",
                json!({ "pattern": "*.toml" }),
            )]),
            PresetResponse::text("There is a manifest."),
        ]);
        let mut assistant = AssistantBuilder::with_model_provider(provider)
            .with_root(env!("CARGO_MANIFEST_DIR"))
            .build();

        let names: Vec<_> = assistant
            .coordinator()
            .registry()
            .descriptors()
            .into_iter()
            .map(|tool| tool.name)
            .collect();
        assert_eq!(names, ["read_file", "glob", "write_file", "shell"]);

        let outcome = assistant
            .send_message("Any manifest?", CancellationToken::new())
            .await;
        assert!(matches!(outcome, TurnOutcome::Completed { rounds: 1, .. }));

        let results = &assistant.session().messages()[2].tool_results;
        assert_eq!(results[0].outcome, ToolOutcome::Succeeded);
        assert!(results[0].content.contains("Cargo.toml"));
    }
}
