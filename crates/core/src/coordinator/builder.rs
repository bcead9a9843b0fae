use std::sync::Arc;

use steward_model::ModelProvider;

use super::Coordinator;
use crate::compact::{
    CharEstimator, Compactor, CostEstimator, ExtractiveSummarizer, Summarizer,
};
use crate::config::EngineConfig;
use crate::event::EventBus;
use crate::model_client::ModelClient;
use crate::store::SessionStore;
use crate::tool::{Tool, ToolEngine, ToolRegistry};

/// [`Coordinator`] builder.
pub struct CoordinatorBuilder {
    model_client: ModelClient,
    registry: ToolRegistry,
    config: EngineConfig,
    estimator: Option<Arc<dyn CostEstimator>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    store: Option<Arc<dyn SessionStore>>,
    bus: Option<EventBus>,
}

impl CoordinatorBuilder {
    /// Creates a new builder with the specified model provider.
    #[inline]
    pub fn with_model_provider<P: ModelProvider + 'static>(
        provider: P,
    ) -> Self {
        Self {
            model_client: ModelClient::new(provider),
            registry: ToolRegistry::default(),
            config: EngineConfig::default(),
            estimator: None,
            summarizer: None,
            store: None,
            bus: None,
        }
    }

    /// Registers a tool.
    #[inline]
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Self {
        self.registry.register(tool);
        self
    }

    /// Replaces the default configuration.
    #[inline]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets how the cost of messages is estimated. Defaults to
    /// [`CharEstimator`].
    #[inline]
    pub fn with_cost_estimator<E>(mut self, estimator: E) -> Self
    where
        E: CostEstimator + 'static,
    {
        self.estimator = Some(Arc::new(estimator));
        self
    }

    /// Sets how compacted history is summarized. Defaults to
    /// [`ExtractiveSummarizer`].
    #[inline]
    pub fn with_summarizer<S>(mut self, summarizer: S) -> Self
    where
        S: Summarizer + 'static,
    {
        self.summarizer = Some(Arc::new(summarizer));
        self
    }

    /// Persists every message of every session to `store`.
    #[inline]
    pub fn with_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: SessionStore + 'static,
    {
        self.store = Some(store);
        self
    }

    /// Publishes events on an existing bus instead of a new one.
    #[inline]
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Builds the coordinator.
    pub fn build(self) -> Coordinator {
        let Self {
            model_client,
            registry,
            config,
            estimator,
            summarizer,
            store,
            bus,
        } = self;

        let estimator =
            estimator.unwrap_or_else(|| Arc::new(CharEstimator::default()));
        let summarizer = summarizer
            .unwrap_or_else(|| Arc::new(ExtractiveSummarizer::default()));
        let bus = bus.unwrap_or_else(|| EventBus::new(config.event_capacity));
        let registry = Arc::new(registry);
        debug!("building a coordinator with {} tools", registry.len());

        Coordinator {
            model_client,
            engine: ToolEngine::new(
                Arc::clone(&registry),
                config.tool_timeout(),
            ),
            registry,
            compactor: Compactor::new(estimator, summarizer),
            bus,
            store,
            config,
        }
    }
}
