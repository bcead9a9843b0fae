//! Engine configuration.
//!
//! Every field has a default, so a configuration file only needs to name
//! what it changes. Durations are expressed in milliseconds.

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};

use crate::permission::PermissionPolicy;

/// Default maximum number of tool rounds in a turn.
pub const DEFAULT_MAX_ROUNDS: u32 = 25;
/// Default provider timeout in milliseconds.
pub const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 60_000;
/// Default tool timeout in milliseconds.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 120_000;
/// Default context budget, in estimated tokens.
pub const DEFAULT_CONTEXT_BUDGET: usize = 100_000;
/// Default capacity of each subscriber queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Configuration of the turn loop and its collaborators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of tool rounds before a turn is failed.
    pub max_rounds: u32,
    /// Retry policy for provider requests.
    pub retry: RetryConfig,
    /// Time allowed to open a response, and between two of its events.
    pub provider_timeout_ms: u64,
    /// Time allowed for a single tool call.
    pub tool_timeout_ms: u64,
    /// Time allowed for a permission request, `None` waits forever.
    pub permission_timeout_ms: Option<u64>,
    /// Budget of the history sent to the provider, in estimated tokens.
    pub context_budget: usize,
    /// Capacity of each event subscriber's queue. The queue holds at least
    /// this many events, the length is rounded up to a power of two.
    pub event_capacity: usize,
    /// System prompt placed before the history.
    pub system_prompt: Option<String>,
    /// Fail the turn when a message cannot be persisted.
    pub fail_on_persistence_error: bool,
    /// Approve every tool call without asking.
    pub bypass_permissions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            retry: RetryConfig::default(),
            provider_timeout_ms: DEFAULT_PROVIDER_TIMEOUT_MS,
            tool_timeout_ms: DEFAULT_TOOL_TIMEOUT_MS,
            permission_timeout_ms: None,
            context_budget: DEFAULT_CONTEXT_BUDGET,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            system_prompt: None,
            fail_on_persistence_error: false,
            bypass_permissions: false,
        }
    }
}

impl EngineConfig {
    /// Sets the maximum number of tool rounds.
    #[inline]
    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Sets the retry policy.
    #[inline]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the provider timeout.
    #[inline]
    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout_ms = duration_to_ms(timeout);
        self
    }

    /// Sets the tool timeout.
    #[inline]
    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout_ms = duration_to_ms(timeout);
        self
    }

    /// Sets the permission timeout, `None` waits forever.
    #[inline]
    pub fn with_permission_timeout(
        mut self,
        timeout: Option<Duration>,
    ) -> Self {
        self.permission_timeout_ms = timeout.map(duration_to_ms);
        self
    }

    /// Sets the context budget.
    #[inline]
    pub fn with_context_budget(mut self, budget: usize) -> Self {
        self.context_budget = budget;
        self
    }

    /// Sets the capacity of each subscriber's queue.
    #[inline]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Sets the system prompt.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Makes persistence failures fail the turn.
    #[inline]
    pub fn with_fail_on_persistence_error(mut self, fail: bool) -> Self {
        self.fail_on_persistence_error = fail;
        self
    }

    /// Enables or disables the permission bypass.
    #[inline]
    pub fn with_bypass_permissions(mut self, bypass: bool) -> Self {
        self.bypass_permissions = bypass;
        self
    }

    /// Returns the provider timeout.
    #[inline]
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    /// Returns the tool timeout.
    #[inline]
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    /// Returns the permission policy sessions are created with.
    #[inline]
    pub fn permission_policy(&self) -> PermissionPolicy {
        PermissionPolicy {
            bypass: self.bypass_permissions,
            wait_timeout: self.permission_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Exponential backoff policy for transient provider failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of requests per round, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_interval_ms: u64,
    /// Upper bound of a single delay.
    pub max_interval_ms: u64,
    /// Growth factor between two delays.
    pub multiplier: f64,
    /// Jitter applied to each delay, in `[0, 1]`.
    pub randomization_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_interval_ms: 500,
            max_interval_ms: 8_000,
            multiplier: 2.0,
            randomization_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Builds the backoff schedule for one round of requests.
    pub(crate) fn backoff(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.initial_interval_ms);
        ExponentialBackoffBuilder::new()
            .with_initial_interval(initial)
            .with_max_interval(Duration::from_millis(self.max_interval_ms))
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization_factor)
            .with_max_elapsed_time(None)
            .build()
    }

    #[inline]
    pub(crate) fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
