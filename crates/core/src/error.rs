use serde::{Deserialize, Serialize};
use steward_model::ErrorKind as ProviderErrorKind;

/// Why a turn ended without a final answer.
///
/// Failures of individual tool calls never show up here, they are reported
/// in the results of those calls instead.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error,
)]
#[serde(tag = "code", rename_all = "kebab-case")]
pub enum TurnFailure {
    /// The provider kept failing with transient errors.
    #[error("provider failed after {attempts} attempt(s): {message}")]
    ProviderTransientError {
        /// Kind of the last error.
        kind: ProviderErrorKind,
        /// Message of the last error, verbatim.
        message: String,
        /// Requests issued for the round.
        attempts: u32,
    },
    /// The provider rejected the request in a way retrying cannot fix.
    #[error("provider error ({kind}): {message}")]
    ProviderFatalError {
        /// Kind of the error.
        kind: ProviderErrorKind,
        /// Message of the error, verbatim.
        message: String,
    },
    /// The model kept asking for tools past the configured round limit.
    #[error("round-limit-exceeded: more than {limit} tool rounds")]
    RoundLimitExceeded {
        /// The configured limit.
        limit: u32,
    },
    /// Even the most recent messages don't fit the context budget.
    #[error("context budget of {budget} exceeded, {needed} needed")]
    ContextBudgetExceeded {
        /// Estimated cost of the smallest view.
        needed: usize,
        /// The configured budget.
        budget: usize,
    },
    /// A message couldn't be persisted and the engine was told to care.
    #[error("persistence failed: {message}")]
    PersistenceError {
        /// The storage error.
        message: String,
    },
}

impl TurnFailure {
    /// Returns a stable, machine-readable code for the failure.
    pub fn code(&self) -> &'static str {
        match self {
            TurnFailure::ProviderTransientError { .. } => {
                "provider-transient-error"
            }
            TurnFailure::ProviderFatalError { .. } => "provider-fatal-error",
            TurnFailure::RoundLimitExceeded { .. } => "round-limit-exceeded",
            TurnFailure::ContextBudgetExceeded { .. } => {
                "context-budget-exceeded"
            }
            TurnFailure::PersistenceError { .. } => "persistence-error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_matches_serialized_tag() {
        let failures = [
            TurnFailure::ProviderTransientError {
                kind: ProviderErrorKind::Timeout,
                message: "timed out".to_owned(),
                attempts: 3,
            },
            TurnFailure::ProviderFatalError {
                kind: ProviderErrorKind::Unauthorized,
                message: "bad key".to_owned(),
            },
            TurnFailure::RoundLimitExceeded { limit: 10 },
            TurnFailure::ContextBudgetExceeded {
                needed: 12,
                budget: 10,
            },
            TurnFailure::PersistenceError {
                message: "disk full".to_owned(),
            },
        ];
        for failure in failures {
            let value = serde_json::to_value(&failure).unwrap();
            assert_eq!(value["code"], failure.code());
        }
    }
}
