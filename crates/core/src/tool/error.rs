use std::borrow::Cow;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// The kind of error that occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The input provided to the tool was invalid.
    InvalidInput,
    /// No tool is registered under the requested name.
    NotFound,
    /// Error occurred while executing the tool.
    ExecutionError,
    /// The tool was not allowed to execute.
    PermissionDenied,
    /// The tool didn't finish in time.
    Timeout,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidInput => write!(f, "invalid input"),
            ErrorKind::NotFound => write!(f, "tool not found"),
            ErrorKind::ExecutionError => write!(f, "execution error"),
            ErrorKind::PermissionDenied => write!(f, "permission denied"),
            ErrorKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Describes a tool call error.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Error {
    kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl Error {
    #[inline]
    fn new(kind: ErrorKind) -> Self {
        Self { kind, reason: None }
    }

    /// Creates a new error with the `InvalidInput` kind.
    #[inline]
    pub fn invalid_input() -> Self {
        Self::new(ErrorKind::InvalidInput)
    }

    /// Creates a new error with the `NotFound` kind.
    #[inline]
    pub fn not_found() -> Self {
        Self::new(ErrorKind::NotFound)
    }

    /// Creates a new error with the `ExecutionError` kind.
    #[inline]
    pub fn execution_error() -> Self {
        Self::new(ErrorKind::ExecutionError)
    }

    /// Creates a new error with the `PermissionDenied` kind.
    #[inline]
    pub fn permission_denied() -> Self {
        Self::new(ErrorKind::PermissionDenied)
    }

    /// Creates a new error with the `Timeout` kind.
    #[inline]
    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout)
    }

    /// Attaches a reason to the error.
    #[inline]
    pub fn with_reason<S: Into<String>>(self, reason: S) -> Self {
        Self {
            kind: self.kind,
            reason: Some(reason.into()),
        }
    }

    /// Returns the kind of the error.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the reason for the error.
    #[inline]
    pub fn reason(&self) -> Cow<'_, str> {
        match self.reason.as_deref() {
            Some(reason) => Cow::Borrowed(reason),
            None => Cow::Owned(format!("{}", self.kind)),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{}: {reason}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {}
