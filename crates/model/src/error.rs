use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// The kind of error that occurred.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The provider did not answer in time.
    Timeout,
    /// The model provider is rate limited.
    RateLimitExceeded,
    /// The provider failed internally (5xx-equivalent).
    ServerError,
    /// The credentials were rejected.
    Unauthorized,
    /// The request was malformed or rejected as invalid.
    InvalidRequest,
    /// The content is moderated.
    Moderated,
    /// Any other errors.
    Other,
}

impl ErrorKind {
    /// Returns `true` if a request failing with this kind may succeed when
    /// it is sent again later.
    #[inline]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::RateLimitExceeded
                | ErrorKind::ServerError
        )
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimitExceeded => "rate limit exceeded",
            ErrorKind::ServerError => "server error",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::Moderated => "moderated",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::RateLimitExceeded.is_transient());
        assert!(ErrorKind::ServerError.is_transient());
        assert!(!ErrorKind::Unauthorized.is_transient());
        assert!(!ErrorKind::InvalidRequest.is_transient());
        assert!(!ErrorKind::Moderated.is_transient());
    }
}
