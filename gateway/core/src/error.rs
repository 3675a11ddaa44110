//! Wire-level error taxonomy
//!
//! Every terminal failure the dispatcher reports to a client carries one of
//! these stable codes together with a human-readable message. Provider
//! failures are folded into the `RATE_LIMIT` / `NETWORK` / `AUTH` / `INPUT`
//! codes via [`ProviderErrorKind`](crate::routing::ProviderErrorKind).

use serde::{Deserialize, Serialize};

use crate::routing::ProviderErrorKind;

/// Stable error codes returned in `call_tool_res.error.code`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Token mismatch during hello or rotation
    Unauthorized,
    /// Hello payload could not be parsed
    InvalidHello,
    /// Requested tool is not registered
    ToolNotFound,
    /// An admission permit was not immediately available
    OverCapacity,
    /// Deadline expired or retry chain exhausted
    Timeout,
    /// Tool raised an error
    ExecError,
    /// Malformed `call_tool` payload
    InvalidRequest,
    /// Upstream rate limit or quota
    RateLimit,
    /// Upstream unreachable
    Network,
    /// Upstream rejected credentials
    Auth,
    /// Upstream rejected the input
    Input,
}

impl ErrorCode {
    /// Wire representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidHello => "INVALID_HELLO",
            Self::ToolNotFound => "TOOL_NOT_FOUND",
            Self::OverCapacity => "OVER_CAPACITY",
            Self::Timeout => "TIMEOUT",
            Self::ExecError => "EXEC_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::RateLimit => "RATE_LIMIT",
            Self::Network => "NETWORK",
            Self::Auth => "AUTH",
            Self::Input => "INPUT",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ProviderErrorKind> for ErrorCode {
    fn from(kind: ProviderErrorKind) -> Self {
        match kind {
            ProviderErrorKind::RateLimit => Self::RateLimit,
            ProviderErrorKind::Network => Self::Network,
            ProviderErrorKind::Auth => Self::Auth,
            ProviderErrorKind::Input => Self::Input,
            ProviderErrorKind::Other => Self::ExecError,
        }
    }
}

/// Structured error object carried by `call_tool_res`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable code
    pub code: ErrorCode,
    /// Human-readable description
    pub message: String,
}

impl ErrorBody {
    /// Build an error body
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
