// Error classification for retry decisions
//
// Typed errors are checked first (provider status codes, tool lookup
// failures, io kinds, tokio timeouts). Message matching is the fallback for
// errors that arrive as plain strings.

use serde::Serialize;
use std::fmt;
use std::io;

use crate::errors::{ProviderError, ToolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    RateLimit,
    Timeout,
    Network,
    Auth,
    Validation,
    /// Nothing recognisable; retried like a transient failure
    Unknown,
    /// The handler panicked
    Panic,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorClass::Auth | ErrorClass::Validation | ErrorClass::Panic
        )
    }

    /// Map an HTTP status reported by a provider
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorClass::RateLimit,
            408 | 504 => ErrorClass::Timeout,
            401 | 403 => ErrorClass::Auth,
            400 | 422 => ErrorClass::Validation,
            500..=599 => ErrorClass::Network,
            _ => ErrorClass::Unknown,
        }
    }

    fn from_io_kind(kind: io::ErrorKind) -> Option<Self> {
        use io::ErrorKind::*;
        match kind {
            TimedOut => Some(ErrorClass::Timeout),
            ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
            | BrokenPipe | AddrNotAvailable | UnexpectedEof => Some(ErrorClass::Network),
            PermissionDenied => Some(ErrorClass::Auth),
            InvalidInput | InvalidData | NotFound => Some(ErrorClass::Validation),
            _ => None,
        }
    }

    fn from_message(message: &str) -> Self {
        let msg = message.to_lowercase();
        let has = |needle: &str| msg.contains(needle);

        if has("429") || has("rate limit") {
            ErrorClass::RateLimit
        } else if has("401") || has("403") || has("unauthorized") {
            ErrorClass::Auth
        } else if has("400") || has("invalid") {
            ErrorClass::Validation
        } else if has("timeout") || has("timed out") || has("deadline") {
            ErrorClass::Timeout
        } else if has("connection") || has("network") {
            ErrorClass::Network
        } else {
            ErrorClass::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Network => "network",
            ErrorClass::Auth => "auth",
            ErrorClass::Validation => "validation",
            ErrorClass::Unknown => "unknown",
            ErrorClass::Panic => "panic",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a task error for the retry policy
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        if let Some(provider) = cause.downcast_ref::<ProviderError>() {
            if let Some(status) = provider.status {
                return ErrorClass::from_status(status);
            }
        }
        if cause.downcast_ref::<ToolError>().is_some() {
            return ErrorClass::Validation;
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if let Some(class) = ErrorClass::from_io_kind(io_err.kind()) {
                return class;
            }
        }
        if cause.is::<tokio::time::error::Elapsed>() {
            return ErrorClass::Timeout;
        }
    }

    ErrorClass::from_message(&format!("{:#}", err))
}
