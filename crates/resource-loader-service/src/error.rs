use std::error::Error;
use std::time::Duration;

use thiserror::Error;

/// An error that happens when loading a resource.
///
/// Errors are `Clone` because a single network operation can settle many merged
/// callers, each of which receives its own copy of the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The network is offline and there is no cached copy of the resource.
    #[error("network unavailable and no cached copy of `{0}`")]
    NetworkUnavailable(String),
    /// The request failed on the wire or the server answered with a non-2xx status.
    #[error("transport error{}: {message}", fmt_status(.status))]
    Transport {
        /// The HTTP status code, if a response was received at all.
        status: Option<u16>,
        /// A description of the failure.
        message: String,
    },
    /// A single attempt did not finish within its timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The request (or a strategy registration) was rejected before doing any work.
    #[error("invalid request: {0}")]
    Validation(String),
    /// The resource was fetched but could not be decoded as the requested kind.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The operation was cancelled, either by teardown or by memory pressure.
    #[error("request cancelled")]
    Cancelled,
    /// An unexpected error in the loader itself.
    #[error("internal error")]
    InternalError,
}

impl LoadError {
    /// Whether a failed attempt should be retried.
    ///
    /// Timeouts and transport failures are transient. Cancellation is terminal so
    /// that teardown and memory pressure actually release the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout(_))
    }

    /// A short tag for metrics and events.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NetworkUnavailable(_) => "offline",
            Self::Transport { .. } => "transport",
            Self::Timeout(_) => "timeout",
            Self::Validation(_) => "validation",
            Self::Malformed(_) => "malformed",
            Self::Cancelled => "cancelled",
            Self::InternalError => "internal",
        }
    }

    fn transport_error(mut error: &dyn Error, status: Option<u16>) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut message = error.to_string();

        // Special-case a few error strings
        if message.contains("certificate verify failed") {
            message = "certificate verify failed".to_string();
        }

        if message.contains("SSL routines") {
            message = "SSL error".to_string();
        }

        Self::Transport { status, message }
    }
}

impl From<reqwest::Error> for LoadError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            // the per-attempt timeout is enforced by the loader, the client timeout
            // only fires as a backstop
            return Self::Timeout(Duration::ZERO);
        }
        let status = error.status().map(|s| s.as_u16());
        Self::transport_error(&error, status)
    }
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

/// An error in the cache collaborator.
///
/// The cache is best-effort: these errors are logged and never reach callers.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache i/o failed")]
    Io(#[from] std::io::Error),
    #[error("cache metadata is corrupt")]
    Metadata(#[from] serde_json::Error),
}

/// An error in the durable key/value state storage.
///
/// The experiment harness logs these and keeps working from memory.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("state storage i/o failed")]
    Io(#[from] std::io::Error),
    #[error("stored state is corrupt")]
    Corrupt(#[from] serde_json::Error),
}
