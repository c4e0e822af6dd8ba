//! Crate-wide error type.
//!
//! Mirrors `error-types::ServiceError` in shape (a `thiserror` enum with an
//! `anyhow`-wrapped internal catch-all) but carries the error kinds this
//! pipeline surfaces rather than a gRPC status mapping, since transport is
//! out of scope here.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("caller is not authorized for this viewer")]
    Unauthorized,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("request deadline exceeded before any candidate source returned")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),

    #[error("{resource} unreachable and no cached fallback available")]
    Unavailable { resource: String },
}

impl PipelineError {
    /// Stable wire-facing error code.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Unauthorized => "UNAUTHORIZED",
            PipelineError::RateLimited => "RATE_LIMITED",
            PipelineError::InvalidArgument(_) => "INVALID_ARGUMENT",
            PipelineError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            PipelineError::Internal(_) => "INTERNAL",
            PipelineError::Unavailable { .. } => "UNAVAILABLE",
        }
    }

    pub fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        PipelineError::Internal(err.into())
    }

    /// Log at a level matching severity, the way `ServiceError::log` does.
    pub fn log(&self) {
        match self {
            PipelineError::Unauthorized => tracing::warn!(error = %self, "authorization failure"),
            PipelineError::RateLimited => tracing::info!(error = %self, "rate limit hit"),
            PipelineError::InvalidArgument(_) => tracing::debug!(error = %self, "client error"),
            PipelineError::DeadlineExceeded => tracing::warn!(error = %self, "deadline exceeded"),
            PipelineError::Internal(_) => tracing::error!(error = %self, "internal error"),
            PipelineError::Unavailable { .. } => tracing::warn!(error = %self, "dependency unavailable"),
        }
    }
}
