//! Coded errors
//!
//! Every error surfaced to clients carries a stable numeric code; the HTTP
//! layer maps codes to statuses through a fixed table.

use serde::{Deserialize, Serialize};

/// Stable error code carried in every RPC/HTTP response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    VersionMismatch,
    PermissionDenied,
    PreconditionFailed,
    ResourceExhausted,
    Unavailable,
    Internal,
    Cancelled,
    NotImplemented,
}

impl ErrorCode {
    /// Numeric code placed in response envelopes (0 is reserved for OK)
    pub fn as_u32(self) -> u32 {
        match self {
            ErrorCode::InvalidArgument => 4000,
            ErrorCode::PermissionDenied => 4030,
            ErrorCode::NotFound => 4040,
            ErrorCode::AlreadyExists => 4090,
            ErrorCode::VersionMismatch => 4091,
            ErrorCode::PreconditionFailed => 4120,
            ErrorCode::ResourceExhausted => 4290,
            ErrorCode::Cancelled => 4990,
            ErrorCode::Internal => 5000,
            ErrorCode::NotImplemented => 5010,
            ErrorCode::Unavailable => 5030,
        }
    }

    /// Fixed code-to-status table used by the HTTP layer
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::InvalidArgument => 400,
            ErrorCode::PermissionDenied => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::AlreadyExists | ErrorCode::VersionMismatch => 409,
            ErrorCode::PreconditionFailed => 412,
            ErrorCode::ResourceExhausted => 429,
            ErrorCode::Cancelled => 499,
            ErrorCode::Internal => 500,
            ErrorCode::NotImplemented => 501,
            ErrorCode::Unavailable => 503,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::VersionMismatch => "version_mismatch",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::PreconditionFailed => "precondition_failed",
            ErrorCode::ResourceExhausted => "resource_exhausted",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::Internal => "internal",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::NotImplemented => "not_implemented",
        };
        write!(f, "{}", name)
    }
}

/// Error type used across the meta server
#[derive(Debug, thiserror::Error)]
pub struct MetaError {
    pub code: ErrorCode,
    pub msg: String,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for MetaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.msg)?;
        if let Some(cause) = &self.cause {
            write!(f, ", cause: {}", cause)?;
        }
        Ok(())
    }
}

impl MetaError {
    pub fn new(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            cause: None,
        }
    }

    /// Attach an underlying cause, keeping the code and message.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, msg)
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, msg)
    }

    pub fn version_mismatch(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::VersionMismatch, msg)
    }

    pub fn precondition_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::PreconditionFailed, msg)
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ResourceExhausted, msg)
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, msg)
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotImplemented, msg)
    }

    /// Whether the caller may retry after refreshing its snapshot.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.code, ErrorCode::VersionMismatch | ErrorCode::Unavailable)
    }
}

impl From<kv::KvError> for MetaError {
    fn from(err: kv::KvError) -> Self {
        MetaError::unavailable("kv store call failed").with_cause(err)
    }
}

impl From<serde_json::Error> for MetaError {
    fn from(err: serde_json::Error) -> Self {
        MetaError::internal("encode/decode record").with_cause(err)
    }
}

pub type Result<T> = std::result::Result<T, MetaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_table() {
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
        assert_eq!(ErrorCode::VersionMismatch.http_status(), 409);
        assert_eq!(ErrorCode::ResourceExhausted.http_status(), 429);
        assert_eq!(ErrorCode::Unavailable.http_status(), 503);
    }

    #[test]
    fn test_display_includes_cause() {
        let err = MetaError::unavailable("dispatch failed")
            .with_cause(std::io::Error::new(std::io::ErrorKind::Other, "refused"));
        let rendered = err.to_string();
        assert!(rendered.contains("unavailable"));
        assert!(rendered.contains("refused"));
    }

    #[test]
    fn test_recoverable_codes() {
        assert!(MetaError::version_mismatch("stale").is_recoverable());
        assert!(MetaError::unavailable("node gone").is_recoverable());
        assert!(!MetaError::already_exists("table").is_recoverable());
    }
}
