// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error codes shared by control-plane Responses and data-plane
/// Result frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    NotFound,
    Aborted,
    Canceled,
    Unsupported,
    Internal,
}

impl ErrorCode {
    /// Numeric code carried in Result frames (`{status, error, code}`).
    pub fn wire_code(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::Aborted => 499,
            Self::Canceled => 503,
            Self::Unsupported => 501,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::Aborted => "ABORTED",
            Self::Canceled => "CANCELED",
            Self::Unsupported => "UNSUPPORTED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by command and stream handlers.
///
/// Carries the taxonomy code that the dispatcher maps onto the terminal
/// Response or Result frame.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn aborted() -> Self {
        Self::new(ErrorCode::Aborted, "operation aborted")
    }

    pub fn canceled() -> Self {
        Self::new(ErrorCode::Canceled, "canceled: bridge shutting down")
    }

    /// True when this error represents client-initiated cancellation, which
    /// clients suppress rather than surface.
    pub fn is_aborted(&self) -> bool {
        self.code == ErrorCode::Aborted
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                Self::new(ErrorCode::Unauthorized, err.to_string())
            }
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("encode: {err}"))
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
