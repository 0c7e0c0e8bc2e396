// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-plane request/response messages and data-plane Result payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bootstrap::SessionIdentity;
use crate::error::ErrorCode;

/// A control-plane request. Immutable once read off the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Handler namespace (`control`, `system`, …).
    #[serde(rename = "type")]
    pub namespace: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub session_id: String,
}

/// A control-plane response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error,
}

impl Response {
    pub fn ok(output: Value) -> Self {
        Self { status: Status::Ok, output: Some(output), error: None }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self { status: Status::Error, output: None, error: Some(message.into()) }
    }
}

/// Payload of a data-plane Result frame: `{status, error?, code?, data?}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultPayload {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResultPayload {
    pub fn ok(data: Value) -> Self {
        Self { status: Status::Ok, error: None, code: None, data: Some(data) }
    }

    pub fn err(message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            status: Status::Error,
            error: Some(message.into()),
            code: Some(code.wire_code()),
            data: None,
        }
    }
}

/// Constant-time string comparison, so secret validation leaks no timing.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Why a request was refused before reaching a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    /// Auth-class refusals close the connection.
    Auth(String),
    /// Routing refusals leave the connection open.
    Routing(String),
}

impl Refusal {
    pub fn message(&self) -> &str {
        match self {
            Self::Auth(m) | Self::Routing(m) => m,
        }
    }
}

const FORBIDDEN: &[char] = &['.', '/', '\\'];

impl Request {
    /// Validate authentication and routing fields against the session
    /// identity captured at bootstrap. Requests that fail here never reach
    /// a handler.
    pub fn validate(&self, identity: &SessionIdentity) -> Result<(), Refusal> {
        if self.namespace.is_empty() || self.command.is_empty() {
            return Err(Refusal::Auth("empty type or command".to_owned()));
        }
        if self.namespace.contains(FORBIDDEN) || self.command.contains(FORBIDDEN) {
            return Err(Refusal::Auth("forbidden characters in type or command".to_owned()));
        }
        if !constant_time_eq(&self.secret, &identity.secret) {
            return Err(Refusal::Auth("invalid secret".to_owned()));
        }
        if self.session_id != identity.session_id {
            return Err(Refusal::Auth("invalid session".to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "request_tests.rs"]
mod tests;
