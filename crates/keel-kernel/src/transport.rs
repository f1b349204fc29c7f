//! Transport contract to the kernel.
//!
//! A transport carries `(namespace, method, args)` to the kernel and returns a
//! structured result or a typed [`TransportError`]. It does not retry and knows
//! nothing about quotas. Each call is bounded by the transport's timeout.
//!
//! # Wire format
//!
//! Frames are JSON documents behind a 4-byte big-endian length prefix:
//! ```text
//! request:  {"id": 7, "namespace": "kernel", "method": "GetProcess", "args": {...}}
//! response: {"id": 7, "ok": true, "result": {...}}
//!           {"id": 7, "ok": false, "error": {"code": "NOT_FOUND", "message": "..."}}
//! stream:   {"id": 7, "ok": true, "result": {...}} ... {"id": 7, "ok": true, "end": true}
//! ```

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure classes a transport may report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    NotFound,
    Internal,
    Unavailable,
    DeadlineExceeded,
    InvalidArgument,
}

impl TransportErrorKind {
    pub fn as_code(self) -> &'static str {
        match self {
            TransportErrorKind::NotFound => "NOT_FOUND",
            TransportErrorKind::Internal => "INTERNAL",
            TransportErrorKind::Unavailable => "UNAVAILABLE",
            TransportErrorKind::DeadlineExceeded => "DEADLINE_EXCEEDED",
            TransportErrorKind::InvalidArgument => "INVALID_ARGUMENT",
        }
    }

    /// Unknown codes are treated as `INTERNAL`.
    pub fn from_code(code: &str) -> Self {
        match code {
            "NOT_FOUND" => TransportErrorKind::NotFound,
            "UNAVAILABLE" => TransportErrorKind::Unavailable,
            "DEADLINE_EXCEEDED" => TransportErrorKind::DeadlineExceeded,
            "INVALID_ARGUMENT" => TransportErrorKind::InvalidArgument,
            _ => TransportErrorKind::Internal,
        }
    }

    /// The connection may be healthy again on the next call.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            TransportErrorKind::Unavailable | TransportErrorKind::DeadlineExceeded
        )
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{}: {message}", .kind.as_code())]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unavailable, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::DeadlineExceeded, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::InvalidArgument, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == TransportErrorKind::NotFound
    }
}

pub type TransportStream = BoxStream<'static, Result<Value, TransportError>>;

/// Request/response channel to the kernel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Idempotent.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Safe to call repeatedly.
    async fn close(&self) -> Result<(), TransportError>;

    async fn request(
        &self,
        namespace: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, TransportError>;

    /// Streaming variant. The default yields the single `request` result.
    async fn request_stream(
        &self,
        namespace: &str,
        method: &str,
        args: Value,
    ) -> Result<TransportStream, TransportError> {
        let result = self.request(namespace, method, args).await?;
        Ok(stream::once(async move { Ok(result) }).boxed())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: u64,
    pub namespace: String,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl From<&TransportError> for WireError {
    fn from(err: &TransportError) -> Self {
        Self {
            code: err.kind.as_code().to_string(),
            message: err.message.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub end: bool,
}

impl WireResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
            end: false,
        }
    }

    pub fn failure(id: u64, err: &TransportError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(WireError::from(err)),
            end: false,
        }
    }

    pub fn end_of_stream(id: u64) -> Self {
        Self {
            id,
            ok: true,
            result: None,
            error: None,
            end: true,
        }
    }

    /// Result payload or the kernel-reported error. A success frame without a
    /// result decodes as `null`.
    pub fn into_result(self) -> Result<Value, TransportError> {
        if self.ok {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        let err = self.error.unwrap_or(WireError {
            code: "INTERNAL".to_string(),
            message: "error frame without details".to_string(),
        });
        Err(TransportError::new(
            TransportErrorKind::from_code(&err.code),
            err.message,
        ))
    }
}
