//! HTTP error mapping for the Keel edge.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use keel_runtime::{FlowError, RegistryError};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(ErrorState),
    NotFound(ErrorState),
    Conflict(ErrorState),
    TooManyRequests(ErrorState),
    Internal(ErrorState),
    ServiceUnavailable(ErrorState),
}

#[derive(Clone, Debug)]
pub struct ErrorState {
    pub message: String,
    pub request_id: Option<String>,
    pub details: Option<Value>,
}

impl ErrorState {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            request_id: None,
            details: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
struct ErrorEnvelope {
    request_id: String,
    error: ErrorBody,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(ErrorState::new(message))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(ErrorState::new(message))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(ErrorState::new(message))
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::TooManyRequests(ErrorState::new(message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(ErrorState::new(message))
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable(ErrorState::new(message))
    }

    fn state_mut(&mut self) -> &mut ErrorState {
        match self {
            Self::BadRequest(s)
            | Self::NotFound(s)
            | Self::Conflict(s)
            | Self::TooManyRequests(s)
            | Self::Internal(s)
            | Self::ServiceUnavailable(s) => s,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.state_mut().request_id = Some(request_id.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.state_mut().details = Some(details);
        self
    }
}

impl From<FlowError> for ApiError {
    fn from(err: FlowError) -> Self {
        let message = err.to_string();
        match err {
            FlowError::UnknownResumeToken(_) | FlowError::ProcessNotFound(_) => {
                Self::not_found(message)
            }
            FlowError::ProcessTerminated(_)
            | FlowError::ProcessBusy(_)
            | FlowError::NotSuspended(_)
            | FlowError::Envelope(_) => Self::conflict(message),
            FlowError::Registry(RegistryError::Empty) => Self::service_unavailable(message),
            FlowError::Registry(_) => Self::bad_request(message),
            FlowError::Kernel(ref e) if e.is_unavailable() => Self::service_unavailable(message),
            FlowError::Kernel(_) | FlowError::Store(_) => Self::internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, state) = match self {
            Self::BadRequest(s) => (StatusCode::BAD_REQUEST, "invalid_argument", s),
            Self::NotFound(s) => (StatusCode::NOT_FOUND, "not_found", s),
            Self::Conflict(s) => (StatusCode::CONFLICT, "conflict", s),
            Self::TooManyRequests(s) => (StatusCode::TOO_MANY_REQUESTS, "rate_limited", s),
            Self::Internal(s) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", s),
            Self::ServiceUnavailable(s) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", s),
        };
        let retry_after = state
            .details
            .as_ref()
            .and_then(|d| d.get("retry_after_seconds"))
            .and_then(Value::as_u64)
            .filter(|_| status == StatusCode::TOO_MANY_REQUESTS);
        let request_id = state
            .request_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let body = ErrorEnvelope {
            request_id,
            error: ErrorBody {
                code,
                message: state.message,
                details: state.details,
            },
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}
