//! Axum handlers for the Keel HTTP edge.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::middleware::{from_fn, Next};
use axum::routing::{get, post};
use axum::{Json, Router};
use keel_runtime::{generate_request_id, Envelope, FlowError, FlowService, RequestContext};
use serde_json::json;

use crate::api_errors::ApiError;
use crate::api_models::{
    ClarificationBody, ConfirmationBody, HealthResponse, QuotaStatus, ReadyResponse,
    RequestStatusResponse, SubmitRequestBody, SubmitRequestResponse,
};

pub const REQUESTS_ENDPOINT: &str = "/api/v1/requests";
pub const CLARIFICATIONS_ENDPOINT: &str = "/api/v1/chat/clarifications";
pub const CONFIRMATIONS_ENDPOINT: &str = "/api/v1/confirmations";

const MAX_USER_MESSAGE: usize = 10_000;
const MAX_CLARIFICATION: usize = 2_000;
const MAX_USER_RESPONSE: usize = 1_000;
const MAX_ID: usize = 255;

#[derive(Clone)]
pub struct AppState {
    pub flows: FlowService,
}

impl AppState {
    pub fn new(flows: FlowService) -> Self {
        Self { flows }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route(REQUESTS_ENDPOINT, post(submit_request))
        .route("/api/v1/requests/:pid/status", get(request_status))
        .route(CLARIFICATIONS_ENDPOINT, post(submit_clarification))
        .route(CONFIRMATIONS_ENDPOINT, post(submit_confirmation))
        .layer(from_fn(request_log_middleware))
        .with_state(state)
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

async fn request_log_middleware(
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> axum::response::Response {
    let rid = request_id(&headers);
    log::info!(
        "keel_api_request request_id={} method={} path={}",
        rid,
        request.method(),
        request.uri().path()
    );
    next.run(request).await
}

fn validate_text(field: &str, value: &str, max: usize) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{field} must not be empty")));
    }
    if value.chars().count() > max {
        return Err(ApiError::bad_request(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(())
}

fn validate_optional(field: &str, value: Option<&str>, max: usize) -> Result<(), ApiError> {
    match value {
        Some(v) if v.chars().count() > max => Err(ApiError::bad_request(format!(
            "{field} must be at most {max} characters"
        ))),
        _ => Ok(()),
    }
}

/// Asks the kernel whether `user_id` may call `endpoint` right now.
async fn enforce_rate_limit(
    state: &AppState,
    user_id: &str,
    endpoint: &str,
) -> Result<(), ApiError> {
    let verdict = state
        .flows
        .client()
        .check_rate_limit(user_id, endpoint)
        .await
        .map_err(|e| ApiError::from(FlowError::Kernel(e)))?;
    if verdict.allowed {
        return Ok(());
    }
    Err(ApiError::too_many_requests(verdict.reason.clone()).with_details(json!({
        "limit_type": verdict.limit_type,
        "limit": verdict.limit,
        "current_count": verdict.current_count,
        "retry_after_seconds": verdict.retry_after_seconds,
    })))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        capabilities: state.flows.registry().ids(),
    })
}

/// 200 once the kernel answers a read, 503 otherwise.
async fn ready(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ReadyResponse>, ApiError> {
    if let Err(err) = state.flows.client().ping().await {
        log::warn!("keel_not_ready error={err}");
        return Err(
            ApiError::service_unavailable(format!("kernel not reachable: {err}"))
                .with_request_id(request_id(&headers)),
        );
    }
    Ok(Json(ReadyResponse {
        status: "ready".to_string(),
        kernel: "ok".to_string(),
    }))
}

pub async fn submit_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SubmitRequestBody>,
) -> Result<Json<SubmitRequestResponse>, ApiError> {
    let rid = request_id(&headers);
    validate_text("user_message", &req.user_message, MAX_USER_MESSAGE)
        .and_then(|_| validate_text("user_id", &req.user_id, MAX_ID))
        .and_then(|_| validate_optional("session_id", req.session_id.as_deref(), MAX_ID))
        .map_err(|e| e.with_request_id(rid.clone()))?;
    enforce_rate_limit(&state, &req.user_id, REQUESTS_ENDPOINT)
        .await
        .map_err(|e| e.with_request_id(rid.clone()))?;

    let request_id = req
        .requested_request_id()
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);
    let mut context = RequestContext::new(request_id, req.user_id.clone());
    if let Some(session_id) = req.session_id.as_deref().filter(|s| !s.trim().is_empty()) {
        context = context.with_session(session_id);
    }
    if let Some(capability) = req.requested_capability() {
        context = context.with_capability(capability);
    }
    log::info!(
        "keel_submit request_id={} api_request_id={} user_id={}",
        context.request_id,
        rid,
        context.user_id
    );

    let envelope = state
        .flows
        .process_envelope(Envelope::new(context, req.user_message))
        .await
        .map_err(|e| ApiError::from(e).with_request_id(rid.clone()))?;
    Ok(Json(SubmitRequestResponse::from_envelope(&envelope)))
}

pub async fn submit_clarification(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ClarificationBody>,
) -> Result<Json<SubmitRequestResponse>, ApiError> {
    let rid = request_id(&headers);
    validate_text("thread_id", &req.thread_id, MAX_ID)
        .and_then(|_| validate_text("clarification", &req.clarification, MAX_CLARIFICATION))
        .and_then(|_| validate_text("user_id", &req.user_id, MAX_ID))
        .and_then(|_| validate_optional("session_id", req.session_id.as_deref(), MAX_ID))
        .map_err(|e| e.with_request_id(rid.clone()))?;
    enforce_rate_limit(&state, &req.user_id, CLARIFICATIONS_ENDPOINT)
        .await
        .map_err(|e| e.with_request_id(rid.clone()))?;

    log::info!(
        "keel_clarification request_id={} thread_id={} user_id={}",
        rid,
        req.thread_id,
        req.user_id
    );
    let envelope = state
        .flows
        .resume(
            &req.thread_id,
            json!({ "clarification_response": req.clarification }),
        )
        .await
        .map_err(|e| ApiError::from(e).with_request_id(rid.clone()))?;
    Ok(Json(SubmitRequestResponse::from_envelope(&envelope)))
}

pub async fn submit_confirmation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ConfirmationBody>,
) -> Result<Json<SubmitRequestResponse>, ApiError> {
    let rid = request_id(&headers);
    validate_text("confirmation_id", &req.confirmation_id, MAX_ID)
        .and_then(|_| validate_text("user_response", &req.user_response, MAX_USER_RESPONSE))
        .and_then(|_| validate_text("user_id", &req.user_id, MAX_ID))
        .map_err(|e| e.with_request_id(rid.clone()))?;
    let approved = req.approved().ok_or_else(|| {
        ApiError::bad_request("user_response must be a yes or no answer")
            .with_request_id(rid.clone())
    })?;
    enforce_rate_limit(&state, &req.user_id, CONFIRMATIONS_ENDPOINT)
        .await
        .map_err(|e| e.with_request_id(rid.clone()))?;

    log::info!(
        "keel_confirmation request_id={} confirmation_id={} approved={}",
        rid,
        req.confirmation_id,
        approved
    );
    let envelope = state
        .flows
        .resume(
            &req.confirmation_id,
            json!({
                "confirmation_response": approved,
                "user_response": req.user_response,
            }),
        )
        .await
        .map_err(|e| ApiError::from(e).with_request_id(rid.clone()))?;
    Ok(Json(SubmitRequestResponse::from_envelope(&envelope)))
}

pub async fn request_status(
    State(state): State<AppState>,
    Path(pid): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RequestStatusResponse>, ApiError> {
    let rid = request_id(&headers);
    let client = state.flows.client();
    let process = client
        .get_process(&pid)
        .await
        .map_err(|e| ApiError::from(FlowError::Kernel(e)).with_request_id(rid.clone()))?
        .ok_or_else(|| {
            ApiError::not_found(format!("Request not found: {pid}")).with_request_id(rid.clone())
        })?;
    let quota = client
        .check_quota(&pid)
        .await
        .map_err(|e| ApiError::from(FlowError::Kernel(e)).with_request_id(rid.clone()))?;
    Ok(Json(RequestStatusResponse {
        pid: process.pid,
        state: process.state,
        priority: process.priority,
        current_stage: process.current_stage,
        resource_usage: process.usage,
        quota: QuotaStatus {
            within_bounds: quota.within_bounds,
            exceeded_reason: quota.exceeded().map(str::to_string),
        },
    }))
}
