//! Request and response bodies for the HTTP edge.

use keel_kernel::{Priority, ProcessState, ResourceUsage};
use keel_runtime::{Envelope, InterruptKind, TerminalReason};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, Deserialize)]
pub struct SubmitRequestBody {
    pub user_message: String,
    pub user_id: String,
    pub session_id: Option<String>,
    /// Optional `request_id` and `capability` selectors.
    pub context: Option<Map<String, Value>>,
}

impl SubmitRequestBody {
    fn context_str(&self, key: &str) -> Option<&str> {
        self.context
            .as_ref()
            .and_then(|c| c.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn requested_request_id(&self) -> Option<&str> {
        self.context_str("request_id")
    }

    pub fn requested_capability(&self) -> Option<&str> {
        self.context_str("capability")
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ClarificationBody {
    pub thread_id: String,
    pub clarification: String,
    pub user_id: String,
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConfirmationBody {
    pub confirmation_id: String,
    pub user_response: String,
    pub user_id: String,
}

impl ConfirmationBody {
    /// Reads the free-text answer as approve or decline.
    pub fn approved(&self) -> Option<bool> {
        match self.user_response.trim().to_ascii_lowercase().as_str() {
            "yes" | "y" | "confirm" | "approve" | "ok" | "true" => Some(true),
            "no" | "n" | "cancel" | "decline" | "deny" | "false" => Some(false),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequestResponse {
    pub request_id: String,
    pub status: String,
    pub response_text: Option<String>,
    pub clarification_needed: bool,
    pub clarification_question: Option<String>,
    /// Token for `POST /api/v1/chat/clarifications`.
    pub thread_id: Option<String>,
    pub confirmation_needed: bool,
    pub confirmation_message: Option<String>,
    /// Token for `POST /api/v1/confirmations`.
    pub confirmation_id: Option<String>,
}

impl SubmitRequestResponse {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let mut response = Self {
            request_id: envelope.request_id().to_string(),
            ..Self::default()
        };
        if let Some(interrupt) = envelope.interrupt.as_ref().filter(|i| i.is_pending()) {
            match interrupt.kind {
                InterruptKind::Clarification => {
                    response.status = "clarification_needed".to_string();
                    response.clarification_needed = true;
                    response.clarification_question = interrupt.question.clone();
                    response.thread_id = Some(envelope.envelope_id.clone());
                }
                InterruptKind::Confirmation => {
                    response.status = "confirmation_needed".to_string();
                    response.confirmation_needed = true;
                    response.confirmation_message = interrupt.message.clone();
                    response.confirmation_id = Some(envelope.envelope_id.clone());
                }
            }
            return response;
        }
        if envelope.terminal_reason == Some(TerminalReason::Completed) {
            response.status = "completed".to_string();
            response.response_text = envelope.final_response().map(text_of);
        } else {
            response.status = "failed".to_string();
            response.response_text = envelope.termination_reason.clone();
        }
        response
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub within_bounds: bool,
    pub exceeded_reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestStatusResponse {
    pub pid: String,
    pub state: ProcessState,
    pub priority: Priority,
    pub current_stage: Option<String>,
    pub resource_usage: ResourceUsage,
    pub quota: QuotaStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub capabilities: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub status: String,
    pub kernel: String,
}
