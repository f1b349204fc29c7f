//! Flow interrupts: suspension points that wait for a human answer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier for an interrupt.
pub type InterruptId = String;

/// Kind of interrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptKind {
    /// The flow needs more information from the user.
    Clarification,
    /// The flow needs the user to approve an action.
    Confirmation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptStatus {
    Pending,
    Resolved,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowInterrupt {
    pub id: InterruptId,
    pub kind: InterruptKind,
    pub status: InterruptStatus,
    /// Required for a pending clarification.
    #[serde(default)]
    pub question: Option<String>,
    /// Shown to the user for a confirmation.
    #[serde(default)]
    pub message: Option<String>,
    /// The answer injected on resume.
    #[serde(default)]
    pub response: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl FlowInterrupt {
    fn pending(kind: InterruptKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            status: InterruptStatus::Pending,
            question: None,
            message: None,
            response: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn clarification(question: impl Into<String>) -> Self {
        Self {
            question: Some(question.into()),
            ..Self::pending(InterruptKind::Clarification)
        }
    }

    pub fn confirmation(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::pending(InterruptKind::Confirmation)
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == InterruptStatus::Pending
    }

    pub(crate) fn resolve(&mut self, response: Value) {
        self.status = InterruptStatus::Resolved;
        self.response = Some(response);
        self.resolved_at = Some(Utc::now());
    }
}
