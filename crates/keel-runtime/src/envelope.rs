//! Envelope: the resumable unit of conversational orchestration state.
//!
//! An envelope is in exactly one of four states:
//! - `Running`: no terminal reason, no pending interrupt.
//! - `Suspended`: a `PENDING` interrupt is attached; `envelope_id` is the
//!   resume token.
//! - `Completed`: `terminal_reason == COMPLETED`, final response in
//!   `outputs["integration"]["final_response"]`.
//! - `Failed`: a failure terminal reason plus a diagnostic
//!   `termination_reason`.
//!
//! `interrupt_pending` is derived from the attached interrupt, never stored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::context::RequestContext;
use crate::interrupt::FlowInterrupt;

/// Output slot holding the user-facing result.
pub const INTEGRATION_OUTPUT: &str = "integration";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalReason {
    Completed,
    QuotaExceeded,
    MaxIterationsExceeded,
    UserCancelled,
    ToolFailedFatally,
    LlmFailedFatally,
    PolicyViolation,
}

impl TerminalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalReason::Completed => "COMPLETED",
            TerminalReason::QuotaExceeded => "QUOTA_EXCEEDED",
            TerminalReason::MaxIterationsExceeded => "MAX_ITERATIONS_EXCEEDED",
            TerminalReason::UserCancelled => "USER_CANCELLED",
            TerminalReason::ToolFailedFatally => "TOOL_FAILED_FATALLY",
            TerminalReason::LlmFailedFatally => "LLM_FAILED_FATALLY",
            TerminalReason::PolicyViolation => "POLICY_VIOLATION",
        }
    }

    pub fn is_failure(self) -> bool {
        self != TerminalReason::Completed
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeStatus {
    Running,
    Suspended,
    Completed,
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("invalid envelope transition from {from:?} to {to}")]
    InvalidTransition { from: EnvelopeStatus, to: &'static str },
    #[error("clarification interrupt requires a question")]
    MissingQuestion,
    #[error("{0} is not a failure reason")]
    NotAFailure(&'static str),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub envelope_id: String,
    pub context: RequestContext,
    #[serde(default)]
    pub raw_input: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub terminal_reason: Option<TerminalReason>,
    #[serde(default)]
    pub termination_reason: Option<String>,
    #[serde(default)]
    pub interrupt: Option<FlowInterrupt>,
}

impl Envelope {
    pub fn new(context: RequestContext, raw_input: impl Into<String>) -> Self {
        Self {
            envelope_id: uuid::Uuid::new_v4().to_string(),
            context,
            raw_input: raw_input.into(),
            metadata: Map::new(),
            outputs: BTreeMap::new(),
            terminal_reason: None,
            termination_reason: None,
            interrupt: None,
        }
    }

    pub fn with_envelope_id(mut self, envelope_id: impl Into<String>) -> Self {
        self.envelope_id = envelope_id.into();
        self
    }

    pub fn request_id(&self) -> &str {
        &self.context.request_id
    }

    pub fn interrupt_pending(&self) -> bool {
        self.interrupt.as_ref().is_some_and(FlowInterrupt::is_pending)
    }

    pub fn status(&self) -> EnvelopeStatus {
        match self.terminal_reason {
            Some(TerminalReason::Completed) => EnvelopeStatus::Completed,
            Some(_) => EnvelopeStatus::Failed,
            None if self.interrupt_pending() => EnvelopeStatus::Suspended,
            None => EnvelopeStatus::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_reason.is_some()
    }

    /// Answer injected by the most recent resume, if any.
    pub fn resume_response(&self) -> Option<&Value> {
        self.interrupt
            .as_ref()
            .filter(|i| !i.is_pending())
            .and_then(|i| i.response.as_ref())
    }

    pub fn final_response(&self) -> Option<&Value> {
        self.outputs.get(INTEGRATION_OUTPUT)?.get("final_response")
    }

    fn require_running(&self, to: &'static str) -> Result<(), EnvelopeError> {
        match self.status() {
            EnvelopeStatus::Running => Ok(()),
            from => Err(EnvelopeError::InvalidTransition { from, to }),
        }
    }

    /// Running -> Suspended.
    pub fn suspend(&mut self, interrupt: FlowInterrupt) -> Result<(), EnvelopeError> {
        self.require_running("Suspended")?;
        let missing_question = interrupt.kind == crate::interrupt::InterruptKind::Clarification
            && interrupt.question.as_deref().map_or(true, str::is_empty);
        if missing_question {
            return Err(EnvelopeError::MissingQuestion);
        }
        self.interrupt = Some(interrupt);
        Ok(())
    }

    /// Suspended -> Running, with `response` attached to the interrupt.
    pub fn resolve_interrupt(&mut self, response: Value) -> Result<(), EnvelopeError> {
        match (self.status(), self.interrupt.as_mut()) {
            (EnvelopeStatus::Suspended, Some(interrupt)) => {
                interrupt.resolve(response);
                Ok(())
            }
            (from, _) => Err(EnvelopeError::InvalidTransition {
                from,
                to: "Running",
            }),
        }
    }

    /// Running -> Completed.
    pub fn complete(&mut self, final_response: Value) -> Result<(), EnvelopeError> {
        self.require_running("Completed")?;
        let slot = self
            .outputs
            .entry(INTEGRATION_OUTPUT.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        if let Value::Object(map) = slot {
            map.insert("final_response".to_string(), final_response);
        }
        self.terminal_reason = Some(TerminalReason::Completed);
        self.termination_reason = None;
        Ok(())
    }

    /// Running -> Failed.
    pub fn fail(
        &mut self,
        reason: TerminalReason,
        message: impl Into<String>,
    ) -> Result<(), EnvelopeError> {
        if !reason.is_failure() {
            return Err(EnvelopeError::NotAFailure(reason.as_str()));
        }
        self.require_running("Failed")?;
        self.terminal_reason = Some(reason);
        self.termination_reason = Some(message.into());
        Ok(())
    }

    /// Fails the envelope from any status. A pending interrupt is dropped.
    pub fn abort(&mut self, reason: TerminalReason, message: impl Into<String>) {
        if self.interrupt_pending() {
            self.interrupt = None;
        }
        self.terminal_reason = Some(reason);
        self.termination_reason = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::interrupt::InterruptStatus;

    fn envelope() -> Envelope {
        Envelope::new(RequestContext::new("req-1", "user-1"), "move money")
    }

    #[test]
    fn new_envelope_is_running() {
        let env = envelope();
        assert_eq!(env.status(), EnvelopeStatus::Running);
        assert!(!env.interrupt_pending());
        assert_eq!(env.request_id(), "req-1");
    }

    #[test]
    fn suspend_sets_pending_interrupt() {
        let mut env = envelope();
        env.suspend(FlowInterrupt::clarification("Which account?"))
            .unwrap();
        assert!(env.interrupt_pending());
        assert_eq!(env.status(), EnvelopeStatus::Suspended);
        let interrupt = env.interrupt.as_ref().unwrap();
        assert_eq!(interrupt.status, InterruptStatus::Pending);
        assert_eq!(interrupt.question.as_deref(), Some("Which account?"));
    }

    #[test]
    fn clarification_without_question_is_rejected() {
        let mut env = envelope();
        let err = env
            .suspend(FlowInterrupt::clarification(""))
            .unwrap_err();
        assert_eq!(err, EnvelopeError::MissingQuestion);
        assert!(!env.interrupt_pending());
    }

    #[test]
    fn resolve_then_complete_clears_pending() {
        let mut env = envelope();
        env.suspend(FlowInterrupt::clarification("Which account?"))
            .unwrap();
        env.resolve_interrupt(json!({"clarification_response": "Checking"}))
            .unwrap();
        assert!(!env.interrupt_pending());
        assert_eq!(
            env.resume_response(),
            Some(&json!({"clarification_response": "Checking"}))
        );
        env.complete(json!("Moved to Checking")).unwrap();
        assert_eq!(env.status(), EnvelopeStatus::Completed);
        assert_eq!(env.terminal_reason, Some(TerminalReason::Completed));
        assert_eq!(env.termination_reason, None);
        assert_eq!(env.final_response(), Some(&json!("Moved to Checking")));
        assert!(!env.interrupt_pending());
    }

    #[test]
    fn suspended_envelope_cannot_complete() {
        let mut env = envelope();
        env.suspend(FlowInterrupt::confirmation("Transfer $10?"))
            .unwrap();
        let err = env.complete(json!("done")).unwrap_err();
        assert_eq!(
            err,
            EnvelopeError::InvalidTransition {
                from: EnvelopeStatus::Suspended,
                to: "Completed"
            }
        );
    }

    #[test]
    fn fail_records_diagnostic() {
        let mut env = envelope();
        env.fail(TerminalReason::QuotaExceeded, "max_llm_calls exceeded")
            .unwrap();
        assert_eq!(env.status(), EnvelopeStatus::Failed);
        assert_eq!(
            env.termination_reason.as_deref(),
            Some("max_llm_calls exceeded")
        );
        assert!(!env.interrupt_pending());
        assert!(env.fail(TerminalReason::PolicyViolation, "again").is_err());
    }

    #[test]
    fn completed_is_not_a_failure_reason() {
        let mut env = envelope();
        assert_eq!(
            env.fail(TerminalReason::Completed, "nope").unwrap_err(),
            EnvelopeError::NotAFailure("COMPLETED")
        );
    }

    #[test]
    fn resolve_without_pending_interrupt_fails() {
        let mut env = envelope();
        assert!(env.resolve_interrupt(json!({})).is_err());
    }

    #[test]
    fn complete_keeps_existing_integration_fields() {
        let mut env = envelope();
        env.outputs
            .insert(INTEGRATION_OUTPUT.to_string(), json!({"citations": []}));
        env.complete(json!("ok")).unwrap();
        assert_eq!(
            env.outputs[INTEGRATION_OUTPUT],
            json!({"citations": [], "final_response": "ok"})
        );
    }

    #[test]
    fn abort_fails_a_suspended_envelope() {
        let mut env = envelope();
        env.suspend(FlowInterrupt::confirmation("Send it?")).unwrap();
        env.abort(TerminalReason::PolicyViolation, "bad outcome");
        assert_eq!(env.status(), EnvelopeStatus::Failed);
        assert!(env.interrupt.is_none());
        assert_eq!(env.termination_reason.as_deref(), Some("bad outcome"));
    }
}
