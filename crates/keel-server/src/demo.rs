//! Built-in capabilities served by the binary when no other orchestrator is
//! linked in.

use std::sync::Arc;

use async_trait::async_trait;
use keel_runtime::{
    Capability, CapabilityRegistry, Envelope, FlowContext, FlowInterrupt, FlowOutcome,
    OrchestrationError, Orchestrator, RegistryError, ServiceConfig, TerminalReason,
};
use serde_json::{json, Value};

pub const ECHO_CAPABILITY: &str = "echo";
pub const CONFIRMED_ECHO_CAPABILITY: &str = "confirmed_echo";

/// Echoes the user message back.
///
/// A one-word message is treated as too vague and triggers a clarification.
/// When the capability requires confirmation the echo is held until the user
/// approves it.
pub struct EchoOrchestrator;

impl EchoOrchestrator {
    fn clarified_input(envelope: &Envelope, ctx: &FlowContext) -> Option<String> {
        if let Some(answer) = ctx
            .resume_data()
            .and_then(|d| d.get("clarification_response"))
            .and_then(Value::as_str)
        {
            return Some(format!("{} {}", envelope.raw_input.trim(), answer.trim()));
        }
        if let Some(previous) = envelope
            .outputs
            .get("echo")
            .and_then(|o| o.get("input"))
            .and_then(Value::as_str)
        {
            return Some(previous.to_string());
        }
        let input = envelope.raw_input.trim();
        (input.split_whitespace().count() > 1).then(|| input.to_string())
    }
}

#[async_trait]
impl Orchestrator for EchoOrchestrator {
    async fn run(
        &self,
        envelope: &mut Envelope,
        ctx: &FlowContext,
    ) -> Result<FlowOutcome, OrchestrationError> {
        ctx.charge_agent_hop().await?;

        let Some(input) = Self::clarified_input(envelope, ctx) else {
            return Ok(FlowOutcome::Suspend(FlowInterrupt::clarification(
                "Could you tell me a bit more about what you need?",
            )));
        };
        let tokens = input.split_whitespace().count() as u64;
        ctx.charge_llm_call(tokens, tokens).await?;
        envelope
            .outputs
            .insert("echo".to_string(), json!({ "input": input }));

        if ctx.service().requires_confirmation {
            match ctx
                .resume_data()
                .and_then(|d| d.get("confirmation_response"))
                .and_then(Value::as_bool)
            {
                None => {
                    return Ok(FlowOutcome::Suspend(FlowInterrupt::confirmation(format!(
                        "Send \"{input}\"?"
                    ))))
                }
                Some(false) => {
                    return Ok(FlowOutcome::Failed {
                        reason: TerminalReason::UserCancelled,
                        message: "declined by user".to_string(),
                    })
                }
                Some(true) => {}
            }
        }

        Ok(FlowOutcome::Completed {
            final_response: json!(input),
        })
    }
}

/// Registry with the plain echo capability and a confirmation-gated variant.
pub fn demo_registry() -> Result<CapabilityRegistry, RegistryError> {
    let echo: Arc<dyn Orchestrator> = Arc::new(EchoOrchestrator);
    Ok(CapabilityRegistry::builder()
        .register(
            Capability::new(ECHO_CAPABILITY, echo.clone()).with_service(ServiceConfig {
                requires_confirmation: false,
                is_readonly: true,
            }),
        )?
        .register(
            Capability::new(CONFIRMED_ECHO_CAPABILITY, echo).with_service(ServiceConfig {
                requires_confirmation: true,
                is_readonly: false,
            }),
        )?
        .build())
}
