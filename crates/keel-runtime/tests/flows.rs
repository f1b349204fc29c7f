//! End-to-end flow scenarios against the in-process kernel.

use std::sync::Arc;

use async_trait::async_trait;
use keel_kernel::{
    InMemoryKernel, KernelClient, ProcessState, QuotaOverrides, Transport, TransportError,
};
use keel_runtime::{
    Capability, CapabilityRegistry, Envelope, EnvelopeStatus, FlowContext, FlowError,
    FlowInterrupt, FlowOutcome, FlowService, FlowStore, InMemoryFlowStore, InterruptKind,
    OrchestrationError, Orchestrator, RequestContext, ServiceConfig, TerminalReason,
};
use serde_json::{json, Value};

/// Asks which account to use, then answers with the chosen one.
struct AccountBalance;

#[async_trait]
impl Orchestrator for AccountBalance {
    async fn run(
        &self,
        envelope: &mut Envelope,
        ctx: &FlowContext,
    ) -> Result<FlowOutcome, OrchestrationError> {
        ctx.charge_agent_hop().await?;
        ctx.charge_llm_call(100, 50).await?;
        let Some(answer) = ctx
            .resume_data()
            .and_then(|d| d.get("clarification_response"))
            .and_then(Value::as_str)
        else {
            return Ok(FlowOutcome::Suspend(FlowInterrupt::clarification(
                "Which account?",
            )));
        };
        envelope
            .outputs
            .insert("planner".to_string(), json!({"account": answer}));
        Ok(FlowOutcome::Completed {
            final_response: json!(format!("{answer} balance is $120")),
        })
    }
}

/// Burns one LLM call per pass until the kernel refuses.
struct Spender;

#[async_trait]
impl Orchestrator for Spender {
    async fn run(
        &self,
        _envelope: &mut Envelope,
        ctx: &FlowContext,
    ) -> Result<FlowOutcome, OrchestrationError> {
        loop {
            ctx.charge_llm_call(10, 10).await?;
        }
    }
}

/// Requires confirmation when the capability is configured for it.
struct Transfer;

#[async_trait]
impl Orchestrator for Transfer {
    async fn run(
        &self,
        _envelope: &mut Envelope,
        ctx: &FlowContext,
    ) -> Result<FlowOutcome, OrchestrationError> {
        ctx.charge_tool_call().await?;
        if ctx.service().requires_confirmation && ctx.resume_data().is_none() {
            return Ok(FlowOutcome::Suspend(FlowInterrupt::confirmation(
                "Transfer $50 to savings?",
            )));
        }
        let approved = ctx
            .resume_data()
            .and_then(|d| d.get("confirmation_response"))
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if approved {
            Ok(FlowOutcome::Completed {
                final_response: json!("Transferred $50"),
            })
        } else {
            Ok(FlowOutcome::Failed {
                reason: TerminalReason::UserCancelled,
                message: "user declined transfer".to_string(),
            })
        }
    }
}

struct Harness {
    flows: FlowService,
    kernel: Arc<InMemoryKernel>,
    store: Arc<InMemoryFlowStore>,
}

fn harness(capability: Capability) -> Harness {
    let kernel = Arc::new(InMemoryKernel::new());
    let store = Arc::new(InMemoryFlowStore::new());
    let registry = CapabilityRegistry::builder()
        .register(capability)
        .unwrap()
        .build();
    let flows = FlowService::new(KernelClient::new(kernel.clone()), store.clone(), registry);
    Harness {
        flows,
        kernel,
        store,
    }
}

fn envelope(request_id: &str) -> Envelope {
    Envelope::new(RequestContext::new(request_id, "user-1"), "what's my balance?")
}

#[tokio::test]
async fn clarification_then_resume_completes() {
    let h = harness(Capability::new("banking", Arc::new(AccountBalance)));

    let suspended = h.flows.process_envelope(envelope("req-1")).await.unwrap();
    assert_eq!(suspended.status(), EnvelopeStatus::Suspended);
    assert!(suspended.interrupt_pending());
    let interrupt = suspended.interrupt.as_ref().unwrap();
    assert_eq!(interrupt.kind, InterruptKind::Clarification);
    assert_eq!(interrupt.question.as_deref(), Some("Which account?"));
    assert_eq!(suspended.context.capability.as_deref(), Some("banking"));

    let process = h.flows.client().get_process("req-1").await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Blocked);
    assert!(h
        .store
        .load(&suspended.envelope_id)
        .await
        .unwrap()
        .is_some());

    let done = h
        .flows
        .resume(
            &suspended.envelope_id,
            json!({"clarification_response": "Checking"}),
        )
        .await
        .unwrap();
    assert_eq!(done.terminal_reason, Some(TerminalReason::Completed));
    assert!(!done.interrupt_pending());
    assert_eq!(done.final_response(), Some(&json!("Checking balance is $120")));
    assert_eq!(done.envelope_id, suspended.envelope_id);

    let process = h.flows.client().get_process("req-1").await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Terminated);
    assert_eq!(process.usage.llm_calls, 2);
    assert_eq!(process.usage.agent_hops, 2);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn unknown_token_creates_nothing() {
    let h = harness(Capability::new("banking", Arc::new(AccountBalance)));
    let err = h
        .flows
        .resume("no-such-token", json!({"clarification_response": "x"}))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::UnknownResumeToken(ref t) if t == "no-such-token"));
    assert_eq!(h.kernel.process_count(), 0);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn quota_exhaustion_fails_the_envelope() {
    let h = harness(Capability::new("spender", Arc::new(Spender)));
    let flows = h.flows.clone().with_quota(QuotaOverrides {
        max_llm_calls: Some(3),
        ..QuotaOverrides::default()
    });
    let env = flows.process_envelope(envelope("req-q")).await.unwrap();
    assert_eq!(env.status(), EnvelopeStatus::Failed);
    assert_eq!(env.terminal_reason, Some(TerminalReason::QuotaExceeded));
    assert_eq!(
        env.termination_reason.as_deref(),
        Some("max_llm_calls exceeded")
    );
    assert!(!env.interrupt_pending());

    let process = flows.client().get_process("req-q").await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Terminated);
    assert_eq!(process.usage.llm_calls, 4);
}

#[tokio::test]
async fn confirmation_declined_fails_as_cancelled() {
    let capability = Capability::new("payments", Arc::new(Transfer)).with_service(ServiceConfig {
        requires_confirmation: true,
        is_readonly: false,
    });
    let h = harness(capability);
    let suspended = h.flows.process_envelope(envelope("req-c")).await.unwrap();
    let interrupt = suspended.interrupt.as_ref().unwrap();
    assert_eq!(interrupt.kind, InterruptKind::Confirmation);
    assert_eq!(interrupt.message.as_deref(), Some("Transfer $50 to savings?"));

    let env = h
        .flows
        .resume(
            &suspended.envelope_id,
            json!({"confirmation_response": false}),
        )
        .await
        .unwrap();
    assert_eq!(env.terminal_reason, Some(TerminalReason::UserCancelled));
    assert_eq!(
        env.termination_reason.as_deref(),
        Some("user declined transfer")
    );
}

#[tokio::test]
async fn unconfirmed_capability_runs_straight_through() {
    let h = harness(Capability::new("payments", Arc::new(Transfer)));
    let env = h.flows.process_envelope(envelope("req-d")).await.unwrap();
    assert_eq!(env.status(), EnvelopeStatus::Completed);
    assert_eq!(env.final_response(), Some(&json!("Transferred $50")));
}

#[tokio::test]
async fn suspended_request_cannot_be_taken_over() {
    let capability = Capability::new("payments", Arc::new(Transfer)).with_service(ServiceConfig {
        requires_confirmation: true,
        is_readonly: false,
    });
    let h = harness(capability);
    let alice = Envelope::new(RequestContext::new("req-h", "alice"), "move $50");
    let suspended = h.flows.process_envelope(alice).await.unwrap();
    assert!(suspended.interrupt_pending());

    let mallory = Envelope::new(RequestContext::new("req-h", "mallory"), "move $50");
    let err = h.flows.process_envelope(mallory).await.unwrap_err();
    assert!(matches!(err, FlowError::ProcessBusy(ref pid) if pid == "req-h"));

    // The owner resubmitting while suspended is refused as well.
    let again = Envelope::new(RequestContext::new("req-h", "alice"), "move $50");
    let err = h.flows.process_envelope(again).await.unwrap_err();
    assert!(matches!(err, FlowError::ProcessBusy(_)));

    let process = h.flows.client().get_process("req-h").await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Blocked);
    assert_eq!(process.user_id, "alice");

    let env = h
        .flows
        .resume(
            &suspended.envelope_id,
            json!({"confirmation_response": true}),
        )
        .await
        .unwrap();
    assert_eq!(env.status(), EnvelopeStatus::Completed);
    assert_eq!(env.context.user_id, "alice");
}

/// Suspends with a clarification that has no question.
struct AskNothing;

#[async_trait]
impl Orchestrator for AskNothing {
    async fn run(
        &self,
        _envelope: &mut Envelope,
        _ctx: &FlowContext,
    ) -> Result<FlowOutcome, OrchestrationError> {
        Ok(FlowOutcome::Suspend(FlowInterrupt::clarification("")))
    }
}

#[tokio::test]
async fn invalid_suspension_fails_as_policy_violation() {
    let h = harness(Capability::new("banking", Arc::new(AskNothing)));
    let env = h.flows.process_envelope(envelope("req-q")).await.unwrap();
    assert_eq!(env.status(), EnvelopeStatus::Failed);
    assert_eq!(env.terminal_reason, Some(TerminalReason::PolicyViolation));
    assert!(!env.interrupt_pending());
    assert!(h.store.is_empty());

    let process = h.flows.client().get_process("req-q").await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Terminated);
}

#[tokio::test]
async fn resume_after_process_vanished_is_not_found() {
    let h = harness(Capability::new("banking", Arc::new(AccountBalance)));
    let suspended = h.flows.process_envelope(envelope("req-v")).await.unwrap();

    // A fresh kernel that never heard of req-v, sharing the same store.
    let registry = h.flows.registry().clone();
    let flows = FlowService::new(
        KernelClient::new(Arc::new(InMemoryKernel::new())),
        h.store.clone(),
        registry,
    );
    let err = flows
        .resume(&suspended.envelope_id, json!({"clarification_response": "Savings"}))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::ProcessNotFound(ref pid) if pid == "req-v"));
}

/// Kernel that stops answering after a number of calls.
struct FlakyKernel {
    inner: InMemoryKernel,
    budget: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl Transport for FlakyKernel {
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn request(
        &self,
        namespace: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, TransportError> {
        use std::sync::atomic::Ordering;
        let left = self.budget.load(Ordering::SeqCst);
        if left == 0 {
            return Err(TransportError::unavailable("kernel down"));
        }
        self.budget.store(left - 1, Ordering::SeqCst);
        self.inner.request(namespace, method, args).await
    }
}

#[tokio::test]
async fn kernel_outage_on_resume_keeps_the_token() {
    let flaky = Arc::new(FlakyKernel {
        inner: InMemoryKernel::new(),
        budget: std::sync::atomic::AtomicUsize::new(usize::MAX),
    });
    let store = Arc::new(InMemoryFlowStore::new());
    let registry = CapabilityRegistry::builder()
        .register(Capability::new("banking", Arc::new(AccountBalance)))
        .unwrap()
        .build();
    let flows = FlowService::new(KernelClient::new(flaky.clone()), store.clone(), registry);

    let suspended = flows.process_envelope(envelope("req-k")).await.unwrap();
    flaky
        .budget
        .store(0, std::sync::atomic::Ordering::SeqCst);
    let err = flows
        .resume(&suspended.envelope_id, json!({"clarification_response": "Checking"}))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Kernel(ref e) if e.is_unavailable()));
    assert!(store.load(&suspended.envelope_id).await.unwrap().is_some());

    flaky
        .budget
        .store(usize::MAX, std::sync::atomic::Ordering::SeqCst);
    let done = flows
        .resume(&suspended.envelope_id, json!({"clarification_response": "Checking"}))
        .await
        .unwrap();
    assert_eq!(done.status(), EnvelopeStatus::Completed);
}
