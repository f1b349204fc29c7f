//! Flow service: drives one envelope through its capability orchestrator while
//! keeping the kernel process in step.
//!
//! `process_envelope` and `resume` are the only entry points. A pass ends in
//! one of three ways:
//! - completed or failed: the process is terminated and any checkpoint removed;
//! - suspended: the process is blocked and the envelope is checkpointed under
//!   its `envelope_id`;
//! - kernel error: propagated to the caller as [`FlowError::Kernel`].

use std::sync::Arc;

use keel_kernel::{
    ClientError, KernelClient, Priority, ProcessRecord, ProcessSpec, ProcessState, QuotaOverrides,
};
use serde_json::Value;
use thiserror::Error;

use crate::capability::{Capability, CapabilityRegistry, RegistryError};
use crate::checkpoint::{FlowCheckpoint, FlowStore, FlowStoreError};
use crate::envelope::{Envelope, EnvelopeError, EnvelopeStatus, TerminalReason};
use crate::orchestrator::{FlowContext, FlowOutcome, OrchestrationError};

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("unknown resume token: {0}")]
    UnknownResumeToken(String),
    #[error("flow {0} has no pending interrupt")]
    NotSuspended(String),
    #[error("process {0} is already terminated")]
    ProcessTerminated(String),
    #[error("process {0} not found")]
    ProcessNotFound(String),
    #[error("process {0} is busy with another flow")]
    ProcessBusy(String),
    #[error(transparent)]
    Kernel(#[from] ClientError),
    #[error(transparent)]
    Store(#[from] FlowStoreError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Clone)]
pub struct FlowService {
    client: KernelClient,
    store: Arc<dyn FlowStore>,
    registry: CapabilityRegistry,
    quota: QuotaOverrides,
    priority: Priority,
}

impl FlowService {
    pub fn new(
        client: KernelClient,
        store: Arc<dyn FlowStore>,
        registry: CapabilityRegistry,
    ) -> Self {
        Self {
            client,
            store,
            registry,
            quota: QuotaOverrides::default(),
            priority: Priority::Normal,
        }
    }

    /// Quota overrides sent with every `CreateProcess`.
    pub fn with_quota(mut self, quota: QuotaOverrides) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn client(&self) -> &KernelClient {
        &self.client
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Runs a fresh envelope. The kernel process is keyed by the envelope's
    /// request id and created on first use. An existing process is reused only
    /// while it is NEW or READY and belongs to the same user.
    pub async fn process_envelope(&self, mut envelope: Envelope) -> Result<Envelope, FlowError> {
        let status = envelope.status();
        if status != EnvelopeStatus::Running {
            return Err(EnvelopeError::InvalidTransition {
                from: status,
                to: "Running",
            }
            .into());
        }
        let capability = self
            .registry
            .resolve(envelope.context.capability.as_deref())?
            .clone();
        envelope.context.capability = Some(capability.id.clone());

        let pid = envelope.request_id().to_string();
        let record = match self.client.get_process(&pid).await? {
            Some(record) if record.state.is_terminal() => {
                return Err(FlowError::ProcessTerminated(pid));
            }
            Some(record) if !reusable(&record, &envelope) => {
                log::warn!(
                    "flow_rejected_busy pid={pid} state={} user_id={}",
                    record.state.as_str(),
                    envelope.context.user_id
                );
                return Err(FlowError::ProcessBusy(pid));
            }
            Some(record) => record,
            None => self.create_process(&envelope).await?,
        };
        let record = self.dispatch(record).await?;
        self.drive(&capability, record, envelope, None).await
    }

    /// Re-enters a suspended flow with the user's answer.
    ///
    /// The checkpoint is claimed before re-entry. It is put back only when the
    /// kernel could not be reached, so the same token can be retried.
    pub async fn resume(&self, token: &str, response_data: Value) -> Result<Envelope, FlowError> {
        let checkpoint = self
            .store
            .take(token)
            .await?
            .ok_or_else(|| FlowError::UnknownResumeToken(token.to_string()))?;
        log::info!(
            "flow_resumed token={token} pid={} capability={}",
            checkpoint.pid,
            checkpoint.capability
        );
        match self.reenter(&checkpoint, response_data).await {
            Err(FlowError::Kernel(err)) => {
                self.store.save(&checkpoint).await?;
                Err(FlowError::Kernel(err))
            }
            other => other,
        }
    }

    async fn reenter(
        &self,
        checkpoint: &FlowCheckpoint,
        response_data: Value,
    ) -> Result<Envelope, FlowError> {
        let capability = self
            .registry
            .get(&checkpoint.capability)
            .cloned()
            .ok_or_else(|| RegistryError::Unknown(checkpoint.capability.clone()))?;
        let mut envelope = checkpoint.envelope.clone();
        if !envelope.interrupt_pending() {
            return Err(FlowError::NotSuspended(checkpoint.token.clone()));
        }

        let record = match self.client.get_process(&checkpoint.pid).await? {
            None => return Err(FlowError::ProcessNotFound(checkpoint.pid.clone())),
            Some(record) if record.state.is_terminal() => {
                return Err(FlowError::ProcessTerminated(checkpoint.pid.clone()));
            }
            Some(record) => record,
        };
        envelope.resolve_interrupt(response_data.clone())?;
        let record = self.dispatch(record).await?;
        self.drive(&capability, record, envelope, Some(response_data))
            .await
    }

    async fn create_process(&self, envelope: &Envelope) -> Result<ProcessRecord, FlowError> {
        let ctx = &envelope.context;
        let spec = ProcessSpec::new(ctx.request_id.clone())
            .with_request_id(ctx.request_id.clone())
            .with_user(ctx.user_id.clone())
            .with_session(ctx.session_id.clone())
            .with_priority(self.priority)
            .with_quota(self.quota);
        Ok(self.client.create_process(&spec).await?)
    }

    /// Brings the process to RUNNING before an orchestration pass.
    async fn dispatch(&self, record: ProcessRecord) -> Result<ProcessRecord, FlowError> {
        let pid = record.pid.clone();
        let record = if record.state == ProcessState::New {
            self.client.schedule_process(&pid).await?
        } else {
            record
        };
        match record.state {
            ProcessState::Ready => Ok(self
                .client
                .transition_state(&pid, ProcessState::Running, "dispatched")
                .await?),
            ProcessState::Blocked => Ok(self
                .client
                .transition_state(&pid, ProcessState::Running, "resumed")
                .await?),
            _ => Ok(record),
        }
    }

    async fn drive(
        &self,
        capability: &Capability,
        record: ProcessRecord,
        mut envelope: Envelope,
        resume_data: Option<Value>,
    ) -> Result<Envelope, FlowError> {
        let pid = record.pid;
        let mut ctx = FlowContext::new(self.client.clone(), pid.clone(), envelope.context.clone())
            .with_service(capability.service);
        if let Some(data) = resume_data {
            ctx = ctx.with_resume_data(data);
        }

        let outcome = capability.orchestrator.run(&mut envelope, &ctx).await;
        match outcome {
            Ok(FlowOutcome::Completed { final_response }) => {
                if let Err(err) = envelope.complete(final_response) {
                    self.reject(&pid, &mut envelope, err).await?;
                    return Ok(envelope);
                }
                self.finish(&pid, &envelope, "completed").await?;
                log::info!(
                    "flow_completed pid={pid} envelope_id={}",
                    envelope.envelope_id
                );
            }
            Ok(FlowOutcome::Suspend(interrupt)) => {
                if let Err(err) = envelope.suspend(interrupt) {
                    self.reject(&pid, &mut envelope, err).await?;
                    return Ok(envelope);
                }
                if record.state == ProcessState::Running {
                    self.client
                        .transition_state(&pid, ProcessState::Blocked, "awaiting user input")
                        .await?;
                }
                let checkpoint = FlowCheckpoint::new(pid.clone(), capability.id.clone(), envelope.clone());
                self.store.save(&checkpoint).await?;
                log::info!(
                    "flow_suspended pid={pid} envelope_id={} kind={:?}",
                    envelope.envelope_id,
                    envelope.interrupt.as_ref().map(|i| i.kind)
                );
            }
            Ok(FlowOutcome::Failed { reason, message })
            | Err(OrchestrationError::Failed { reason, message }) => {
                self.fail(&pid, &mut envelope, reason, message).await?;
            }
            Err(OrchestrationError::QuotaExceeded(reason)) => {
                self.fail(&pid, &mut envelope, TerminalReason::QuotaExceeded, reason)
                    .await?;
            }
            Err(OrchestrationError::Kernel(err)) => return Err(FlowError::Kernel(err)),
        }
        Ok(envelope)
    }

    async fn fail(
        &self,
        pid: &str,
        envelope: &mut Envelope,
        reason: TerminalReason,
        message: String,
    ) -> Result<(), FlowError> {
        log::warn!(
            "flow_failed pid={pid} envelope_id={} reason={} message={message}",
            envelope.envelope_id,
            reason.as_str()
        );
        match envelope.fail(reason, message) {
            Ok(()) => self.finish(pid, envelope, reason.as_str()).await,
            Err(err) => self.reject(pid, envelope, err).await,
        }
    }

    /// The orchestrator returned an outcome the envelope cannot take. The flow
    /// ends as a policy violation so the process does not stay RUNNING.
    async fn reject(
        &self,
        pid: &str,
        envelope: &mut Envelope,
        err: EnvelopeError,
    ) -> Result<(), FlowError> {
        log::warn!(
            "flow_outcome_rejected pid={pid} envelope_id={} error={err}",
            envelope.envelope_id
        );
        let reason = TerminalReason::PolicyViolation;
        envelope.abort(reason, format!("invalid orchestrator outcome: {err}"));
        self.finish(pid, envelope, reason.as_str()).await
    }

    async fn finish(&self, pid: &str, envelope: &Envelope, reason: &str) -> Result<(), FlowError> {
        self.client.terminate_process(pid, reason).await?;
        self.store.delete(&envelope.envelope_id).await?;
        Ok(())
    }
}

fn reusable(record: &ProcessRecord, envelope: &Envelope) -> bool {
    let same_user = record.user_id.is_empty() || record.user_id == envelope.context.user_id;
    same_user && matches!(record.state, ProcessState::New | ProcessState::Ready)
}
