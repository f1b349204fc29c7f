//! Orchestrator seam: the boundary between flow glue and capability logic.
//!
//! Orchestrators see the kernel only through [`FlowContext`], which meters
//! billable steps against the process quota.

use async_trait::async_trait;
use keel_kernel::{ClientError, KernelClient, QuotaCheckResult};
use serde_json::Value;
use thiserror::Error;

use crate::capability::ServiceConfig;
use crate::context::RequestContext;
use crate::envelope::{Envelope, TerminalReason};
use crate::interrupt::FlowInterrupt;

/// How one orchestration pass ended.
#[derive(Clone, Debug, PartialEq)]
pub enum FlowOutcome {
    Completed { final_response: Value },
    Suspend(FlowInterrupt),
    Failed { reason: TerminalReason, message: String },
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error(transparent)]
    Kernel(#[from] ClientError),
    #[error("{}: {message}", .reason.as_str())]
    Failed {
        reason: TerminalReason,
        message: String,
    },
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Runs until the flow completes, fails, or needs external input.
    ///
    /// On re-entry after a resume, `ctx.resume_data()` carries the answer and
    /// the envelope still holds everything recorded before the suspension.
    async fn run(
        &self,
        envelope: &mut Envelope,
        ctx: &FlowContext,
    ) -> Result<FlowOutcome, OrchestrationError>;
}

/// Per-pass handle given to an orchestrator.
#[derive(Clone, Debug)]
pub struct FlowContext {
    client: KernelClient,
    pid: String,
    request: RequestContext,
    service: ServiceConfig,
    resume_data: Option<Value>,
}

impl FlowContext {
    pub fn new(client: KernelClient, pid: impl Into<String>, request: RequestContext) -> Self {
        Self {
            client,
            pid: pid.into(),
            request,
            service: ServiceConfig::default(),
            resume_data: None,
        }
    }

    pub fn with_service(mut self, service: ServiceConfig) -> Self {
        self.service = service;
        self
    }

    pub fn with_resume_data(mut self, resume_data: Value) -> Self {
        self.resume_data = Some(resume_data);
        self
    }

    pub fn pid(&self) -> &str {
        &self.pid
    }

    pub fn request(&self) -> &RequestContext {
        &self.request
    }

    pub fn service(&self) -> &ServiceConfig {
        &self.service
    }

    /// Answer supplied by the resume that started this pass.
    pub fn resume_data(&self) -> Option<&Value> {
        self.resume_data.as_ref()
    }

    pub async fn charge_llm_call(
        &self,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Result<(), OrchestrationError> {
        let verdict = self
            .client
            .record_llm_call(&self.pid, tokens_in, tokens_out)
            .await?;
        into_charge(verdict)
    }

    pub async fn charge_tool_call(&self) -> Result<(), OrchestrationError> {
        into_charge(self.client.record_tool_call(&self.pid).await?)
    }

    pub async fn charge_agent_hop(&self) -> Result<(), OrchestrationError> {
        into_charge(self.client.record_agent_hop(&self.pid).await?)
    }

    pub async fn quota(&self) -> Result<QuotaCheckResult, OrchestrationError> {
        Ok(self.client.check_quota(&self.pid).await?)
    }
}

fn into_charge(verdict: Option<String>) -> Result<(), OrchestrationError> {
    match verdict {
        Some(reason) => Err(OrchestrationError::QuotaExceeded(reason)),
        None => Ok(()),
    }
}
