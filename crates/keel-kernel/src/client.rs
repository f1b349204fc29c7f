//! Typed client façade over a kernel [`Transport`].
//!
//! The client holds no state besides the shared transport handle: every call
//! is one round trip (the `record_*` helpers are two) and nothing is cached.
//! Calls are never retried here. A retried `RecordUsage` may be applied twice
//! by the kernel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

use crate::address::KernelAddress;
use crate::identity::{KernelMethod, KERNEL_NAMESPACE};
use crate::process::{Priority, ProcessRecord, ProcessSpec, ProcessState, ResourceUsage};
use crate::quota::{QuotaCheckResult, QuotaOverrides};
use crate::rate_limit::RateLimitResult;
use crate::tcp_transport::TcpTransport;
use crate::transport::{Transport, TransportError, TransportErrorKind};

/// Pid read by [`KernelClient::ping`]; never created.
const PING_PID: &str = "keel-ping";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{method} failed: {source}")]
    Call {
        method: KernelMethod,
        source: TransportError,
    },
    #[error("{method} returned a malformed response: {message}")]
    Decode {
        method: KernelMethod,
        message: String,
    },
    #[error("kernel connection error: {0}")]
    Connection(TransportError),
}

impl ClientError {
    pub fn method(&self) -> Option<KernelMethod> {
        match self {
            ClientError::Call { method, .. } | ClientError::Decode { method, .. } => Some(*method),
            ClientError::Connection(_) => None,
        }
    }

    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            ClientError::Call { source, .. } => Some(source.kind),
            ClientError::Connection(err) => Some(err.kind),
            ClientError::Decode { .. } => None,
        }
    }

    /// The kernel could not be reached or did not answer in time.
    pub fn is_unavailable(&self) -> bool {
        self.transport_kind().is_some_and(TransportErrorKind::is_transient)
    }
}

#[derive(Clone)]
pub struct KernelClient {
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for KernelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelClient").finish_non_exhaustive()
    }
}

impl KernelClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Client over a TCP transport to `address`, each call bounded by `timeout`.
    pub fn tcp(address: KernelAddress, timeout: Duration) -> Self {
        Self::new(Arc::new(TcpTransport::with_timeout(address, timeout)))
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.transport.connect().await.map_err(ClientError::Connection)
    }

    pub async fn close(&self) -> Result<(), ClientError> {
        self.transport.close().await.map_err(ClientError::Connection)
    }

    /// Connects and round-trips a read, so a dead cached connection is
    /// noticed rather than reported as healthy.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.connect().await?;
        self.get_process(PING_PID).await.map(|_| ())
    }

    async fn call_raw(&self, method: KernelMethod, args: Value) -> Result<Value, ClientError> {
        self.transport
            .request(KERNEL_NAMESPACE, method.as_str(), args)
            .await
            .map_err(|source| ClientError::Call { method, source })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: KernelMethod,
        args: Value,
    ) -> Result<T, ClientError> {
        let result = self.call_raw(method, args).await?;
        decode(method, result)
    }

    pub async fn create_process(&self, spec: &ProcessSpec) -> Result<ProcessRecord, ClientError> {
        let record: ProcessRecord = self.call(KernelMethod::CreateProcess, spec.to_args()).await?;
        log::info!(
            "kernel_process_created pid={} request_id={} priority={}",
            record.pid,
            record.request_id,
            record.priority.as_str()
        );
        Ok(record)
    }

    /// Positional form of [`KernelClient::create_process`].
    pub async fn create(
        &self,
        pid: &str,
        request_id: &str,
        user_id: &str,
        session_id: &str,
        priority: Priority,
        quota: Option<QuotaOverrides>,
    ) -> Result<ProcessRecord, ClientError> {
        let spec = ProcessSpec::new(pid)
            .with_request_id(request_id)
            .with_user(user_id)
            .with_session(session_id)
            .with_priority(priority)
            .with_quota(quota.unwrap_or_default());
        self.create_process(&spec).await
    }

    /// `None` when the kernel reports the pid as not found.
    pub async fn get_process(&self, pid: &str) -> Result<Option<ProcessRecord>, ClientError> {
        match self.call(KernelMethod::GetProcess, json!({ "pid": pid })).await {
            Ok(record) => Ok(Some(record)),
            Err(ClientError::Call { source, .. }) if source.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn schedule_process(&self, pid: &str) -> Result<ProcessRecord, ClientError> {
        self.call(KernelMethod::ScheduleProcess, json!({ "pid": pid }))
            .await
    }

    /// `None` when the kernel answers with the empty-pid sentinel.
    pub async fn get_next_runnable(&self) -> Result<Option<ProcessRecord>, ClientError> {
        let method = KernelMethod::GetNextRunnable;
        let result = self.call_raw(method, json!({})).await?;
        let empty = result
            .get("pid")
            .and_then(Value::as_str)
            .map_or(true, str::is_empty);
        if empty {
            return Ok(None);
        }
        decode(method, result).map(Some)
    }

    pub async fn transition_state(
        &self,
        pid: &str,
        new_state: ProcessState,
        reason: &str,
    ) -> Result<ProcessRecord, ClientError> {
        self.call(
            KernelMethod::TransitionState,
            json!({ "pid": pid, "new_state": new_state.as_str(), "reason": reason }),
        )
        .await
    }

    pub async fn terminate_process(
        &self,
        pid: &str,
        reason: &str,
    ) -> Result<ProcessRecord, ClientError> {
        self.call(
            KernelMethod::TerminateProcess,
            json!({ "pid": pid, "reason": reason }),
        )
        .await
    }

    /// Applies `delta` and returns the kernel's new cumulative usage.
    pub async fn record_usage(
        &self,
        pid: &str,
        delta: &ResourceUsage,
    ) -> Result<ResourceUsage, ClientError> {
        let method = KernelMethod::RecordUsage;
        let mut args = serde_json::to_value(delta).map_err(|e| ClientError::Decode {
            method,
            message: e.to_string(),
        })?;
        if let Value::Object(map) = &mut args {
            map.insert("pid".to_string(), Value::String(pid.to_string()));
        }
        self.call(method, args).await
    }

    pub async fn check_quota(&self, pid: &str) -> Result<QuotaCheckResult, ClientError> {
        self.call(KernelMethod::CheckQuota, json!({ "pid": pid })).await
    }

    pub async fn check_rate_limit(
        &self,
        user_id: &str,
        endpoint: &str,
    ) -> Result<RateLimitResult, ClientError> {
        let result: RateLimitResult = self
            .call(
                KernelMethod::CheckRateLimit,
                json!({ "user_id": user_id, "endpoint": endpoint }),
            )
            .await?;
        if !result.allowed {
            log::warn!(
                "rate_limit_refused user_id={user_id} endpoint={endpoint} limit_type={} retry_after_seconds={}",
                result.limit_type,
                result.retry_after_seconds
            );
        }
        Ok(result)
    }

    /// Records one LLM call, then checks quota. Returns the exceeded reason,
    /// or `None` when still within bounds.
    pub async fn record_llm_call(
        &self,
        pid: &str,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Result<Option<String>, ClientError> {
        self.record_then_check(pid, ResourceUsage::llm_call(tokens_in, tokens_out))
            .await
    }

    pub async fn record_tool_call(&self, pid: &str) -> Result<Option<String>, ClientError> {
        self.record_then_check(pid, ResourceUsage::tool_call()).await
    }

    pub async fn record_agent_hop(&self, pid: &str) -> Result<Option<String>, ClientError> {
        self.record_then_check(pid, ResourceUsage::agent_hop()).await
    }

    async fn record_then_check(
        &self,
        pid: &str,
        delta: ResourceUsage,
    ) -> Result<Option<String>, ClientError> {
        self.record_usage(pid, &delta).await?;
        let verdict = self.check_quota(pid).await?;
        match verdict.exceeded() {
            Some(reason) => {
                log::warn!("quota_exceeded pid={pid} reason={reason}");
                Ok(Some(reason.to_string()))
            }
            None => Ok(None),
        }
    }
}

fn decode<T: DeserializeOwned>(method: KernelMethod, value: Value) -> Result<T, ClientError> {
    serde_json::from_value(value).map_err(|e| ClientError::Decode {
        method,
        message: e.to_string(),
    })
}
