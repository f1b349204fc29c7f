//! In-process kernel: a [`Transport`] that answers the `"kernel"` namespace
//! from local tables.
//!
//! Used for standalone mode (no remote kernel configured) and as the authority
//! behind scenario tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::identity::{KernelMethod, Pid, KERNEL_NAMESPACE};
use crate::process::{Priority, ProcessRecord, ProcessState, ResourceUsage};
use crate::quota::{QuotaLimits, QuotaOverrides};
use crate::rate_limit::{RateLimitPolicy, SlidingWindowLimiter};
use crate::transport::{Transport, TransportError};

struct ProcessEntry {
    record: ProcessRecord,
    limits: QuotaLimits,
}

#[derive(Default)]
struct ReadyQueue {
    high: VecDeque<Pid>,
    normal: VecDeque<Pid>,
    low: VecDeque<Pid>,
}

impl ReadyQueue {
    fn push(&mut self, pid: Pid, priority: Priority) {
        match priority {
            Priority::High => self.high.push_back(pid),
            Priority::Normal => self.normal.push_back(pid),
            Priority::Low => self.low.push_back(pid),
        }
    }

    fn pop(&mut self) -> Option<Pid> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn remove(&mut self, pid: &str) {
        for queue in [&mut self.high, &mut self.normal, &mut self.low] {
            queue.retain(|p| p != pid);
        }
    }
}

#[derive(Default)]
struct KernelTable {
    processes: HashMap<Pid, ProcessEntry>,
    ready: ReadyQueue,
    limiter: SlidingWindowLimiter,
    default_limits: QuotaLimits,
}

pub struct InMemoryKernel {
    table: Mutex<KernelTable>,
}

impl Default for InMemoryKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKernel {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(KernelTable {
                limiter: SlidingWindowLimiter::new(RateLimitPolicy::default()),
                ..KernelTable::default()
            }),
        }
    }

    /// Replaces the ceilings applied to processes created without overrides.
    pub fn with_default_quota(self, limits: QuotaLimits) -> Self {
        if let Ok(mut table) = self.table.lock() {
            table.default_limits = limits;
        }
        self
    }

    pub fn with_rate_limits(self, policy: RateLimitPolicy) -> Self {
        if let Ok(mut table) = self.table.lock() {
            table.limiter = SlidingWindowLimiter::new(policy);
        }
        self
    }

    /// Number of processes ever created, terminated ones included.
    pub fn process_count(&self) -> usize {
        self.table.lock().map(|t| t.processes.len()).unwrap_or(0)
    }

    fn dispatch(&self, method: KernelMethod, args: &Value) -> Result<Value, TransportError> {
        let mut table = self
            .table
            .lock()
            .map_err(|e| TransportError::internal(format!("kernel table poisoned: {e}")))?;
        match method {
            KernelMethod::CreateProcess => table.create(args),
            KernelMethod::GetProcess => {
                let pid = pid_arg(args)?;
                encode(&table.entry(pid)?.record)
            }
            KernelMethod::ScheduleProcess => table.schedule(pid_arg(args)?),
            KernelMethod::GetNextRunnable => table.next_runnable(),
            KernelMethod::TransitionState => table.transition(args),
            KernelMethod::TerminateProcess => {
                let reason = args.get("reason").and_then(Value::as_str).unwrap_or("");
                table.terminate(pid_arg(args)?, reason)
            }
            KernelMethod::RecordUsage => {
                let delta: ResourceUsage = decode_args(args)?;
                table.record_usage(pid_arg(args)?, &delta)
            }
            KernelMethod::CheckQuota => {
                let entry = table.entry(pid_arg(args)?)?;
                encode(&entry.limits.evaluate(&entry.record.usage))
            }
            KernelMethod::CheckRateLimit => {
                let user_id = str_arg(args, "user_id")?;
                let endpoint = str_arg(args, "endpoint")?;
                let result = table.limiter.check(user_id, endpoint, Instant::now());
                encode(&result)
            }
        }
    }
}

impl KernelTable {
    fn entry(&self, pid: &str) -> Result<&ProcessEntry, TransportError> {
        self.processes
            .get(pid)
            .ok_or_else(|| TransportError::not_found(format!("process {pid} not found")))
    }

    /// Live (non-terminated) entry for a mutation.
    fn live_entry(&mut self, pid: &str) -> Result<&mut ProcessEntry, TransportError> {
        let entry = self
            .processes
            .get_mut(pid)
            .ok_or_else(|| TransportError::not_found(format!("process {pid} not found")))?;
        if entry.record.state.is_terminal() {
            return Err(TransportError::invalid_argument(format!(
                "process {pid} is terminated"
            )));
        }
        Ok(entry)
    }

    fn create(&mut self, args: &Value) -> Result<Value, TransportError> {
        let pid = pid_arg(args)?.to_string();
        if self.processes.contains_key(&pid) {
            return Err(TransportError::invalid_argument(format!(
                "process {pid} already exists"
            )));
        }
        let priority = match args.get("priority") {
            None | Some(Value::Null) => Priority::default(),
            Some(value) => decode_args(value)?,
        };
        let overrides: QuotaOverrides = decode_args(args)?;
        let record = ProcessRecord {
            pid: pid.clone(),
            request_id: opt_str(args, "request_id"),
            user_id: opt_str(args, "user_id"),
            session_id: opt_str(args, "session_id"),
            state: ProcessState::New,
            priority,
            current_stage: None,
            usage: ResourceUsage::default(),
        };
        let limits = self.default_limits.apply(&overrides);
        let value = encode(&record)?;
        self.processes
            .insert(pid.clone(), ProcessEntry { record, limits });
        log::debug!("kernel_create pid={pid} priority={}", priority.as_str());
        Ok(value)
    }

    fn schedule(&mut self, pid: &str) -> Result<Value, TransportError> {
        let entry = self.live_entry(pid)?;
        match entry.record.state {
            ProcessState::New => {
                entry.record.state = ProcessState::Ready;
                let priority = entry.record.priority;
                let value = encode(&entry.record)?;
                self.ready.push(pid.to_string(), priority);
                Ok(value)
            }
            ProcessState::Ready => encode(&entry.record),
            other => Err(TransportError::invalid_argument(format!(
                "cannot schedule process {pid} in state {}",
                other.as_str()
            ))),
        }
    }

    fn next_runnable(&mut self) -> Result<Value, TransportError> {
        while let Some(pid) = self.ready.pop() {
            if let Some(entry) = self.processes.get_mut(&pid) {
                if entry.record.state == ProcessState::Ready {
                    entry.record.state = ProcessState::Running;
                    return encode(&entry.record);
                }
            }
        }
        Ok(json!({ "pid": "" }))
    }

    fn transition(&mut self, args: &Value) -> Result<Value, TransportError> {
        let pid = pid_arg(args)?;
        let target: ProcessState = match args.get("new_state") {
            Some(value) => decode_args(value)?,
            None => return Err(TransportError::invalid_argument("missing new_state")),
        };
        let entry = self.live_entry(pid)?;
        let from = entry.record.state;
        let allowed = matches!(
            (from, target),
            (ProcessState::Ready, ProcessState::Running)
                | (ProcessState::Running, ProcessState::Blocked)
                | (ProcessState::Blocked, ProcessState::Running)
                | (ProcessState::Blocked, ProcessState::Ready)
        );
        if !allowed {
            return Err(TransportError::invalid_argument(format!(
                "invalid transition {} -> {} for process {pid}",
                from.as_str(),
                target.as_str()
            )));
        }
        entry.record.state = target;
        let priority = entry.record.priority;
        let value = encode(&entry.record)?;
        match target {
            ProcessState::Ready => self.ready.push(pid.to_string(), priority),
            ProcessState::Running => self.ready.remove(pid),
            _ => {}
        }
        Ok(value)
    }

    fn terminate(&mut self, pid: &str, reason: &str) -> Result<Value, TransportError> {
        let entry = self.live_entry(pid)?;
        entry.record.state = ProcessState::Terminated;
        let value = encode(&entry.record)?;
        self.ready.remove(pid);
        log::debug!("kernel_terminate pid={pid} reason={reason}");
        Ok(value)
    }

    fn record_usage(&mut self, pid: &str, delta: &ResourceUsage) -> Result<Value, TransportError> {
        let entry = self.live_entry(pid)?;
        entry.record.usage = entry.record.usage.saturating_add(delta);
        encode(&entry.record.usage)
    }
}

fn decode_args<T: DeserializeOwned>(args: &Value) -> Result<T, TransportError> {
    T::deserialize(args).map_err(|e| TransportError::invalid_argument(e.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, TransportError> {
    serde_json::to_value(value).map_err(|e| TransportError::internal(e.to_string()))
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, TransportError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| TransportError::invalid_argument(format!("missing {key}")))
}

fn pid_arg(args: &Value) -> Result<&str, TransportError> {
    let pid = str_arg(args, "pid")?;
    if pid.is_empty() {
        return Err(TransportError::invalid_argument("empty pid"));
    }
    Ok(pid)
}

fn opt_str(args: &Value, key: &str) -> String {
    args.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl Transport for InMemoryKernel {
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
        if namespace != KERNEL_NAMESPACE {
            return Err(TransportError::invalid_argument(format!(
                "unknown namespace {namespace}"
            )));
        }
        let method = KernelMethod::from_wire(method)
            .ok_or_else(|| TransportError::invalid_argument(format!("unknown method {method}")))?;
        self.dispatch(method, &args)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::client::KernelClient;
    use crate::process::ProcessSpec;
    use crate::rate_limit::RateLimitConfig;
    use crate::transport::TransportErrorKind;

    fn client() -> KernelClient {
        KernelClient::new(Arc::new(InMemoryKernel::new()))
    }

    #[tokio::test]
    async fn create_then_get_is_new() {
        let client = client();
        client
            .create_process(&ProcessSpec::new("P").with_request_id("req-P"))
            .await
            .unwrap();
        let record = client.get_process("P").await.unwrap().unwrap();
        assert_eq!(record.pid, "P");
        assert_eq!(record.state, ProcessState::New);
        assert_eq!(record.request_id, "req-P");
    }

    #[tokio::test]
    async fn unknown_pid_reads_as_none() {
        assert!(client().get_process("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_create_is_invalid_argument() {
        let client = client();
        client.create_process(&ProcessSpec::new("P")).await.unwrap();
        let err = client.create_process(&ProcessSpec::new("P")).await.unwrap_err();
        assert_eq!(err.transport_kind(), Some(TransportErrorKind::InvalidArgument));
    }

    #[tokio::test]
    async fn three_llm_calls_accumulate() {
        let client = client();
        client
            .create_process(&ProcessSpec::new("req-1"))
            .await
            .unwrap();
        for _ in 0..3 {
            assert_eq!(client.record_llm_call("req-1", 100, 50).await.unwrap(), None);
        }
        let verdict = client.check_quota("req-1").await.unwrap();
        assert!(verdict.within_bounds);
        assert_eq!(verdict.usage.llm_calls, 3);
        assert_eq!(verdict.usage.tokens_in, 300);
        assert_eq!(verdict.usage.tokens_out, 150);
    }

    #[tokio::test]
    async fn quota_override_trips_first_dimension() {
        let client = client();
        client
            .create_process(&ProcessSpec::new("P").with_quota(QuotaOverrides {
                max_llm_calls: Some(1),
                ..QuotaOverrides::default()
            }))
            .await
            .unwrap();
        assert_eq!(client.record_llm_call("P", 1, 1).await.unwrap(), None);
        assert_eq!(
            client.record_llm_call("P", 1, 1).await.unwrap().as_deref(),
            Some("max_llm_calls exceeded")
        );
    }

    #[tokio::test]
    async fn ready_queue_serves_high_priority_first() {
        let client = client();
        for (pid, priority) in [
            ("low", Priority::Low),
            ("normal", Priority::Normal),
            ("high", Priority::High),
        ] {
            client
                .create_process(&ProcessSpec::new(pid).with_priority(priority))
                .await
                .unwrap();
            client.schedule_process(pid).await.unwrap();
        }
        let order: Vec<String> = [
            client.get_next_runnable().await.unwrap(),
            client.get_next_runnable().await.unwrap(),
            client.get_next_runnable().await.unwrap(),
        ]
        .into_iter()
        .map(|r| r.unwrap().pid)
        .collect();
        assert_eq!(order, vec!["high", "normal", "low"]);
        assert!(client.get_next_runnable().await.unwrap().is_none());
        let high = client.get_process("high").await.unwrap().unwrap();
        assert_eq!(high.state, ProcessState::Running);
    }

    #[tokio::test]
    async fn blocked_round_trip_and_terminal_state_is_final() {
        let client = client();
        client.create_process(&ProcessSpec::new("P")).await.unwrap();
        client.schedule_process("P").await.unwrap();
        client.get_next_runnable().await.unwrap();
        let blocked = client
            .transition_state("P", ProcessState::Blocked, "waiting")
            .await
            .unwrap();
        assert_eq!(blocked.state, ProcessState::Blocked);
        client
            .transition_state("P", ProcessState::Running, "resumed")
            .await
            .unwrap();
        let done = client.terminate_process("P", "completed").await.unwrap();
        assert_eq!(done.state, ProcessState::Terminated);

        let err = client
            .transition_state("P", ProcessState::Running, "again")
            .await
            .unwrap_err();
        assert_eq!(err.transport_kind(), Some(TransportErrorKind::InvalidArgument));
        let err = client.record_tool_call("P").await.unwrap_err();
        assert_eq!(err.method(), Some(KernelMethod::RecordUsage));

        let last = client.get_process("P").await.unwrap().unwrap();
        assert_eq!(last.state, ProcessState::Terminated);
    }

    #[tokio::test]
    async fn new_process_cannot_block() {
        let client = client();
        client.create_process(&ProcessSpec::new("P")).await.unwrap();
        let err = client
            .transition_state("P", ProcessState::Blocked, "too early")
            .await
            .unwrap_err();
        assert_eq!(err.transport_kind(), Some(TransportErrorKind::InvalidArgument));
    }

    #[tokio::test]
    async fn rate_limit_scenario_reports_remaining() {
        let kernel = InMemoryKernel::new()
            .with_rate_limits(RateLimitPolicy::new(RateLimitConfig::per_minute(100)));
        let client = KernelClient::new(Arc::new(kernel));
        for _ in 0..90 {
            client
                .check_rate_limit("user-1", "/api/v1/requests")
                .await
                .unwrap();
        }
        let result = client
            .check_rate_limit("user-1", "/api/v1/requests")
            .await
            .unwrap();
        assert!(result.allowed);
        assert_eq!(result.limit, 100);
        assert_eq!(result.remaining, 10);
    }

    #[tokio::test]
    async fn unknown_namespace_and_method_are_rejected() {
        let kernel = InMemoryKernel::new();
        let err = kernel
            .request("scheduler", "GetProcess", json!({"pid": "P"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::InvalidArgument);
        let err = kernel
            .request("kernel", "ForkProcess", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::InvalidArgument);
    }
}
