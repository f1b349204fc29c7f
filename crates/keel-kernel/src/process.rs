//! Process model: the shape of kernel process records.
//!
//! Records and usage counters are owned by the kernel. The client only ever
//! holds point-in-time snapshots decoded from kernel responses.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::identity::Pid;
use crate::quota::QuotaOverrides;

/// Lifecycle state of a kernel process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Blocked,
    Terminated,
}

impl ProcessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::New => "NEW",
            ProcessState::Ready => "READY",
            ProcessState::Running => "RUNNING",
            ProcessState::Blocked => "BLOCKED",
            ProcessState::Terminated => "TERMINATED",
        }
    }

    /// TERMINATED is final; nothing but reads may follow it.
    pub fn is_terminal(self) -> bool {
        self == ProcessState::Terminated
    }
}

/// Scheduling priority, fixed at creation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
        }
    }
}

/// Cumulative resource counters for one process.
///
/// Used both as the kernel's cumulative snapshot and as the delta passed to
/// `RecordUsage`; the kernel applies the delta and returns the new total.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceUsage {
    pub llm_calls: u64,
    pub tool_calls: u64,
    pub agent_hops: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl ResourceUsage {
    /// Delta for one LLM call.
    pub fn llm_call(tokens_in: u64, tokens_out: u64) -> Self {
        Self {
            llm_calls: 1,
            tokens_in,
            tokens_out,
            ..Self::default()
        }
    }

    /// Delta for one tool call.
    pub fn tool_call() -> Self {
        Self {
            tool_calls: 1,
            ..Self::default()
        }
    }

    /// Delta for one agent hop.
    pub fn agent_hop() -> Self {
        Self {
            agent_hops: 1,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Counter-wise saturating sum.
    pub fn saturating_add(&self, delta: &ResourceUsage) -> Self {
        Self {
            llm_calls: self.llm_calls.saturating_add(delta.llm_calls),
            tool_calls: self.tool_calls.saturating_add(delta.tool_calls),
            agent_hops: self.agent_hops.saturating_add(delta.agent_hops),
            tokens_in: self.tokens_in.saturating_add(delta.tokens_in),
            tokens_out: self.tokens_out.saturating_add(delta.tokens_out),
        }
    }
}

/// Snapshot of one kernel process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: Pid,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub session_id: String,
    pub state: ProcessState,
    #[serde(default)]
    pub priority: Priority,
    /// Advisory label of the stage currently executing. The kernel sends `""`
    /// when no stage is set.
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub current_stage: Option<String>,
    #[serde(default)]
    pub usage: ResourceUsage,
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.is_empty()))
}

/// Arguments for `CreateProcess`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub pid: Pid,
    pub request_id: String,
    pub user_id: String,
    pub session_id: String,
    pub priority: Priority,
    pub quota: QuotaOverrides,
}

impl ProcessSpec {
    pub fn new(pid: impl Into<Pid>) -> Self {
        Self {
            pid: pid.into(),
            ..Self::default()
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_quota(mut self, quota: QuotaOverrides) -> Self {
        self.quota = quota;
        self
    }

    /// Flat argument map for the wire; only present quota overrides are sent.
    pub fn to_args(&self) -> Value {
        let mut args = Map::new();
        args.insert("pid".into(), Value::String(self.pid.clone()));
        args.insert("request_id".into(), Value::String(self.request_id.clone()));
        args.insert("user_id".into(), Value::String(self.user_id.clone()));
        args.insert("session_id".into(), Value::String(self.session_id.clone()));
        args.insert(
            "priority".into(),
            Value::String(self.priority.as_str().to_string()),
        );
        for (key, value) in self.quota.entries() {
            args.insert(key.to_string(), Value::from(value));
        }
        Value::Object(args)
    }
}
