//! Identity types for the Keel kernel client.
//!
//! Pid identifies one logical in-flight request; KernelMethod names the IPC
//! methods served under the `"kernel"` namespace.

use std::fmt;

/// Client-assigned process identifier (one per logical request).
pub type Pid = String;

/// IPC namespace every kernel method is served under.
pub const KERNEL_NAMESPACE: &str = "kernel";

/// Methods of the kernel IPC contract, one per façade operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KernelMethod {
    CreateProcess,
    GetProcess,
    ScheduleProcess,
    GetNextRunnable,
    TransitionState,
    TerminateProcess,
    RecordUsage,
    CheckQuota,
    CheckRateLimit,
}

impl KernelMethod {
    pub const ALL: [KernelMethod; 9] = [
        KernelMethod::CreateProcess,
        KernelMethod::GetProcess,
        KernelMethod::ScheduleProcess,
        KernelMethod::GetNextRunnable,
        KernelMethod::TransitionState,
        KernelMethod::TerminateProcess,
        KernelMethod::RecordUsage,
        KernelMethod::CheckQuota,
        KernelMethod::CheckRateLimit,
    ];

    /// Wire name of the method.
    pub fn as_str(self) -> &'static str {
        match self {
            KernelMethod::CreateProcess => "CreateProcess",
            KernelMethod::GetProcess => "GetProcess",
            KernelMethod::ScheduleProcess => "ScheduleProcess",
            KernelMethod::GetNextRunnable => "GetNextRunnable",
            KernelMethod::TransitionState => "TransitionState",
            KernelMethod::TerminateProcess => "TerminateProcess",
            KernelMethod::RecordUsage => "RecordUsage",
            KernelMethod::CheckQuota => "CheckQuota",
            KernelMethod::CheckRateLimit => "CheckRateLimit",
        }
    }

    /// Looks up a method by its wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }
}

impl fmt::Display for KernelMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        for method in KernelMethod::ALL {
            assert_eq!(KernelMethod::from_wire(method.as_str()), Some(method));
        }
        assert_eq!(KernelMethod::from_wire("DeleteProcess"), None);
    }
}
