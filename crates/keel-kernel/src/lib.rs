//! Keel kernel client.
//!
//! Transport contract to the process kernel, the typed client façade built on
//! it, and the value types of kernel responses (process records, usage,
//! quota and rate-limit verdicts). [`InMemoryKernel`] answers the same
//! contract in-process for standalone mode and tests.

pub mod address;
pub mod client;
pub mod identity;
pub mod in_memory;
pub mod process;
pub mod quota;
pub mod rate_limit;
pub mod tcp_transport;
pub mod transport;

pub use address::{AddressError, KernelAddress, DEFAULT_KERNEL_HOST, DEFAULT_KERNEL_PORT};
pub use client::{ClientError, KernelClient};
pub use identity::{KernelMethod, Pid, KERNEL_NAMESPACE};
pub use in_memory::InMemoryKernel;
pub use process::{Priority, ProcessRecord, ProcessSpec, ProcessState, ResourceUsage};
pub use quota::{QuotaCheckResult, QuotaLimits, QuotaOverrides};
pub use rate_limit::{RateLimitConfig, RateLimitPolicy, RateLimitResult};
pub use tcp_transport::{serve_connection, TcpTransport, DEFAULT_REQUEST_TIMEOUT};
pub use transport::{
    Transport, TransportError, TransportErrorKind, TransportStream, WireError, WireRequest,
    WireResponse,
};
