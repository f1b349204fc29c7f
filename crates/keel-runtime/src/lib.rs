//! Keel runtime: flow orchestration glue over the kernel client.
//!
//! Envelopes carry conversational state through orchestration passes; a pass
//! may suspend on a clarification or confirmation and later be resumed with
//! the envelope id as token. [`FlowService`] keeps the kernel process in step
//! with the envelope and meters usage through [`FlowContext`].

pub mod capability;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod envelope;
pub mod flow_service;
pub mod interrupt;
pub mod orchestrator;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_store;

pub use capability::{
    Capability, CapabilityRegistry, CapabilityRegistryBuilder, RegistryError, ServiceConfig,
};
pub use checkpoint::{FlowCheckpoint, FlowStore, FlowStoreError, InMemoryFlowStore};
pub use config::{ConfigError, FlowStoreBackend, KernelBackend, RuntimeConfig};
pub use context::{default_session_id, generate_request_id, RequestContext};
pub use envelope::{Envelope, EnvelopeError, EnvelopeStatus, TerminalReason, INTEGRATION_OUTPUT};
pub use flow_service::{FlowError, FlowService};
pub use interrupt::{FlowInterrupt, InterruptId, InterruptKind, InterruptStatus};
pub use orchestrator::{FlowContext, FlowOutcome, OrchestrationError, Orchestrator};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_store::SqliteFlowStore;
