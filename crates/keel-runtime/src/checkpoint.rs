//! Flow checkpoints: suspended envelopes persisted across the resume boundary,
//! keyed by the resume token (`envelope_id`).

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::Envelope;

/// Everything needed to re-enter a suspended flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowCheckpoint {
    pub token: String,
    pub pid: String,
    pub capability: String,
    pub envelope: Envelope,
    pub suspended_at: DateTime<Utc>,
}

impl FlowCheckpoint {
    pub fn new(pid: impl Into<String>, capability: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            token: envelope.envelope_id.clone(),
            pid: pid.into(),
            capability: capability.into(),
            envelope,
            suspended_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FlowStoreError {
    #[error("flow store error: {0}")]
    Store(String),
    #[error("flow checkpoint serialization error: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Saves a checkpoint. Overwrites any existing checkpoint for the token.
    async fn save(&self, checkpoint: &FlowCheckpoint) -> Result<(), FlowStoreError>;

    async fn load(&self, token: &str) -> Result<Option<FlowCheckpoint>, FlowStoreError>;

    /// Removes and returns the checkpoint in one step, so only one resume can
    /// claim a token.
    async fn take(&self, token: &str) -> Result<Option<FlowCheckpoint>, FlowStoreError>;

    /// No-op for unknown tokens.
    async fn delete(&self, token: &str) -> Result<(), FlowStoreError>;
}

/// In-memory flow store (one checkpoint per token).
#[derive(Debug, Default)]
pub struct InMemoryFlowStore {
    by_token: RwLock<HashMap<String, FlowCheckpoint>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_token.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn save(&self, checkpoint: &FlowCheckpoint) -> Result<(), FlowStoreError> {
        let mut guard = self
            .by_token
            .write()
            .map_err(|e| FlowStoreError::Store(e.to_string()))?;
        guard.insert(checkpoint.token.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, token: &str) -> Result<Option<FlowCheckpoint>, FlowStoreError> {
        let guard = self
            .by_token
            .read()
            .map_err(|e| FlowStoreError::Store(e.to_string()))?;
        Ok(guard.get(token).cloned())
    }

    async fn take(&self, token: &str) -> Result<Option<FlowCheckpoint>, FlowStoreError> {
        let mut guard = self
            .by_token
            .write()
            .map_err(|e| FlowStoreError::Store(e.to_string()))?;
        Ok(guard.remove(token))
    }

    async fn delete(&self, token: &str) -> Result<(), FlowStoreError> {
        let mut guard = self
            .by_token
            .write()
            .map_err(|e| FlowStoreError::Store(e.to_string()))?;
        guard.remove(token);
        Ok(())
    }
}
