//! Capability registry: capability id to orchestrator and service settings.
//!
//! Populated once through [`CapabilityRegistryBuilder`] before serving
//! traffic; the built [`CapabilityRegistry`] is immutable and cheap to clone.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestrator::Orchestrator;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Mutating actions wait for an explicit user confirmation.
    pub requires_confirmation: bool,
    pub is_readonly: bool,
}

#[derive(Clone)]
pub struct Capability {
    pub id: String,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub service: ServiceConfig,
}

impl Capability {
    pub fn new(id: impl Into<String>, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            id: id.into(),
            orchestrator,
            service: ServiceConfig::default(),
        }
    }

    pub fn with_service(mut self, service: ServiceConfig) -> Self {
        self.service = service;
        self
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("id", &self.id)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("capability already registered: {0}")]
    Duplicate(String),
    #[error("Unknown capability: {0}")]
    Unknown(String),
    #[error("capability is required when multiple capabilities are registered")]
    Ambiguous(Vec<String>),
    #[error("no capabilities registered")]
    Empty,
}

#[derive(Default)]
pub struct CapabilityRegistryBuilder {
    capabilities: BTreeMap<String, Capability>,
}

impl CapabilityRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, capability: Capability) -> Result<Self, RegistryError> {
        if self.capabilities.contains_key(&capability.id) {
            return Err(RegistryError::Duplicate(capability.id));
        }
        log::info!(
            "capability_registered id={} requires_confirmation={} readonly={}",
            capability.id,
            capability.service.requires_confirmation,
            capability.service.is_readonly
        );
        self.capabilities.insert(capability.id.clone(), capability);
        Ok(self)
    }

    pub fn build(self) -> CapabilityRegistry {
        CapabilityRegistry {
            capabilities: Arc::new(self.capabilities),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CapabilityRegistry {
    capabilities: Arc<BTreeMap<String, Capability>>,
}

impl CapabilityRegistry {
    pub fn builder() -> CapabilityRegistryBuilder {
        CapabilityRegistryBuilder::new()
    }

    pub fn get(&self, id: &str) -> Option<&Capability> {
        self.capabilities.get(id)
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        self.capabilities.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// The requested capability, or the only registered one when none is
    /// requested.
    pub fn resolve(&self, requested: Option<&str>) -> Result<&Capability, RegistryError> {
        match requested.filter(|id| !id.is_empty()) {
            Some(id) => self
                .get(id)
                .ok_or_else(|| RegistryError::Unknown(id.to_string())),
            None => {
                let mut all = self.capabilities.values();
                match (all.next(), all.next()) {
                    (Some(only), None) => Ok(only),
                    (None, _) => Err(RegistryError::Empty),
                    (Some(_), Some(_)) => Err(RegistryError::Ambiguous(self.ids())),
                }
            }
        }
    }
}
