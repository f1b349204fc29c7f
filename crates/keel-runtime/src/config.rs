//! Runtime backend selection from `KEEL_*` environment variables.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use keel_kernel::{InMemoryKernel, KernelAddress, KernelClient, QuotaOverrides, TcpTransport, Transport};
use thiserror::Error;

use crate::checkpoint::{FlowStore, InMemoryFlowStore};

pub const DEFAULT_SQLITE_DB: &str = "keel_flows.db";
pub const DEFAULT_KERNEL_TIMEOUT_MS: u64 = 5000;

const ENV_KEYS: [&str; 11] = [
    "KEEL_KERNEL_BACKEND",
    "KEEL_KERNEL_ADDRESS",
    "KEEL_KERNEL_TIMEOUT_MS",
    "KEEL_MAX_LLM_CALLS",
    "KEEL_MAX_TOOL_CALLS",
    "KEEL_MAX_AGENT_HOPS",
    "KEEL_MAX_INPUT_TOKENS",
    "KEEL_MAX_OUTPUT_TOKENS",
    "KEEL_FLOW_STORE",
    "KEEL_SQLITE_DB",
    "KEEL_SERVER_ADDR",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}='{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0}")]
    Unsupported(String),
    #[error("flow store startup failed: {0}")]
    Startup(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelBackend {
    /// Remote kernel over TCP.
    Remote,
    /// In-process kernel (standalone mode).
    Memory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowStoreBackend {
    Memory,
    Sqlite,
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub kernel_backend: KernelBackend,
    pub kernel_address: KernelAddress,
    pub kernel_timeout: Duration,
    pub quota: QuotaOverrides,
    pub flow_store: FlowStoreBackend,
    pub sqlite_db_path: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kernel_backend: KernelBackend::Remote,
            kernel_address: KernelAddress::default(),
            kernel_timeout: Duration::from_millis(DEFAULT_KERNEL_TIMEOUT_MS),
            quota: QuotaOverrides::default(),
            flow_store: FlowStoreBackend::Memory,
            sqlite_db_path: DEFAULT_SQLITE_DB.to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(&collect_env())
    }

    pub fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let kernel_backend = match lowered(envs, "KEEL_KERNEL_BACKEND").as_deref() {
            None | Some("remote") => KernelBackend::Remote,
            Some("memory") => KernelBackend::Memory,
            Some(other) => {
                return Err(invalid(
                    "KEEL_KERNEL_BACKEND",
                    other,
                    "expected one of: remote, memory",
                ))
            }
        };
        let kernel_address = match trimmed(envs, "KEEL_KERNEL_ADDRESS") {
            Some(raw) => KernelAddress::parse(&raw)
                .map_err(|e| invalid("KEEL_KERNEL_ADDRESS", &raw, &e.to_string()))?,
            None => KernelAddress::default(),
        };
        let kernel_timeout = Duration::from_millis(
            parse_u64(envs, "KEEL_KERNEL_TIMEOUT_MS")?.unwrap_or(DEFAULT_KERNEL_TIMEOUT_MS),
        );
        if kernel_timeout.is_zero() {
            return Err(invalid("KEEL_KERNEL_TIMEOUT_MS", "0", "must be positive"));
        }
        let quota = QuotaOverrides {
            max_llm_calls: parse_u64(envs, "KEEL_MAX_LLM_CALLS")?,
            max_tool_calls: parse_u64(envs, "KEEL_MAX_TOOL_CALLS")?,
            max_agent_hops: parse_u64(envs, "KEEL_MAX_AGENT_HOPS")?,
            max_input_tokens: parse_u64(envs, "KEEL_MAX_INPUT_TOKENS")?,
            max_output_tokens: parse_u64(envs, "KEEL_MAX_OUTPUT_TOKENS")?,
        };
        let flow_store = match lowered(envs, "KEEL_FLOW_STORE").as_deref() {
            None | Some("memory") => FlowStoreBackend::Memory,
            Some("sqlite") => FlowStoreBackend::Sqlite,
            Some(other) => {
                return Err(invalid(
                    "KEEL_FLOW_STORE",
                    other,
                    "expected one of: memory, sqlite",
                ))
            }
        };
        let sqlite_db_path =
            trimmed(envs, "KEEL_SQLITE_DB").unwrap_or_else(|| DEFAULT_SQLITE_DB.to_string());

        Ok(Self {
            kernel_backend,
            kernel_address,
            kernel_timeout,
            quota,
            flow_store,
            sqlite_db_path,
        })
    }

    pub fn build_transport(&self) -> Arc<dyn Transport> {
        match self.kernel_backend {
            KernelBackend::Remote => Arc::new(TcpTransport::with_timeout(
                self.kernel_address.clone(),
                self.kernel_timeout,
            )),
            KernelBackend::Memory => Arc::new(InMemoryKernel::new()),
        }
    }

    pub fn build_client(&self) -> KernelClient {
        KernelClient::new(self.build_transport())
    }

    pub fn build_flow_store(&self) -> Result<Arc<dyn FlowStore>, ConfigError> {
        match self.flow_store {
            FlowStoreBackend::Memory => Ok(Arc::new(InMemoryFlowStore::new())),
            FlowStoreBackend::Sqlite => self.sqlite_flow_store(),
        }
    }

    #[cfg(feature = "sqlite-persistence")]
    fn sqlite_flow_store(&self) -> Result<Arc<dyn FlowStore>, ConfigError> {
        let store = crate::sqlite_store::SqliteFlowStore::open(&self.sqlite_db_path).map_err(|e| {
            ConfigError::Startup(format!("KEEL_SQLITE_DB='{}': {}", self.sqlite_db_path, e))
        })?;
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "sqlite-persistence"))]
    fn sqlite_flow_store(&self) -> Result<Arc<dyn FlowStore>, ConfigError> {
        Err(ConfigError::Unsupported(
            "KEEL_FLOW_STORE=sqlite requires feature 'sqlite-persistence'. Rebuild with --features \"sqlite-persistence\"."
                .to_string(),
        ))
    }
}

/// Snapshot of the `KEEL_*` variables this crate and the server read.
pub fn collect_env() -> HashMap<String, String> {
    let mut envs = HashMap::new();
    for key in ENV_KEYS {
        if let Ok(value) = std::env::var(key) {
            envs.insert(key.to_string(), value);
        }
    }
    envs
}

fn trimmed(envs: &HashMap<String, String>, key: &str) -> Option<String> {
    envs.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn lowered(envs: &HashMap<String, String>, key: &str) -> Option<String> {
    trimmed(envs, key).map(|v| v.to_ascii_lowercase())
}

fn parse_u64(envs: &HashMap<String, String>, key: &'static str) -> Result<Option<u64>, ConfigError> {
    trimmed(envs, key)
        .map(|raw| {
            raw.parse::<u64>()
                .map_err(|e| invalid(key, &raw, &e.to_string()))
        })
        .transpose()
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn envs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_to_remote_kernel_and_memory_store() {
        let cfg = RuntimeConfig::from_env_map(&HashMap::new()).expect("parse default config");
        assert_eq!(cfg.kernel_backend, KernelBackend::Remote);
        assert_eq!(cfg.kernel_address.to_string(), "127.0.0.1:50051");
        assert_eq!(cfg.kernel_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.flow_store, FlowStoreBackend::Memory);
        assert_eq!(cfg.sqlite_db_path, DEFAULT_SQLITE_DB);
        assert!(cfg.quota.is_empty());
    }

    #[test]
    fn parses_backend_address_and_quota() {
        let cfg = RuntimeConfig::from_env_map(&envs(&[
            ("KEEL_KERNEL_BACKEND", " Memory "),
            ("KEEL_KERNEL_ADDRESS", "kernel.svc"),
            ("KEEL_KERNEL_TIMEOUT_MS", "250"),
            ("KEEL_MAX_LLM_CALLS", "25"),
            ("KEEL_MAX_OUTPUT_TOKENS", "8192"),
            ("KEEL_FLOW_STORE", "sqlite"),
            ("KEEL_SQLITE_DB", "/tmp/flows.db"),
        ]))
        .expect("parse config");
        assert_eq!(cfg.kernel_backend, KernelBackend::Memory);
        assert_eq!(cfg.kernel_address.host, "kernel.svc");
        assert_eq!(cfg.kernel_address.port, 50051);
        assert_eq!(cfg.kernel_timeout, Duration::from_millis(250));
        assert_eq!(cfg.quota.max_llm_calls, Some(25));
        assert_eq!(cfg.quota.max_output_tokens, Some(8192));
        assert_eq!(cfg.quota.max_tool_calls, None);
        assert_eq!(cfg.flow_store, FlowStoreBackend::Sqlite);
        assert_eq!(cfg.sqlite_db_path, "/tmp/flows.db");
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = RuntimeConfig::from_env_map(&envs(&[("KEEL_KERNEL_BACKEND", "grpc")]))
            .unwrap_err();
        assert!(err.to_string().contains("KEEL_KERNEL_BACKEND"));

        let err = RuntimeConfig::from_env_map(&envs(&[("KEEL_MAX_AGENT_HOPS", "-1")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "KEEL_MAX_AGENT_HOPS", .. }));

        let err = RuntimeConfig::from_env_map(&envs(&[("KEEL_KERNEL_ADDRESS", "host:port")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "KEEL_KERNEL_ADDRESS", .. }));

        let err = RuntimeConfig::from_env_map(&envs(&[("KEEL_KERNEL_TIMEOUT_MS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "KEEL_KERNEL_TIMEOUT_MS", .. }));
    }

    #[tokio::test]
    async fn memory_backend_builds_a_working_client() {
        let cfg = RuntimeConfig::from_env_map(&envs(&[("KEEL_KERNEL_BACKEND", "memory")]))
            .expect("parse config");
        let client = cfg.build_client();
        assert!(client.get_process("nobody").await.unwrap().is_none());
        assert!(cfg.build_flow_store().is_ok());
    }

    #[cfg(not(feature = "sqlite-persistence"))]
    #[test]
    fn sqlite_store_requires_feature() {
        let cfg = RuntimeConfig::from_env_map(&envs(&[("KEEL_FLOW_STORE", "sqlite")]))
            .expect("parse config");
        assert!(matches!(
            cfg.build_flow_store().err(),
            Some(ConfigError::Unsupported(_))
        ));
    }
}
