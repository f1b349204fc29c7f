//! Kernel address parsing (`host:port`).

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const DEFAULT_KERNEL_HOST: &str = "127.0.0.1";
pub const DEFAULT_KERNEL_PORT: u16 = 50051;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid kernel port {port:?} in address {address:?}")]
    InvalidPort { address: String, port: String },
}

/// Resolved kernel endpoint. Missing parts fall back to the defaults.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KernelAddress {
    pub host: String,
    pub port: u16,
}

impl Default for KernelAddress {
    fn default() -> Self {
        Self {
            host: DEFAULT_KERNEL_HOST.to_string(),
            port: DEFAULT_KERNEL_PORT,
        }
    }
}

impl KernelAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }

        let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
            // [v6] or [v6]:port
            match rest.split_once(']') {
                Some((host, tail)) => (host, tail.strip_prefix(':')),
                None => (rest, None),
            }
        } else if raw.matches(':').count() > 1 {
            // bare IPv6 literal, no port
            (raw, None)
        } else {
            match raw.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (raw, None),
            }
        };

        let host = if host.is_empty() {
            DEFAULT_KERNEL_HOST.to_string()
        } else {
            host.to_string()
        };
        let port = match port {
            None | Some("") => DEFAULT_KERNEL_PORT,
            Some(port) => port.parse().map_err(|_| AddressError::InvalidPort {
                address: raw.to_string(),
                port: port.to_string(),
            })?,
        };
        Ok(Self { host, port })
    }

    /// Form accepted by `tokio::net::TcpStream::connect`.
    pub fn socket_target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for KernelAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for KernelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socket_target())
    }
}
