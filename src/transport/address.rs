//! Remote address resolution.
//!
//! A [`RemoteAddress`] is a host string and port resolved lazily through the
//! platform resolver. The first successful lookup is cached.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::net::lookup_host;
use tracing::debug;

use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddress {
    host: String,
    port: u16,
    resolved: Option<SocketAddr>,
}

impl RemoteAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            resolved: None,
        }
    }

    /// Parse "host:port" (IPv6 hosts in brackets, e.g. "[::1]:9000")
    pub fn parse(address: &str) -> Result<Self> {
        let invalid = || ProtocolError::ConfigError(format!("Invalid address: '{address}'"));
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The cached resolution, if `resolve` succeeded before
    pub fn resolved(&self) -> Option<SocketAddr> {
        self.resolved
    }

    /// Resolve to a socket address, caching the first result.
    pub async fn resolve(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.resolved {
            return Ok(addr);
        }
        let addr = lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                ProtocolError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("No addresses for {}", self.host),
                ))
            })?;
        debug!(host=%self.host, %addr, "Resolved remote address");
        self.resolved = Some(addr);
        Ok(addr)
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for RemoteAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            resolved: Some(addr),
        }
    }
}
