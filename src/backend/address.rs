//! `host:port` addresses of the live backend.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::SelectorError;

/// Address of the live beacon server used when nothing is persisted.
pub const DEFAULT_SERVER_ADDRESS: &str = "192.168.61.162:5000";

/// A validated `host:port` pair. IPv6 hosts must be bracketed (`[::1]:5000`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn parse(s: &str) -> Result<Self, SelectorError> {
        let invalid = || SelectorError::InvalidAddress(s.to_string());
        let s = s.trim();

        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }

        let valid_host = if let Some(inner) = host.strip_prefix('[') {
            inner.strip_suffix(']').is_some_and(|h| !h.is_empty() && h.contains(':'))
        } else {
            !host.is_empty()
                && !host.contains(':')
                && host
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
        };
        if !valid_host {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Base URL for HTTP requests, e.g. `http://192.168.61.162:5000`.
    pub fn http_base(&self) -> String {
        format!("http://{}", self)
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self {
            host: "192.168.61.162".to_string(),
            port: 5000,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// The live server address as seen by every live source.
///
/// Owned by the backend selector, which is the only writer; sources read it
/// on each request so a committed change applies to the next operation.
#[derive(Debug, Clone, Default)]
pub struct SharedAddress(Arc<RwLock<ServerAddress>>);

impl SharedAddress {
    pub fn new(address: ServerAddress) -> Self {
        Self(Arc::new(RwLock::new(address)))
    }

    pub fn get(&self) -> ServerAddress {
        self.0.read().clone()
    }

    pub(crate) fn set(&self, address: ServerAddress) {
        *self.0.write() = address;
    }
}
