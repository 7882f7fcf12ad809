//! Named endpoints.
//!
//! Accepted forms:
//! - `tcp://host:port`
//! - `unix:///path/to/socket` (Unix only)
//! - `host:port` or bare `host` (TCP, port defaults to [`DEFAULT_PORT`])

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::KorvError;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 8022;

/// Where to listen or connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix(path.into())
    }
}

impl FromStr for Endpoint {
    type Err = KorvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(KorvError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::unix(path));
        }

        let address = s.strip_prefix("tcp://").unwrap_or(s);
        if address.is_empty() || address.contains("://") {
            return Err(KorvError::InvalidEndpoint(s.to_string()));
        }

        // `[::1]:8022` style IPv6 literals keep their brackets as the host.
        match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && (!host.contains(':') || host.ends_with(']')) => {
                let port = port
                    .parse()
                    .map_err(|_| KorvError::InvalidEndpoint(s.to_string()))?;
                Ok(Endpoint::tcp(host, port))
            }
            Some(_) if !address.starts_with('[') => Err(KorvError::InvalidEndpoint(s.to_string())),
            _ => Ok(Endpoint::tcp(address, DEFAULT_PORT)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}
