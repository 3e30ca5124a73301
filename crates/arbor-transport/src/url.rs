//! Node URLs of the form `scheme:host:port`.

use std::fmt;
use std::str::FromStr;

use crate::TransportError;

/// A parsed `scheme:host:port` address.
///
/// The scheme selects the transport that understands the address
/// (`arbor-tcp` for [`TcpTransport`](crate::TcpTransport)).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl NodeUrl {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port`, suitable for socket address resolution.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Scheme part of a URL string, without validating the rest.
pub fn scheme_of(url: &str) -> Option<&str> {
    url.split(':').next().filter(|s| !s.is_empty())
}

impl FromStr for NodeUrl {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(TransportError::MalformedUrl(s.to_string()));
        }
        let port = parts[2]
            .parse::<u16>()
            .map_err(|_| TransportError::MalformedUrl(s.to_string()))?;
        Ok(Self::new(parts[0], parts[1], port))
    }
}

impl fmt::Display for NodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.scheme, self.host, self.port)
    }
}
