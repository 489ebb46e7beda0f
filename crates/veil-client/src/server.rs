//! Upstream server descriptors

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Stable server identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One upstream server as reported by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub id: ServerId,
    /// Display name
    pub name: String,
    /// Location code (e.g. `DE`, `JP`)
    pub location: String,
    pub ip: IpAddr,
    pub port: u16,
    /// Last measured latency; `None` until tested
    #[serde(default)]
    pub latency_ms: Option<u32>,
    /// Marked as the user's choice by the catalog
    #[serde(default)]
    pub selected: bool,
}

impl ServerDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        location: impl Into<String>,
        ip: IpAddr,
        port: u16,
    ) -> Self {
        Self {
            id: ServerId::new(id),
            name: name.into(),
            location: location.into(),
            ip,
            port,
            latency_ms: None,
            selected: false,
        }
    }

    pub fn with_latency(mut self, latency_ms: u32) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Latency used for ranking; untested servers rank last
    pub fn rank_latency(&self) -> u32 {
        self.latency_ms.unwrap_or(u32::MAX)
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.name, self.location, self.endpoint())?;
        match self.latency_ms {
            Some(ms) => write!(f, " {}ms", ms),
            None => write!(f, " untested"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_display() {
        let server =
            ServerDescriptor::new("de-1", "Frankfurt", "DE", "185.186.78.1".parse().unwrap(), 443);
        assert_eq!(server.to_string(), "Frankfurt [DE] 185.186.78.1:443 untested");
        assert_eq!(server.rank_latency(), u32::MAX);

        let server = server.with_latency(32);
        assert!(server.to_string().ends_with("32ms"));
    }

    #[test]
    fn test_descriptor_defaults_from_json() {
        let json = r#"{"id":"jp-1","name":"Tokyo","location":"JP","ip":"103.231.88.1","port":443}"#;
        let server: ServerDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(server.id, ServerId::from("jp-1"));
        assert_eq!(server.latency_ms, None);
        assert!(!server.selected);
    }
}
