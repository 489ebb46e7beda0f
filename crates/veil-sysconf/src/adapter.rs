//! Network Adapter and Port Forwarding Interfaces

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};

/// Where an adapter gets its DNS servers from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "servers", rename_all = "lowercase")]
pub enum DnsSource {
    /// Assigned by DHCP / router advertisement
    Automatic,
    /// Fixed, ordered server list
    Static(Vec<IpAddr>),
}

impl DnsSource {
    /// Static source pointing at a single server
    pub fn single(addr: impl Into<IpAddr>) -> Self {
        DnsSource::Static(vec![addr.into()])
    }

    pub fn is_automatic(&self) -> bool {
        matches!(self, DnsSource::Automatic)
    }
}

impl fmt::Display for DnsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsSource::Automatic => write!(f, "automatic"),
            DnsSource::Static(servers) => {
                let list: Vec<String> = servers.iter().map(|s| s.to_string()).collect();
                write!(f, "static [{}]", list.join(", "))
            }
        }
    }
}

/// A TCP port-forward rule (IPv4 to IPv4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub listen: SocketAddrV4,
    pub connect: SocketAddrV4,
}

impl ForwardRule {
    /// Forward `listen_port` to `connect_port`, both on the same address
    pub fn local(addr: Ipv4Addr, listen_port: u16, connect_port: u16) -> Self {
        Self {
            listen: SocketAddrV4::new(addr, listen_port),
            connect: SocketAddrV4::new(addr, connect_port),
        }
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.listen, self.connect)
    }
}

/// Per-adapter DNS configuration
#[async_trait]
pub trait NetworkAdapterConfigurator: Send + Sync {
    /// Names of adapters that are currently up
    async fn active_adapters(&self) -> Result<Vec<String>>;

    /// Current DNS source of an adapter
    async fn dns_source(&self, adapter: &str) -> Result<DnsSource>;

    /// Replace an adapter's DNS source
    async fn set_dns_source(&self, adapter: &str, source: &DnsSource) -> Result<()>;

    /// Flush the resolver cache and re-register with DNS
    async fn flush_resolver_cache(&self) -> Result<()> {
        Ok(())
    }
}

/// Port forwarding primitive
#[async_trait]
pub trait PortForwarder: Send + Sync {
    async fn add_forward(&self, rule: &ForwardRule) -> Result<()>;

    /// Remove a rule; removing a rule that does not exist succeeds
    async fn remove_forward(&self, rule: &ForwardRule) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_source_display() {
        let src = DnsSource::Static(vec!["8.8.8.8".parse().unwrap(), "1.1.1.1".parse().unwrap()]);
        assert_eq!(src.to_string(), "static [8.8.8.8, 1.1.1.1]");
        assert_eq!(DnsSource::Automatic.to_string(), "automatic");
    }

    #[test]
    fn test_dns_source_json_roundtrip() {
        let src = DnsSource::single(Ipv4Addr::LOCALHOST);
        let json = serde_json::to_string(&src).unwrap();
        assert_eq!(serde_json::from_str::<DnsSource>(&json).unwrap(), src);

        let auto = serde_json::to_string(&DnsSource::Automatic).unwrap();
        assert_eq!(auto, r#"{"source":"automatic"}"#);
    }

    #[test]
    fn test_forward_rule() {
        let rule = ForwardRule::local(Ipv4Addr::LOCALHOST, 53, 5353);
        assert_eq!(rule.to_string(), "127.0.0.1:53 -> 127.0.0.1:5353");
    }
}
