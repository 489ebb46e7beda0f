//! Server catalog
//!
//! Discovery and latency testing happen elsewhere; the connection core
//! only reads the current list through [`ServerCatalog`].

use crate::server::{ServerDescriptor, ServerId};
use async_trait::async_trait;
use std::sync::RwLock;
use tracing::debug;

/// Source of candidate servers
#[async_trait]
pub trait ServerCatalog: Send + Sync {
    /// Current candidates, in catalog order
    async fn servers(&self) -> Vec<ServerDescriptor>;
}

/// Catalog over a fixed list, updated in place by a latency tester
#[derive(Debug, Default)]
pub struct StaticCatalog {
    servers: RwLock<Vec<ServerDescriptor>>,
}

impl StaticCatalog {
    pub fn new(servers: Vec<ServerDescriptor>) -> Self {
        Self {
            servers: RwLock::new(servers),
        }
    }

    pub fn replace(&self, servers: Vec<ServerDescriptor>) {
        *self.servers.write().unwrap() = servers;
    }

    /// Record a latency measurement; returns false for unknown ids
    pub fn update_latency(&self, id: &ServerId, latency_ms: Option<u32>) -> bool {
        let mut servers = self.servers.write().unwrap();
        match servers.iter_mut().find(|s| &s.id == id) {
            Some(server) => {
                debug!("Latency of {}: {:?}", id, latency_ms);
                server.latency_ms = latency_ms;
                true
            }
            None => false,
        }
    }

    /// Mark one server as the user's choice (or clear it with `None`)
    pub fn mark_selected(&self, id: Option<&ServerId>) {
        for server in self.servers.write().unwrap().iter_mut() {
            server.selected = Some(&server.id) == id;
        }
    }

    pub fn len(&self) -> usize {
        self.servers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ServerCatalog for StaticCatalog {
    async fn servers(&self) -> Vec<ServerDescriptor> {
        self.servers.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: &str) -> ServerDescriptor {
        ServerDescriptor::new(id, id, "DE", "10.1.1.1".parse().unwrap(), 443)
    }

    #[tokio::test]
    async fn test_update_latency() {
        let catalog = StaticCatalog::new(vec![server("a"), server("b")]);

        assert!(catalog.update_latency(&ServerId::from("b"), Some(42)));
        assert!(!catalog.update_latency(&ServerId::from("zz"), Some(1)));

        let servers = catalog.servers().await;
        assert_eq!(servers[0].latency_ms, None);
        assert_eq!(servers[1].latency_ms, Some(42));
    }

    #[tokio::test]
    async fn test_mark_selected() {
        let catalog = StaticCatalog::new(vec![server("a"), server("b")]);

        catalog.mark_selected(Some(&ServerId::from("a")));
        let servers = catalog.servers().await;
        assert!(servers[0].selected);
        assert!(!servers[1].selected);

        catalog.mark_selected(None);
        assert!(catalog.servers().await.iter().all(|s| !s.selected));
    }
}
