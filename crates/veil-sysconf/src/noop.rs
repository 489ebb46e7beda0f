//! Backends for platforms without system proxy / adapter DNS support.
//!
//! Every call succeeds and reads report nothing, so the connection state
//! machine behaves identically everywhere.

use crate::adapter::{DnsSource, ForwardRule, NetworkAdapterConfigurator, PortForwarder};
use crate::error::Result;
use crate::store::{ConfigKey, ConfigValue, SystemConfigStore};
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

#[async_trait]
impl SystemConfigStore for NoopStore {
    async fn get(&self, _key: &ConfigKey) -> Result<Option<ConfigValue>> {
        Ok(None)
    }

    async fn set(&self, _key: &ConfigKey, _value: &ConfigValue) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _key: &ConfigKey) -> Result<()> {
        Ok(())
    }

    async fn list(&self, _group: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn delete_group(&self, _group: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAdapters;

#[async_trait]
impl NetworkAdapterConfigurator for NoopAdapters {
    async fn active_adapters(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn dns_source(&self, _adapter: &str) -> Result<DnsSource> {
        Ok(DnsSource::Automatic)
    }

    async fn set_dns_source(&self, _adapter: &str, _source: &DnsSource) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl PortForwarder for NoopAdapters {
    async fn add_forward(&self, _rule: &ForwardRule) -> Result<()> {
        Ok(())
    }

    async fn remove_forward(&self, _rule: &ForwardRule) -> Result<()> {
        Ok(())
    }
}
