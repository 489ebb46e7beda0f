//! In-memory backends
//!
//! Used by tests and dry runs. Both types keep an operation log so
//! callers can assert on ordering and on the absence of interleaved
//! writes.

use crate::adapter::{DnsSource, ForwardRule, NetworkAdapterConfigurator, PortForwarder};
use crate::error::{Result, SysConfError};
use crate::store::{ConfigKey, ConfigValue, SystemConfigStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type Groups = BTreeMap<String, BTreeMap<String, ConfigValue>>;

/// Config store held in process memory
#[derive(Default)]
pub struct MemoryStore {
    groups: Mutex<Groups>,
    /// Keys (display form) whose writes are rejected
    rejected: Mutex<HashSet<String>>,
    /// Mutations in the order they were applied
    log: Mutex<Vec<String>>,
    refreshes: AtomicUsize,
    fail_refresh: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a value in place without logging it (test setup)
    pub fn seed(&self, key: &ConfigKey, value: ConfigValue) {
        let mut groups = self.groups.lock().unwrap();
        groups
            .entry(key.group.clone())
            .or_default()
            .insert(key.name.clone(), value);
    }

    /// Synchronous read for assertions
    pub fn value(&self, key: &ConfigKey) -> Option<ConfigValue> {
        let groups = self.groups.lock().unwrap();
        groups.get(&key.group).and_then(|g| g.get(&key.name)).cloned()
    }

    pub fn contains(&self, key: &ConfigKey) -> bool {
        self.value(key).is_some()
    }

    /// Number of values in a group
    pub fn group_len(&self, group: &str) -> usize {
        let groups = self.groups.lock().unwrap();
        groups.get(group).map(|g| g.len()).unwrap_or(0)
    }

    /// Make every `set`/`delete` of `key` fail
    pub fn reject_writes(&self, key: &ConfigKey) {
        self.rejected.lock().unwrap().insert(key.to_string());
    }

    /// Undo [`MemoryStore::reject_writes`] for all keys
    pub fn accept_all_writes(&self) {
        self.rejected.lock().unwrap().clear();
    }

    /// Make `refresh` fail
    pub fn fail_refresh(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::Relaxed);
    }

    /// Snapshot of the mutation log (`set <key>`, `delete <key>`, ...)
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn check_writable(&self, key: &ConfigKey) -> Result<()> {
        if self.rejected.lock().unwrap().contains(&key.to_string()) {
            return Err(SysConfError::WriteRejected(key.to_string()));
        }
        Ok(())
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl SystemConfigStore for MemoryStore {
    async fn get(&self, key: &ConfigKey) -> Result<Option<ConfigValue>> {
        Ok(self.value(key))
    }

    async fn set(&self, key: &ConfigKey, value: &ConfigValue) -> Result<()> {
        self.check_writable(key)?;
        self.seed(key, value.clone());
        self.record(format!("set {}", key));
        Ok(())
    }

    async fn delete(&self, key: &ConfigKey) -> Result<()> {
        self.check_writable(key)?;
        {
            let mut groups = self.groups.lock().unwrap();
            if let Some(group) = groups.get_mut(&key.group) {
                group.remove(&key.name);
                if group.is_empty() {
                    groups.remove(&key.group);
                }
            }
        }
        self.record(format!("delete {}", key));
        Ok(())
    }

    async fn list(&self, group: &str) -> Result<Vec<String>> {
        let groups = self.groups.lock().unwrap();
        Ok(groups
            .get(group)
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_group(&self, group: &str) -> Result<()> {
        self.groups.lock().unwrap().remove(group);
        self.record(format!("delete-group {}", group));
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        if self.fail_refresh.load(Ordering::Relaxed) {
            return Err(SysConfError::ToolFailed {
                tool: "refresh",
                stderr: "injected failure".into(),
            });
        }
        Ok(())
    }
}

/// Adapters and forwarding rules held in process memory
#[derive(Default)]
pub struct MemoryAdapters {
    adapters: Mutex<BTreeMap<String, DnsSource>>,
    /// Adapters that exist but are not reported by enumeration
    hidden: AtomicBool,
    /// Adapters whose DNS cannot be changed
    locked: Mutex<HashSet<String>>,
    rules: Mutex<Vec<ForwardRule>>,
    log: Mutex<Vec<String>>,
    flushes: AtomicUsize,
}

impl MemoryAdapters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with the given adapters already present
    pub fn with_adapters<I, S>(adapters: I) -> Self
    where
        I: IntoIterator<Item = (S, DnsSource)>,
        S: Into<String>,
    {
        let this = Self::new();
        for (name, source) in adapters {
            this.add_adapter(name, source);
        }
        this
    }

    pub fn add_adapter(&self, name: impl Into<String>, source: DnsSource) {
        self.adapters.lock().unwrap().insert(name.into(), source);
    }

    /// Hide all adapters from enumeration (simulates an empty listing)
    pub fn hide_from_enumeration(&self, hidden: bool) {
        self.hidden.store(hidden, Ordering::Relaxed);
    }

    /// Make DNS writes to `name` fail
    pub fn lock_adapter(&self, name: &str) {
        self.locked.lock().unwrap().insert(name.to_string());
    }

    /// Synchronous read for assertions
    pub fn source_of(&self, name: &str) -> Option<DnsSource> {
        self.adapters.lock().unwrap().get(name).cloned()
    }

    /// Currently installed forwarding rules
    pub fn rules(&self) -> Vec<ForwardRule> {
        self.rules.lock().unwrap().clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl NetworkAdapterConfigurator for MemoryAdapters {
    async fn active_adapters(&self) -> Result<Vec<String>> {
        if self.hidden.load(Ordering::Relaxed) {
            return Ok(Vec::new());
        }
        Ok(self.adapters.lock().unwrap().keys().cloned().collect())
    }

    async fn dns_source(&self, adapter: &str) -> Result<DnsSource> {
        self.source_of(adapter)
            .ok_or_else(|| SysConfError::NotFound(adapter.to_string()))
    }

    async fn set_dns_source(&self, adapter: &str, source: &DnsSource) -> Result<()> {
        if self.locked.lock().unwrap().contains(adapter) {
            return Err(SysConfError::WriteRejected(adapter.to_string()));
        }
        {
            let mut adapters = self.adapters.lock().unwrap();
            match adapters.get_mut(adapter) {
                Some(current) => *current = source.clone(),
                None => return Err(SysConfError::NotFound(adapter.to_string())),
            }
        }
        self.record(format!("dns {} {}", adapter, source));
        Ok(())
    }

    async fn flush_resolver_cache(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.record("flush".to_string());
        Ok(())
    }
}

#[async_trait]
impl PortForwarder for MemoryAdapters {
    async fn add_forward(&self, rule: &ForwardRule) -> Result<()> {
        {
            let mut rules = self.rules.lock().unwrap();
            if rules.iter().any(|r| r.listen == rule.listen) {
                return Err(SysConfError::ToolFailed {
                    tool: "portproxy",
                    stderr: format!("{} already forwarded", rule.listen),
                });
            }
            rules.push(*rule);
        }
        self.record(format!("forward add {}", rule));
        Ok(())
    }

    async fn remove_forward(&self, rule: &ForwardRule) -> Result<()> {
        self.rules.lock().unwrap().retain(|r| r.listen != rule.listen);
        self.record(format!("forward remove {}", rule));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_store_set_get_delete() {
        let store = MemoryStore::new();
        let key = ConfigKey::new("G", "A");

        assert_eq!(store.get(&key).await.unwrap(), None);
        store.set(&key, &ConfigValue::Dword(7)).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(ConfigValue::Dword(7)));

        store.delete(&key).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);

        // Deleting again is fine
        store.delete(&key).await.unwrap();
        assert_eq!(store.log(), vec!["set G\\A", "delete G\\A", "delete G\\A"]);
    }

    #[tokio::test]
    async fn test_store_rejected_write() {
        let store = MemoryStore::new();
        let key = ConfigKey::new("G", "A");
        store.reject_writes(&key);

        assert!(store.set(&key, &ConfigValue::Dword(1)).await.is_err());
        assert!(store.log().is_empty());

        store.accept_all_writes();
        assert!(store.set(&key, &ConfigValue::Dword(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_store_groups() {
        let store = MemoryStore::new();
        store.seed(&ConfigKey::new("G", "a"), ConfigValue::text("1"));
        store.seed(&ConfigKey::new("G", "b"), ConfigValue::text("2"));

        assert_eq!(store.list("G").await.unwrap(), vec!["a", "b"]);
        assert!(store.list("missing").await.unwrap().is_empty());

        store.delete_group("G").await.unwrap();
        assert_eq!(store.group_len("G"), 0);
    }

    #[tokio::test]
    async fn test_adapters_enumeration() {
        let adapters = MemoryAdapters::with_adapters([("Ethernet", DnsSource::Automatic)]);
        assert_eq!(adapters.active_adapters().await.unwrap(), vec!["Ethernet"]);

        adapters.hide_from_enumeration(true);
        assert!(adapters.active_adapters().await.unwrap().is_empty());

        // Still reachable by name
        assert!(adapters.dns_source("Ethernet").await.is_ok());
        assert!(adapters.dns_source("Wi-Fi").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_forward_rules() {
        let adapters = MemoryAdapters::new();
        let rule = ForwardRule::local(Ipv4Addr::LOCALHOST, 53, 5353);

        adapters.add_forward(&rule).await.unwrap();
        assert!(adapters.add_forward(&rule).await.is_err());
        assert_eq!(adapters.rules(), vec![rule]);

        adapters.remove_forward(&rule).await.unwrap();
        adapters.remove_forward(&rule).await.unwrap();
        assert!(adapters.rules().is_empty());
    }
}
