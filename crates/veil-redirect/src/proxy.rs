//! System HTTP Proxy Redirection
//!
//! Points the OS proxy settings at the local proxy process and puts them
//! back afterwards.
//!
//! # Backup protocol
//!
//! ```text
//! enable():  for each key
//!              shadow exists?  yes -> keep it (a previous enable owns it)
//!                              no  -> shadow = current value | WasAbsent
//!              key = proxy value
//!            refresh, read back, compare
//!
//! disable(): for each key
//!              shadow exists?  yes -> key = original | delete key
//!                                     then delete shadow
//!                              no  -> ProxyEnable = 0 (safety net)
//!            refresh
//! ```
//!
//! The shadow is removed only after its original has been written back,
//! so an interrupted `disable` is finished by the next recovery scan.

use crate::backup::{BackupRecord, INTERNET_SETTINGS};
use crate::error::{RedirectError, RedirectWarning, RestoreOutcome, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use veil_sysconf::{ConfigKey, ConfigValue, SystemConfigStore};

/// Proxy enabled flag (`REG_DWORD`)
pub const PROXY_ENABLE: &str = "ProxyEnable";
/// `host:port` of the proxy (`REG_SZ`)
pub const PROXY_SERVER: &str = "ProxyServer";
/// `;`-separated bypass list (`REG_SZ`)
pub const PROXY_OVERRIDE: &str = "ProxyOverride";

/// Every key `enable` touches, in write order
pub const PROXY_KEYS: [&str; 3] = [PROXY_ENABLE, PROXY_SERVER, PROXY_OVERRIDE];

/// Addresses that should never go through the proxy
const DEFAULT_BYPASS: &[&str] = &[
    "localhost",
    "127.*",
    "10.*",
    "172.16.*", "172.17.*", "172.18.*", "172.19.*",
    "172.20.*", "172.21.*", "172.22.*", "172.23.*",
    "172.24.*", "172.25.*", "172.26.*", "172.27.*",
    "172.28.*", "172.29.*", "172.30.*", "172.31.*",
    "192.168.*",
    "<local>",
];

/// What the proxy settings are set to while redirected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    /// `host:port` of the local proxy
    pub server: String,
    /// Hosts that bypass the proxy
    pub bypass: Vec<String>,
}

impl ProxySettings {
    /// Local proxy on the loopback interface
    pub fn loopback(port: u16) -> Self {
        Self {
            server: format!("127.0.0.1:{}", port),
            bypass: Self::default_bypass(),
        }
    }

    pub fn default_bypass() -> Vec<String> {
        DEFAULT_BYPASS.iter().map(|s| s.to_string()).collect()
    }

    fn bypass_value(&self) -> String {
        self.bypass.join(";")
    }
}

/// Enables and disables OS proxy redirection with backup/restore
pub struct SystemNetworkRedirector {
    store: Arc<dyn SystemConfigStore>,
    settings: ProxySettings,
    group: String,
}

impl SystemNetworkRedirector {
    pub fn new(store: Arc<dyn SystemConfigStore>, settings: ProxySettings) -> Self {
        Self {
            store,
            settings,
            group: INTERNET_SETTINGS.to_string(),
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// Key of one of the proxy values
    pub fn key(&self, name: &str) -> ConfigKey {
        ConfigKey::new(self.group.clone(), name)
    }

    fn desired(&self) -> [(ConfigKey, ConfigValue); 3] {
        [
            (self.key(PROXY_ENABLE), ConfigValue::Dword(1)),
            (self.key(PROXY_SERVER), ConfigValue::text(&self.settings.server)),
            (self.key(PROXY_OVERRIDE), ConfigValue::text(self.settings.bypass_value())),
        ]
    }

    /// Check whether any proxy key has an outstanding backup
    pub async fn has_backup(&self) -> Result<bool> {
        for name in PROXY_KEYS {
            let shadow = self.key(name).shadow();
            let found = self
                .store
                .get(&shadow)
                .await
                .map_err(|e| RedirectError::read(&shadow, e))?;
            if found.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Redirect the OS proxy to the local proxy.
    ///
    /// Safe to call repeatedly: an existing backup is never overwritten, so
    /// the eventual `disable` still restores the settings from before the
    /// first call.
    pub async fn enable(&self) -> Result<Vec<RedirectWarning>> {
        info!("Enabling system proxy -> {}", self.settings.server);
        let mut warnings = Vec::new();
        let desired = self.desired();

        for (key, value) in &desired {
            self.backup_once(key).await?;
            self.store
                .set(key, value)
                .await
                .map_err(|e| RedirectError::write(key, e))?;
            debug!("Set {} = {}", key, value);
        }

        if let Err(e) = self.store.refresh().await {
            let warning = RedirectWarning::CacheRefreshFailed(e.to_string());
            warn!("{}", warning);
            warnings.push(warning);
        }

        for (key, expected) in &desired {
            let actual = match self.store.get(key).await {
                Ok(actual) => actual,
                Err(e) => {
                    warn!("Could not read back {}: {}", key, e);
                    continue;
                }
            };
            if actual.as_ref() != Some(expected) {
                let warning = RedirectWarning::VerificationMismatch {
                    key: key.to_string(),
                    expected: expected.clone(),
                    actual,
                };
                warn!("{}", warning);
                warnings.push(warning);
            }
        }

        info!("System proxy enabled");
        Ok(warnings)
    }

    /// Take a backup of `key` unless one already exists
    async fn backup_once(&self, key: &ConfigKey) -> Result<()> {
        let shadow = key.shadow();
        let existing = self
            .store
            .get(&shadow)
            .await
            .map_err(|e| RedirectError::read(&shadow, e))?;
        if existing.is_some() {
            debug!("Backup of {} already present, keeping it", key);
            return Ok(());
        }

        let current = self
            .store
            .get(key)
            .await
            .map_err(|e| RedirectError::read(key, e))?;
        let record = BackupRecord::capture(current);
        debug!("Backing up {} as {:?}", key, record);

        self.store
            .set(&shadow, &record.encode())
            .await
            .map_err(|e| RedirectError::write(&shadow, e))
    }

    /// Restore the OS proxy settings from the backups.
    ///
    /// Best effort: every key is attempted; problems are collected in the
    /// returned outcome.
    pub async fn disable(&self) -> RestoreOutcome {
        info!("Disabling system proxy");
        let mut outcome = RestoreOutcome::default();
        let mut force_off = false;

        for name in PROXY_KEYS {
            let key = self.key(name);
            let shadow = key.shadow();

            let raw = match self.store.get(&shadow).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    outcome.warn(RedirectWarning::BackupMissing { key: key.to_string() });
                    force_off |= name == PROXY_ENABLE;
                    continue;
                }
                Err(e) => {
                    outcome.fail(RedirectError::read(&shadow, e));
                    force_off |= name == PROXY_ENABLE;
                    continue;
                }
            };

            let record = match BackupRecord::decode(&shadow, &raw) {
                Ok(record) => record,
                Err(e) => {
                    // Unusable; drop it so it does not trigger recovery forever
                    outcome.fail(e);
                    if let Err(e) = self.store.delete(&shadow).await {
                        outcome.fail(RedirectError::write(&shadow, e));
                    }
                    force_off |= name == PROXY_ENABLE;
                    continue;
                }
            };

            let restored = match &record {
                BackupRecord::Original(value) => self.store.set(&key, value).await,
                BackupRecord::WasAbsent => self.store.delete(&key).await,
            };
            if let Err(e) = restored {
                outcome.fail(RedirectError::write(&key, e));
                continue;
            }
            debug!("Restored {} from {:?}", key, record);

            if let Err(e) = self.store.delete(&shadow).await {
                outcome.fail(RedirectError::write(&shadow, e));
            }
        }

        if force_off {
            let key = self.key(PROXY_ENABLE);
            info!("Turning system proxy off explicitly");
            if let Err(e) = self.store.set(&key, &ConfigValue::Dword(0)).await {
                outcome.fail(RedirectError::write(&key, e));
            }
        }

        if let Err(e) = self.store.refresh().await {
            outcome.warn(RedirectWarning::CacheRefreshFailed(e.to_string()));
        }

        if outcome.is_clean() {
            info!("System proxy restored");
        } else {
            warn!("System proxy restore incomplete ({} failures)", outcome.failures.len());
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_sysconf::MemoryStore;

    fn redirector() -> (Arc<MemoryStore>, SystemNetworkRedirector) {
        let store = Arc::new(MemoryStore::new());
        let redirector =
            SystemNetworkRedirector::new(store.clone(), ProxySettings::loopback(10809));
        (store, redirector)
    }

    #[test]
    fn test_loopback_settings() {
        let settings = ProxySettings::loopback(8080);
        assert_eq!(settings.server, "127.0.0.1:8080");
        assert!(settings.bypass_value().starts_with("localhost;127.*;10.*"));
        assert!(settings.bypass_value().ends_with("192.168.*;<local>"));
    }

    #[tokio::test]
    async fn test_enable_writes_proxy_values() {
        let (store, redirector) = redirector();

        let warnings = redirector.enable().await.unwrap();
        assert!(warnings.is_empty());

        assert_eq!(store.value(&redirector.key(PROXY_ENABLE)), Some(ConfigValue::Dword(1)));
        assert_eq!(
            store.value(&redirector.key(PROXY_SERVER)),
            Some(ConfigValue::text("127.0.0.1:10809"))
        );
        assert!(redirector.has_backup().await.unwrap());
        assert_eq!(store.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_enable_disable_restores_exactly() {
        let (store, redirector) = redirector();
        store.seed(&redirector.key(PROXY_ENABLE), ConfigValue::Dword(0));
        store.seed(&redirector.key(PROXY_SERVER), ConfigValue::text("corp:3128"));
        // ProxyOverride absent

        redirector.enable().await.unwrap();
        let outcome = redirector.disable().await;

        assert!(outcome.is_clean());
        assert!(outcome.warnings.is_empty());
        assert_eq!(store.value(&redirector.key(PROXY_ENABLE)), Some(ConfigValue::Dword(0)));
        assert_eq!(
            store.value(&redirector.key(PROXY_SERVER)),
            Some(ConfigValue::text("corp:3128"))
        );
        // Absent before, absent after (not an empty string)
        assert!(!store.contains(&redirector.key(PROXY_OVERRIDE)));
        assert!(!redirector.has_backup().await.unwrap());
    }

    #[tokio::test]
    async fn test_double_enable_keeps_true_original() {
        let (store, redirector) = redirector();
        store.seed(&redirector.key(PROXY_SERVER), ConfigValue::text("corp:3128"));

        redirector.enable().await.unwrap();
        redirector.enable().await.unwrap();

        let shadow = redirector.key(PROXY_SERVER).shadow();
        let record = BackupRecord::decode(&shadow, &store.value(&shadow).unwrap()).unwrap();
        assert_eq!(record, BackupRecord::Original(ConfigValue::text("corp:3128")));

        redirector.disable().await;
        assert_eq!(
            store.value(&redirector.key(PROXY_SERVER)),
            Some(ConfigValue::text("corp:3128"))
        );
        assert!(!store.contains(&redirector.key(PROXY_ENABLE)));
    }

    #[tokio::test]
    async fn test_disable_without_backup_turns_proxy_off() {
        let (store, redirector) = redirector();
        store.seed(&redirector.key(PROXY_ENABLE), ConfigValue::Dword(1));

        let outcome = redirector.disable().await;

        assert!(outcome.is_clean());
        assert_eq!(outcome.warnings.len(), 3);
        assert!(matches!(outcome.warnings[0], RedirectWarning::BackupMissing { .. }));
        assert_eq!(store.value(&redirector.key(PROXY_ENABLE)), Some(ConfigValue::Dword(0)));
    }

    #[tokio::test]
    async fn test_enable_fails_on_rejected_write() {
        let (store, redirector) = redirector();
        store.reject_writes(&redirector.key(PROXY_SERVER));

        let err = redirector.enable().await.unwrap_err();
        assert!(matches!(err, RedirectError::ConfigWrite { .. }));

        // The partial enable is still undoable
        store.accept_all_writes();
        let outcome = redirector.disable().await;
        assert!(outcome.is_clean());
        assert!(!store.contains(&redirector.key(PROXY_ENABLE)));
        assert!(!redirector.has_backup().await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_failure_is_a_warning() {
        let (store, redirector) = redirector();
        store.fail_refresh(true);

        let warnings = redirector.enable().await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(matches!(warnings[0], RedirectWarning::CacheRefreshFailed(_)));
    }

    #[tokio::test]
    async fn test_failed_restore_keeps_backup() {
        let (store, redirector) = redirector();
        store.seed(&redirector.key(PROXY_SERVER), ConfigValue::text("corp:3128"));
        redirector.enable().await.unwrap();

        store.reject_writes(&redirector.key(PROXY_SERVER));
        let outcome = redirector.disable().await;

        assert!(!outcome.is_clean());
        assert!(store.contains(&redirector.key(PROXY_SERVER).shadow()));
        assert!(redirector.has_backup().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_backup_is_dropped() {
        let (store, redirector) = redirector();
        let shadow = redirector.key(PROXY_ENABLE).shadow();
        store.seed(&shadow, ConfigValue::text("garbage"));
        store.seed(&redirector.key(PROXY_ENABLE), ConfigValue::Dword(1));

        let outcome = redirector.disable().await;

        assert!(!outcome.is_clean());
        assert!(!store.contains(&shadow));
        assert_eq!(store.value(&redirector.key(PROXY_ENABLE)), Some(ConfigValue::Dword(0)));
    }
}
