//! DNS Redirection
//!
//! Points every active adapter's DNS at the loopback resolver of the proxy
//! process. When that resolver does not listen on port 53, a port-forward
//! rule `loopback:53 -> loopback:<resolver_port>` is installed as well.
//!
//! Per-adapter backups go to [`DNS_BACKUP_GROUP`] before the adapter is
//! touched; the forward rule is recorded under
//! [`DNS_FORWARD_GROUP`](crate::backup::DNS_FORWARD_GROUP) before
//! it is installed.

use crate::backup::{
    AdapterDnsBackup, DNS_BACKUP_GROUP, decode_rule, encode_rule, forward_rule_key,
};
use crate::error::{RedirectError, RedirectWarning, RestoreOutcome, Result};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use veil_sysconf::{
    DnsSource, ForwardRule, NetworkAdapterConfigurator, PortForwarder, SystemConfigStore,
};

/// Port resolvers are queried on
pub const STANDARD_DNS_PORT: u16 = 53;

/// Adapter names tried when enumeration finds nothing
pub const DEFAULT_FALLBACK_ADAPTERS: &[&str] = &[
    "Ethernet",
    "Wi-Fi",
    "WLAN",
    "Local Area Connection",
    "Wireless Network Connection",
];

/// Where DNS gets redirected to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsSettings {
    /// Port the local resolver listens on
    pub resolver_port: u16,
    /// Address adapters are pointed at
    pub loopback: Ipv4Addr,
    pub fallback_adapters: Vec<String>,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            resolver_port: STANDARD_DNS_PORT,
            loopback: Ipv4Addr::LOCALHOST,
            fallback_adapters: DEFAULT_FALLBACK_ADAPTERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl DnsSettings {
    pub fn with_resolver_port(resolver_port: u16) -> Self {
        Self {
            resolver_port,
            ..Default::default()
        }
    }

    /// Forward rule needed for this resolver, if any
    pub fn forward_rule(&self) -> Option<ForwardRule> {
        if self.resolver_port == STANDARD_DNS_PORT {
            return None;
        }
        Some(ForwardRule::local(self.loopback, STANDARD_DNS_PORT, self.resolver_port))
    }

    fn redirected_source(&self) -> DnsSource {
        DnsSource::single(self.loopback)
    }

    /// Exactly the source [`DnsRedirector::setup`] writes
    fn is_redirected(&self, source: &DnsSource) -> bool {
        *source == self.redirected_source()
    }
}

/// Redirects adapter DNS through the local resolver and restores it
pub struct DnsRedirector {
    store: Arc<dyn SystemConfigStore>,
    adapters: Arc<dyn NetworkAdapterConfigurator>,
    forwarder: Arc<dyn PortForwarder>,
    settings: DnsSettings,
}

impl DnsRedirector {
    pub fn new(
        store: Arc<dyn SystemConfigStore>,
        adapters: Arc<dyn NetworkAdapterConfigurator>,
        forwarder: Arc<dyn PortForwarder>,
        settings: DnsSettings,
    ) -> Self {
        Self {
            store,
            adapters,
            forwarder,
            settings,
        }
    }

    pub fn settings(&self) -> &DnsSettings {
        &self.settings
    }

    /// Check for adapter backups or a recorded forward rule
    pub async fn has_backup(&self) -> Result<bool> {
        let backed_up = self.backed_up_adapters().await?;
        if !backed_up.is_empty() {
            return Ok(true);
        }
        let key = forward_rule_key();
        let rule = self
            .store
            .get(&key)
            .await
            .map_err(|e| RedirectError::read(&key, e))?;
        Ok(rule.is_some())
    }

    async fn backed_up_adapters(&self) -> Result<Vec<String>> {
        self.store
            .list(DNS_BACKUP_GROUP)
            .await
            .map_err(|e| RedirectError::read(DNS_BACKUP_GROUP, e))
    }

    /// Adapters to redirect, falling back to well-known names
    async fn target_adapters(&self, warnings: &mut Vec<RedirectWarning>) -> Vec<String> {
        match self.adapters.active_adapters().await {
            Ok(found) if !found.is_empty() => return found,
            Ok(_) => {}
            Err(e) => debug!("Adapter enumeration failed: {}", e),
        }
        let warning = RedirectWarning::AdapterEnumerationEmpty;
        warn!("{}", warning);
        warnings.push(warning);
        self.settings.fallback_adapters.clone()
    }

    /// Redirect DNS to the local resolver.
    ///
    /// Adapters that already have a backup keep it, so repeated calls
    /// preserve the configuration from before the first one.
    pub async fn setup(&self) -> Result<Vec<RedirectWarning>> {
        let mut warnings = Vec::new();
        let targets = self.target_adapters(&mut warnings).await;
        let backed_up: BTreeSet<String> = self.backed_up_adapters().await?.into_iter().collect();
        let redirected = self.settings.redirected_source();

        info!(
            "Redirecting DNS of {} adapter(s) to {}",
            targets.len(),
            self.settings.loopback
        );

        for adapter in &targets {
            if !backed_up.contains(adapter) {
                let current = match self.adapters.dns_source(adapter).await {
                    Ok(current) => current,
                    Err(e) => {
                        let warning = RedirectWarning::AdapterSkipped {
                            adapter: adapter.clone(),
                            reason: e.to_string(),
                        };
                        warn!("{}", warning);
                        warnings.push(warning);
                        continue;
                    }
                };

                let backup = AdapterDnsBackup::new(adapter.clone(), current);
                let key = backup.key();
                self.store
                    .set(&key, &backup.encode())
                    .await
                    .map_err(|e| RedirectError::write(&key, e))?;
                debug!("Backed up DNS of {}: {}", adapter, backup.source);
            }

            self.adapters
                .set_dns_source(adapter, &redirected)
                .await
                .map_err(|source| RedirectError::Adapter {
                    adapter: adapter.clone(),
                    source,
                })?;
        }

        if let Some(rule) = self.settings.forward_rule() {
            self.install_forward(rule).await?;
        } else {
            debug!("Resolver on port {}, no forwarding needed", STANDARD_DNS_PORT);
        }

        info!("DNS redirected");
        Ok(warnings)
    }

    async fn install_forward(&self, rule: ForwardRule) -> Result<()> {
        let key = forward_rule_key();

        // Clear whatever an earlier session left on the same listen address
        if let Ok(Some(raw)) = self.store.get(&key).await {
            if let Ok(stale) = decode_rule(&raw) {
                if let Err(e) = self.forwarder.remove_forward(&stale).await {
                    debug!("Removing recorded rule {} failed: {}", stale, e);
                }
            }
        }
        if let Err(e) = self.forwarder.remove_forward(&rule).await {
            debug!("Removing stale rule {} failed: {}", rule, e);
        }

        self.store
            .set(&key, &encode_rule(&rule))
            .await
            .map_err(|e| RedirectError::write(&key, e))?;

        self.forwarder
            .add_forward(&rule)
            .await
            .map_err(|source| RedirectError::PortForward { rule, source })?;
        info!("Forwarding DNS {}", rule);
        Ok(())
    }

    /// Undo [`setup`](Self::setup) from the persisted backups.
    ///
    /// Best effort: every adapter is attempted. Backups whose restore
    /// failed stay in place for the next attempt.
    pub async fn teardown(&self) -> RestoreOutcome {
        info!("Restoring DNS");
        let mut outcome = RestoreOutcome::default();

        self.remove_forward(&mut outcome).await;

        let backed_up = match self.backed_up_adapters().await {
            Ok(names) => names,
            Err(e) => {
                outcome.fail(e);
                Vec::new()
            }
        };

        for adapter in &backed_up {
            self.restore_adapter(adapter, &mut outcome).await;
        }

        // Redirected adapters nobody backed up go back to DHCP
        if let Ok(active) = self.adapters.active_adapters().await {
            for adapter in active.iter().filter(|a| !backed_up.contains(a)) {
                match self.adapters.dns_source(adapter).await {
                    Ok(current) if self.settings.is_redirected(&current) => {}
                    _ => continue,
                }
                debug!("Resetting {} to automatic DNS", adapter);
                if let Err(e) = self.adapters.set_dns_source(adapter, &DnsSource::Automatic).await {
                    outcome.warn(RedirectWarning::AdapterSkipped {
                        adapter: adapter.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if outcome.is_clean() {
            if let Err(e) = self.store.delete_group(DNS_BACKUP_GROUP).await {
                outcome.fail(RedirectError::write(DNS_BACKUP_GROUP, e));
            }
        }

        if let Err(e) = self.adapters.flush_resolver_cache().await {
            outcome.warn(RedirectWarning::ResolverFlushFailed(e.to_string()));
        }

        if outcome.is_clean() {
            info!("DNS restored");
        } else {
            warn!("DNS restore incomplete ({} failures)", outcome.failures.len());
        }
        outcome
    }

    async fn remove_forward(&self, outcome: &mut RestoreOutcome) {
        let key = forward_rule_key();
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                outcome.fail(RedirectError::read(&key, e));
                return;
            }
        };

        match decode_rule(&raw) {
            Ok(rule) => {
                if let Err(source) = self.forwarder.remove_forward(&rule).await {
                    outcome.fail(RedirectError::PortForward { rule, source });
                    return;
                }
                info!("Removed DNS forward {}", rule);
            }
            Err(e) => outcome.fail(e),
        }

        if let Err(e) = self.store.delete(&key).await {
            outcome.fail(RedirectError::write(&key, e));
        }
    }

    async fn restore_adapter(&self, adapter: &str, outcome: &mut RestoreOutcome) {
        let key = AdapterDnsBackup::key_for(adapter);

        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                outcome.fail(RedirectError::read(&key, e));
                return;
            }
        };

        let backup = match AdapterDnsBackup::decode(adapter, &raw) {
            Ok(backup) => backup,
            Err(e) => {
                outcome.fail(e);
                if let Err(e) = self.store.delete(&key).await {
                    outcome.fail(RedirectError::write(&key, e));
                }
                // Unknown original; DHCP is the safe default
                if let Err(e) = self.adapters.set_dns_source(adapter, &DnsSource::Automatic).await {
                    debug!("Resetting {} failed: {}", adapter, e);
                }
                return;
            }
        };

        match self.adapters.set_dns_source(adapter, &backup.source).await {
            Ok(()) => debug!("Restored DNS of {}: {}", adapter, backup.source),
            Err(e) if e.is_not_found() => {
                // Adapter is gone; nothing left to restore
                outcome.warn(RedirectWarning::AdapterSkipped {
                    adapter: adapter.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(source) => {
                outcome.fail(RedirectError::Adapter {
                    adapter: adapter.to_string(),
                    source,
                });
                return;
            }
        }

        if let Err(e) = self.store.delete(&key).await {
            outcome.fail(RedirectError::write(&key, e));
        }
    }
}
