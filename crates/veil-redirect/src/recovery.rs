//! Startup crash recovery
//!
//! Backups only exist between a redirect and its restore. Finding any at
//! startup means the previous session died while redirected, so the
//! settings they protect are put back before anything else runs.

use crate::dns::DnsRedirector;
use crate::error::{RedirectWarning, RestoreOutcome, Result};
use crate::proxy::SystemNetworkRedirector;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// What a recovery scan found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Proxy backups were found and restored
    pub proxy_restored: bool,
    /// DNS backups were found and restored
    pub dns_restored: bool,
    pub warnings: Vec<RedirectWarning>,
    /// Restore steps that failed, rendered for display
    pub failures: Vec<String>,
}

impl RecoveryReport {
    /// Something was left over from a previous session
    pub fn found_anything(&self) -> bool {
        self.proxy_restored || self.dns_restored
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn absorb(&mut self, outcome: RestoreOutcome) {
        self.warnings.extend(outcome.warnings);
        self.failures
            .extend(outcome.failures.into_iter().map(|e| e.to_string()));
    }
}

/// Detects and repairs redirection left behind by an unclean shutdown
pub struct CrashRecoveryScanner {
    proxy: Arc<SystemNetworkRedirector>,
    dns: Arc<DnsRedirector>,
    completed: AtomicBool,
}

impl CrashRecoveryScanner {
    pub fn new(proxy: Arc<SystemNetworkRedirector>, dns: Arc<DnsRedirector>) -> Self {
        Self {
            proxy,
            dns,
            completed: AtomicBool::new(false),
        }
    }

    /// Whether a scan has completed in this session
    pub fn has_run(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Look for orphaned backups and restore them.
    ///
    /// DNS is restored before the proxy, mirroring disconnect order. The
    /// scan counts as done only once it gets past reading the backups; a
    /// failed restore step is reported but does not make it run again.
    pub async fn scan(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let dns_pending = self.dns.has_backup().await?;
        let proxy_pending = self.proxy.has_backup().await?;

        if !dns_pending && !proxy_pending {
            info!("No leftover redirection found");
            self.completed.store(true, Ordering::Release);
            return Ok(report);
        }

        warn!(
            "Previous session did not shut down cleanly (proxy: {}, dns: {}), restoring",
            proxy_pending, dns_pending
        );

        if dns_pending {
            report.absorb(self.dns.teardown().await);
            report.dns_restored = true;
        }
        if proxy_pending {
            report.absorb(self.proxy.disable().await);
            report.proxy_restored = true;
        }

        if report.is_clean() {
            info!("Recovered system network settings");
        } else {
            warn!("Recovery incomplete: {}", report.failures.join("; "));
        }

        self.completed.store(true, Ordering::Release);
        Ok(report)
    }
}
