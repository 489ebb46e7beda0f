//! veil Network Redirection
//!
//! Redirects the machine's HTTP proxy and DNS through the local proxy
//! process, and guarantees the original configuration comes back.
//!
//! # Components
//!
//! - [`SystemNetworkRedirector`]: OS proxy settings (`enable` / `disable`)
//! - [`DnsRedirector`]: adapter DNS plus an optional port-forward rule
//!   (`setup` / `teardown`)
//! - [`CrashRecoveryScanner`]: restores whatever a crashed session left
//!
//! Every value is backed up to the config store before it is overwritten
//! and the backup is removed only after the value is restored. A backup
//! found at startup is therefore proof of an unclean shutdown.
//!
//! Redirection is fallible and returns [`RedirectError`]; restores are
//! best effort and return a [`RestoreOutcome`] listing what went wrong.

mod backup;
mod dns;
mod error;
mod proxy;
mod recovery;

pub use backup::{
    AdapterDnsBackup, BackupRecord, DNS_BACKUP_GROUP, DNS_FORWARD_GROUP, DNS_FORWARD_RULE,
    INTERNET_SETTINGS,
};
pub use dns::{DEFAULT_FALLBACK_ADAPTERS, DnsRedirector, DnsSettings, STANDARD_DNS_PORT};
pub use error::{RedirectError, RedirectWarning, RestoreOutcome, Result};
pub use proxy::{
    PROXY_ENABLE, PROXY_KEYS, PROXY_OVERRIDE, PROXY_SERVER, ProxySettings,
    SystemNetworkRedirector,
};
pub use recovery::{CrashRecoveryScanner, RecoveryReport};
