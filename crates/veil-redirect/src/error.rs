//! Error and warning types for redirection

use std::fmt;
use thiserror::Error;
use veil_sysconf::{ConfigValue, ForwardRule, SysConfError};

/// Result type alias for redirection operations
pub type Result<T> = std::result::Result<T, RedirectError>;

/// Redirection failures
#[derive(Debug, Error)]
pub enum RedirectError {
    /// A set/delete against the config store failed
    #[error("Failed to write {key}: {source}")]
    ConfigWrite {
        key: String,
        #[source]
        source: SysConfError,
    },

    #[error("Failed to read {key}: {source}")]
    ConfigRead {
        key: String,
        #[source]
        source: SysConfError,
    },

    /// Changing an adapter's DNS failed
    #[error("Adapter {adapter}: {source}")]
    Adapter {
        adapter: String,
        #[source]
        source: SysConfError,
    },

    #[error("Port forward {rule}: {source}")]
    PortForward {
        rule: ForwardRule,
        #[source]
        source: SysConfError,
    },

    /// A persisted backup could not be decoded
    #[error("Corrupt backup at {key}: {source}")]
    CorruptBackup {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RedirectError {
    pub(crate) fn write(key: impl fmt::Display, source: SysConfError) -> Self {
        RedirectError::ConfigWrite {
            key: key.to_string(),
            source,
        }
    }

    pub(crate) fn read(key: impl fmt::Display, source: SysConfError) -> Self {
        RedirectError::ConfigRead {
            key: key.to_string(),
            source,
        }
    }
}

/// Non-fatal conditions noticed while redirecting or restoring.
///
/// These are logged where they happen and handed back to the caller;
/// none of them aborts the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectWarning {
    /// Read-back after a write returned something else
    VerificationMismatch {
        key: String,
        expected: ConfigValue,
        actual: Option<ConfigValue>,
    },
    /// The OS could not be told to reload proxy settings
    CacheRefreshFailed(String),
    /// Restore found no backup for a key and used the fallback
    BackupMissing { key: String },
    /// Adapter enumeration was empty; the fallback names were used
    AdapterEnumerationEmpty,
    /// An adapter was left alone
    AdapterSkipped { adapter: String, reason: String },
    /// Resolver cache flush / re-register failed
    ResolverFlushFailed(String),
}

impl fmt::Display for RedirectWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedirectWarning::VerificationMismatch { key, expected, actual } => match actual {
                Some(actual) => write!(f, "{} reads back {} (wrote {})", key, actual, expected),
                None => write!(f, "{} is missing after writing {}", key, expected),
            },
            RedirectWarning::CacheRefreshFailed(e) => write!(f, "Settings refresh failed: {}", e),
            RedirectWarning::BackupMissing { key } => write!(f, "No backup for {}", key),
            RedirectWarning::AdapterEnumerationEmpty => {
                write!(f, "No active adapters found, using default adapter names")
            }
            RedirectWarning::AdapterSkipped { adapter, reason } => {
                write!(f, "Adapter {} skipped: {}", adapter, reason)
            }
            RedirectWarning::ResolverFlushFailed(e) => write!(f, "Resolver flush failed: {}", e),
        }
    }
}

/// Result of a best-effort restore.
///
/// Restores never stop at the first problem; every step is attempted and
/// whatever went wrong is collected here. A restore with failures may
/// have left OS settings redirected.
#[derive(Debug, Default)]
pub struct RestoreOutcome {
    pub warnings: Vec<RedirectWarning>,
    pub failures: Vec<RedirectError>,
}

impl RestoreOutcome {
    /// Every setting was put back
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: RestoreOutcome) {
        self.warnings.extend(other.warnings);
        self.failures.extend(other.failures);
    }

    pub(crate) fn warn(&mut self, warning: RedirectWarning) {
        tracing::warn!("{}", warning);
        self.warnings.push(warning);
    }

    pub(crate) fn fail(&mut self, error: RedirectError) {
        tracing::error!("{}", error);
        self.failures.push(error);
    }
}
