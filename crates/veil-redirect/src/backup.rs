//! Persisted backup records
//!
//! Backups live in the same store as the settings they protect, so they
//! survive a crash together. Their presence at startup is what tells the
//! recovery scanner that a previous session never restored.

use crate::error::{RedirectError, Result};
use serde::{Deserialize, Serialize};
use veil_sysconf::{ConfigKey, ConfigValue, DnsSource, ForwardRule};

/// Registry key holding the WinInet proxy settings
pub const INTERNET_SETTINGS: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

/// Group holding one DNS backup per adapter name
pub const DNS_BACKUP_GROUP: &str = r"HKCU\Software\Veil\DnsBackup";

/// Group holding the port-forward rule installed for the local resolver
pub const DNS_FORWARD_GROUP: &str = r"HKCU\Software\Veil\DnsForward";

/// Value name of the forward rule record
pub const DNS_FORWARD_RULE: &str = "Rule";

/// Backup of one config value taken before it was overwritten
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupRecord {
    /// The value that was there
    Original(ConfigValue),
    /// Nothing was there; restore means delete
    WasAbsent,
}

impl BackupRecord {
    /// Record the current state of a value
    pub fn capture(current: Option<ConfigValue>) -> Self {
        match current {
            Some(value) => BackupRecord::Original(value),
            None => BackupRecord::WasAbsent,
        }
    }

    /// Encode for storage under a shadow key
    pub fn encode(&self) -> ConfigValue {
        // Serializing a plain enum of strings and integers cannot fail
        ConfigValue::String(serde_json::to_string(self).unwrap_or_default())
    }

    pub fn decode(key: &ConfigKey, raw: &ConfigValue) -> Result<Self> {
        match raw {
            ConfigValue::String(json) => {
                serde_json::from_str(json).map_err(|source| RedirectError::CorruptBackup {
                    key: key.to_string(),
                    source,
                })
            }
            // Shadow values are always written as JSON text
            ConfigValue::Dword(_) => Err(RedirectError::CorruptBackup {
                key: key.to_string(),
                source: serde::de::Error::custom("expected a JSON text value"),
            }),
        }
    }
}

/// Backup of one adapter's DNS source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterDnsBackup {
    pub adapter: String,
    pub source: DnsSource,
}

impl AdapterDnsBackup {
    pub fn new(adapter: impl Into<String>, source: DnsSource) -> Self {
        Self {
            adapter: adapter.into(),
            source,
        }
    }

    pub fn key(&self) -> ConfigKey {
        Self::key_for(&self.adapter)
    }

    pub fn key_for(adapter: &str) -> ConfigKey {
        ConfigKey::new(DNS_BACKUP_GROUP, adapter)
    }

    pub fn encode(&self) -> ConfigValue {
        ConfigValue::String(serde_json::to_string(&self.source).unwrap_or_default())
    }

    pub fn decode(adapter: &str, raw: &ConfigValue) -> Result<Self> {
        let key = Self::key_for(adapter);
        let json = raw.as_str().unwrap_or_default();
        let source = serde_json::from_str(json).map_err(|source| RedirectError::CorruptBackup {
            key: key.to_string(),
            source,
        })?;
        Ok(Self::new(adapter, source))
    }
}

pub(crate) fn forward_rule_key() -> ConfigKey {
    ConfigKey::new(DNS_FORWARD_GROUP, DNS_FORWARD_RULE)
}

pub(crate) fn encode_rule(rule: &ForwardRule) -> ConfigValue {
    ConfigValue::String(serde_json::to_string(rule).unwrap_or_default())
}

pub(crate) fn decode_rule(raw: &ConfigValue) -> Result<ForwardRule> {
    let json = raw.as_str().unwrap_or_default();
    serde_json::from_str(json).map_err(|source| RedirectError::CorruptBackup {
        key: forward_rule_key().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_backup_record_roundtrip() {
        let key = ConfigKey::new(INTERNET_SETTINGS, "ProxyEnable_bak");
        for record in [
            BackupRecord::Original(ConfigValue::Dword(0)),
            BackupRecord::Original(ConfigValue::text("")),
            BackupRecord::WasAbsent,
        ] {
            let decoded = BackupRecord::decode(&key, &record.encode()).unwrap();
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn test_absent_and_empty_are_distinct() {
        let absent = BackupRecord::capture(None).encode();
        let empty = BackupRecord::capture(Some(ConfigValue::text(""))).encode();
        assert_ne!(absent, empty);
    }

    #[test]
    fn test_backup_record_corrupt() {
        let key = ConfigKey::new(INTERNET_SETTINGS, "ProxyEnable_bak");
        assert!(BackupRecord::decode(&key, &ConfigValue::text("{oops")).is_err());
        assert!(BackupRecord::decode(&key, &ConfigValue::Dword(1)).is_err());
    }

    #[test]
    fn test_adapter_backup_roundtrip() {
        let backup = AdapterDnsBackup::new(
            "Wi-Fi",
            DnsSource::Static(vec!["9.9.9.9".parse().unwrap(), "1.1.1.1".parse().unwrap()]),
        );
        let decoded = AdapterDnsBackup::decode("Wi-Fi", &backup.encode()).unwrap();
        assert_eq!(decoded, backup);
        assert_eq!(backup.key().group, DNS_BACKUP_GROUP);
    }

    #[test]
    fn test_rule_roundtrip() {
        let rule = ForwardRule::local(Ipv4Addr::LOCALHOST, 53, 5353);
        assert_eq!(decode_rule(&encode_rule(&rule)).unwrap(), rule);
    }
}
