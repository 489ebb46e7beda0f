//! Config Store Interface
//!
//! Values are addressed by a [`ConfigKey`]: a group path (a registry key
//! such as `HKCU\Software\...\Internet Settings`) plus a value name inside
//! that group. Backends that are not the registry treat the group path as
//! an opaque namespace string.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Suffix appended to a value name to form its shadow (backup) name
pub const SHADOW_SUFFIX: &str = "_bak";

/// Address of a single configuration value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigKey {
    /// Group path the value lives under
    pub group: String,
    /// Value name inside the group
    pub name: String,
}

impl ConfigKey {
    /// Create a new key
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }

    /// Key of the shadow entry that holds this value's backup.
    ///
    /// Lives in the same group so a crash cannot separate the two.
    pub fn shadow(&self) -> Self {
        Self {
            group: self.group.clone(),
            name: format!("{}{}", self.name, SHADOW_SUFFIX),
        }
    }

    /// Check if this key names a shadow entry
    pub fn is_shadow(&self) -> bool {
        self.name.ends_with(SHADOW_SUFFIX)
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\\{}", self.group, self.name)
    }
}

/// A typed configuration value (mirrors the registry value kinds we touch)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum ConfigValue {
    /// 32-bit integer (`REG_DWORD`)
    Dword(u32),
    /// Text (`REG_SZ`)
    String(String),
}

impl ConfigValue {
    /// Create a string value
    pub fn text(s: impl Into<String>) -> Self {
        ConfigValue::String(s.into())
    }

    pub fn as_dword(&self) -> Option<u32> {
        match self {
            ConfigValue::Dword(v) => Some(*v),
            ConfigValue::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            ConfigValue::Dword(_) => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Dword(v) => write!(f, "{:#x}", v),
            ConfigValue::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

/// Persistent, machine- or user-global key/value configuration.
///
/// Implementations must make `delete` of an absent value a success, and
/// `get` of an absent value `Ok(None)`; callers rely on both to make
/// restore idempotent.
#[async_trait]
pub trait SystemConfigStore: Send + Sync {
    /// Read a value, `None` if it does not exist
    async fn get(&self, key: &ConfigKey) -> Result<Option<ConfigValue>>;

    /// Create or overwrite a value
    async fn set(&self, key: &ConfigKey, value: &ConfigValue) -> Result<()>;

    /// Remove a value
    async fn delete(&self, key: &ConfigKey) -> Result<()>;

    /// Names of all values in a group (empty if the group does not exist)
    async fn list(&self, group: &str) -> Result<Vec<String>>;

    /// Remove a whole group and everything in it
    async fn delete_group(&self, group: &str) -> Result<()>;

    /// Tell the OS that settings read from this store changed.
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadow_key() {
        let key = ConfigKey::new("HKCU\\Test", "ProxyEnable");
        let shadow = key.shadow();

        assert_eq!(shadow.group, key.group);
        assert_eq!(shadow.name, "ProxyEnable_bak");
        assert!(shadow.is_shadow());
        assert!(!key.is_shadow());
    }

    #[test]
    fn test_key_display() {
        let key = ConfigKey::new("HKCU\\Test", "ProxyServer");
        assert_eq!(key.to_string(), "HKCU\\Test\\ProxyServer");
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(ConfigValue::Dword(1).as_dword(), Some(1));
        assert_eq!(ConfigValue::Dword(1).as_str(), None);
        assert_eq!(ConfigValue::text("a").as_str(), Some("a"));
    }

    #[test]
    fn test_value_json_shape() {
        let json = serde_json::to_string(&ConfigValue::Dword(1)).unwrap();
        assert_eq!(json, r#"{"kind":"dword","data":1}"#);
    }
}
