//! Client Configuration
//!
//! Loaded from TOML or JSON, chosen by file extension. Every field has a
//! default, so a config file only needs what it changes:
//!
//! ```toml
//! [proxy]
//! binary = "C:\\Program Files\\Veil\\veil-proxy.exe"
//! args = ["--server", "{ip}:{port}", "--http", "127.0.0.1:{listen_port}"]
//!
//! [[servers]]
//! id = "de-1"
//! name = "Frankfurt"
//! location = "DE"
//! ip = "185.186.78.1"
//! port = 443
//! ```

use crate::process::ProcessSpec;
use crate::selector::SelectionPolicy;
use crate::server::ServerDescriptor;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use veil_redirect::{DEFAULT_FALLBACK_ADAPTERS, DnsSettings, ProxySettings, STANDARD_DNS_PORT};

/// Complete client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub dns: DnsSection,
    #[serde(default)]
    pub selection: SelectionPolicy,
    #[serde(default)]
    pub store: StoreSection,
    /// Static server catalog
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
}

/// Local proxy process settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxySection {
    /// Port the local HTTP proxy listens on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Hosts that bypass the system proxy
    #[serde(default = "ProxySettings::default_bypass")]
    pub bypass: Vec<String>,
    /// Proxy executable
    #[serde(default = "default_binary")]
    pub binary: PathBuf,
    /// Arguments; `{ip}`, `{port}`, `{listen_port}` and `{dns_port}` are expanded
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
}

fn default_listen_port() -> u16 {
    10809
}

fn default_binary() -> PathBuf {
    PathBuf::from(if cfg!(windows) { "veil-proxy.exe" } else { "veil-proxy" })
}

fn default_args() -> Vec<String> {
    [
        "--server",
        "{ip}:{port}",
        "--http",
        "127.0.0.1:{listen_port}",
        "--dns",
        "127.0.0.1:{dns_port}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_start_timeout() -> u64 {
    15
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            bypass: ProxySettings::default_bypass(),
            binary: default_binary(),
            args: default_args(),
            start_timeout_secs: default_start_timeout(),
        }
    }
}

/// DNS redirection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Port of the proxy's local resolver
    #[serde(default = "default_resolver_port")]
    pub resolver_port: u16,
    /// Adapters to use when enumeration finds none
    #[serde(default = "default_fallback_adapters")]
    pub fallback_adapters: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_resolver_port() -> u16 {
    STANDARD_DNS_PORT
}

fn default_fallback_adapters() -> Vec<String> {
    DEFAULT_FALLBACK_ADAPTERS.iter().map(|s| s.to_string()).collect()
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            resolver_port: default_resolver_port(),
            fallback_adapters: default_fallback_adapters(),
        }
    }
}

/// Where redirection state and backups are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// The OS configuration store (registry)
    #[default]
    System,
    /// A JSON file; nothing on the machine is touched
    File,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,
    /// State file for the file backend
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl StoreSection {
    /// Configured state file, or `<data dir>/veil/state.json`
    pub fn state_file(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(default_state_file)
    }
}

fn default_state_file() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("veil")
        .join("state.json")
}

/// Configuration format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Guess from extension; anything but `.json` is TOML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }
}

impl ClientConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let config = match ConfigFormat::from_path(path) {
            ConfigFormat::Toml => Self::from_toml(&content)?,
            ConfigFormat::Json => Self::from_json(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Defaults plus a few placeholder servers
    pub fn default_config() -> Self {
        Self {
            servers: vec![
                ServerDescriptor::new("de-1", "Frankfurt", "DE", [185, 186, 78, 1].into(), 443),
                ServerDescriptor::new("uk-1", "London", "UK", [178, 62, 1, 1].into(), 443),
                ServerDescriptor::new("jp-1", "Tokyo", "JP", [103, 231, 88, 1].into(), 443),
            ],
            ..Default::default()
        }
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.listen_port == 0 {
            return Err(ConfigError::Invalid("proxy.listen_port must not be 0".into()));
        }
        if self.dns.resolver_port == 0 {
            return Err(ConfigError::Invalid("dns.resolver_port must not be 0".into()));
        }
        if self.selection.latency_ceiling_ms == 0 {
            return Err(ConfigError::Invalid(
                "selection.latency_ceiling_ms must not be 0".into(),
            ));
        }
        if self.proxy.start_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "proxy.start_timeout_secs must not be 0".into(),
            ));
        }
        Ok(())
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            bypass: self.proxy.bypass.clone(),
            ..ProxySettings::loopback(self.proxy.listen_port)
        }
    }

    pub fn dns_settings(&self) -> DnsSettings {
        DnsSettings {
            resolver_port: self.dns.resolver_port,
            loopback: Ipv4Addr::LOCALHOST,
            fallback_adapters: self.dns.fallback_adapters.clone(),
        }
    }

    pub fn process_spec(&self) -> ProcessSpec {
        ProcessSpec {
            binary: self.proxy.binary.clone(),
            args: self.proxy.args.clone(),
            listen_port: self.proxy.listen_port,
            dns_port: self.dns.resolver_port,
            start_timeout: Duration::from_secs(self.proxy.start_timeout_secs),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.proxy.listen_port, 10809);
        assert_eq!(config.proxy.start_timeout_secs, 15);
        assert!(config.dns.enabled);
        assert_eq!(config.dns.resolver_port, 53);
        assert_eq!(config.dns.fallback_adapters.len(), 5);
        assert_eq!(config.selection.latency_ceiling_ms, 200);
        assert_eq!(config.selection.spread_ms, 30);
        assert_eq!(config.store.backend, StoreBackend::System);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = ClientConfig::from_toml(
            r#"
            [dns]
            resolver_port = 5353

            [store]
            backend = "file"
            state_file = "/tmp/veil-state.json"

            [[servers]]
            id = "de-1"
            name = "Frankfurt"
            location = "DE"
            ip = "185.186.78.1"
            port = 443
            latency_ms = 35
            "#,
        )
        .unwrap();

        assert_eq!(config.dns.resolver_port, 5353);
        assert!(config.dns.enabled);
        assert_eq!(config.proxy.listen_port, 10809);
        assert_eq!(config.store.backend, StoreBackend::File);
        assert_eq!(config.store.state_file(), PathBuf::from("/tmp/veil-state.json"));
        assert_eq!(config.servers[0].latency_ms, Some(35));
        assert_eq!(config.dns_settings().forward_rule().unwrap().connect.port(), 5353);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = ClientConfig::default_config();
        let parsed = ClientConfig::from_toml(&config.to_toml()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validation() {
        let mut config = ClientConfig::default();
        config.proxy.listen_port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ClientConfig::default();
        config.selection.latency_ceiling_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.proxy.start_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let json = dir.path().join("veil.json");
        std::fs::write(&json, r#"{"proxy": {"listen_port": 8118}}"#).unwrap();
        assert_eq!(ClientConfig::load(&json).unwrap().proxy.listen_port, 8118);

        let toml = dir.path().join("veil.toml");
        std::fs::write(&toml, "[proxy]\nlisten_port = 0\n").unwrap();
        assert!(matches!(ClientConfig::load(&toml), Err(ConfigError::Invalid(_))));

        let missing = dir.path().join("missing.toml");
        assert!(matches!(ClientConfig::load(&missing), Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_proxy_settings_from_config() {
        let mut config = ClientConfig::default();
        config.proxy.listen_port = 8118;
        config.proxy.bypass = vec!["<local>".into()];

        let settings = config.proxy_settings();
        assert_eq!(settings.server, "127.0.0.1:8118");
        assert_eq!(settings.bypass, vec!["<local>"]);
    }
}
