//! Windows backends
//!
//! Shells out to `reg.exe`, `netsh` and `ipconfig` rather than binding the
//! registry and IP Helper APIs directly; the only native call is the
//! WinInet notification that makes running applications re-read proxy
//! settings.

use crate::adapter::{DnsSource, ForwardRule, NetworkAdapterConfigurator, PortForwarder};
use crate::error::{Result, SysConfError};
use crate::parse::{
    lists_forward, lists_subkey, parse_dns_servers, parse_interface_table, parse_reg_values,
};
use crate::store::{ConfigKey, ConfigValue, SystemConfigStore};
use async_trait::async_trait;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, warn};

/// Run a system tool and capture its output
async fn run_tool(tool: &'static str, args: &[&str]) -> Result<Output> {
    debug!("Running {} {}", tool, args.join(" "));

    Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| SysConfError::Command { tool, source })
}

/// Run a system tool and fail on a non-zero exit
async fn run_checked(tool: &'static str, args: &[&str]) -> Result<Output> {
    let output = run_tool(tool, args).await?;
    if !output.status.success() {
        return Err(tool_failure(tool, &output));
    }
    Ok(output)
}

fn tool_failure(tool: &'static str, output: &Output) -> SysConfError {
    let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        // netsh reports errors on stdout
        stderr = String::from_utf8_lossy(&output.stdout).trim().to_string();
    }
    SysConfError::ToolFailed { tool, stderr }
}

/// Check whether a key that failed to query is absent.
///
/// `reg.exe` reports a missing key and a denied one with the same exit
/// code and a localized message, so this walks up to the nearest
/// readable ancestor and looks for the next path segment among its
/// subkeys.
async fn key_missing(path: &str) -> Result<bool> {
    let mut child = path.trim_end_matches('\\');
    while let Some((parent, _)) = child.rsplit_once('\\') {
        let output = run_tool("reg", &["query", parent]).await?;
        if output.status.success() {
            let listing = String::from_utf8_lossy(&output.stdout);
            return Ok(!lists_subkey(&listing, child));
        }
        child = parent;
    }
    Ok(false)
}

/// Config store over the Windows registry
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStore;

impl RegistryStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SystemConfigStore for RegistryStore {
    async fn get(&self, key: &ConfigKey) -> Result<Option<ConfigValue>> {
        // Query the whole key so an absent value is an empty match, not an error
        let output = run_tool("reg", &["query", &key.group]).await?;
        if !output.status.success() {
            if key_missing(&key.group).await? {
                return Ok(None);
            }
            return Err(tool_failure("reg", &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_reg_values(&stdout)
            .into_iter()
            .find(|v| v.name.eq_ignore_ascii_case(&key.name))
            .map(|v| v.value))
    }

    async fn set(&self, key: &ConfigKey, value: &ConfigValue) -> Result<()> {
        let (kind, data) = match value {
            ConfigValue::Dword(v) => ("REG_DWORD", v.to_string()),
            ConfigValue::String(s) => ("REG_SZ", s.clone()),
        };

        run_checked(
            "reg",
            &["add", &key.group, "/v", &key.name, "/t", kind, "/d", &data, "/f"],
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &ConfigKey) -> Result<()> {
        let output = run_tool("reg", &["delete", &key.group, "/v", &key.name, "/f"]).await?;
        if output.status.success() || self.get(key).await?.is_none() {
            return Ok(());
        }
        Err(tool_failure("reg", &output))
    }

    async fn list(&self, group: &str) -> Result<Vec<String>> {
        let output = run_tool("reg", &["query", group]).await?;
        if !output.status.success() {
            if key_missing(group).await? {
                return Ok(Vec::new());
            }
            return Err(tool_failure("reg", &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_reg_values(&stdout).into_iter().map(|v| v.name).collect())
    }

    async fn delete_group(&self, group: &str) -> Result<()> {
        let output = run_tool("reg", &["delete", group, "/f"]).await?;
        if output.status.success() || key_missing(group).await? {
            return Ok(());
        }
        Err(tool_failure("reg", &output))
    }

    async fn refresh(&self) -> Result<()> {
        tokio::task::spawn_blocking(notify_settings_changed)
            .await
            .map_err(|e| SysConfError::Io(std::io::Error::other(e)))?
    }
}

/// Broadcast `SETTINGS_CHANGED` + `REFRESH` through WinInet
fn notify_settings_changed() -> Result<()> {
    use windows_sys::Win32::Networking::WinInet::{
        INTERNET_OPTION_REFRESH, INTERNET_OPTION_SETTINGS_CHANGED, InternetSetOptionW,
    };

    for option in [INTERNET_OPTION_SETTINGS_CHANGED, INTERNET_OPTION_REFRESH] {
        // SAFETY: a null handle and null buffer are the documented way to
        // broadcast these two options.
        let ok = unsafe { InternetSetOptionW(std::ptr::null(), option, std::ptr::null(), 0) };
        if ok == 0 {
            return Err(SysConfError::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Adapter DNS and port forwarding via `netsh`
#[derive(Debug, Clone, Copy, Default)]
pub struct NetshAdapters;

impl NetshAdapters {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetworkAdapterConfigurator for NetshAdapters {
    async fn active_adapters(&self) -> Result<Vec<String>> {
        let output = run_checked("netsh", &["interface", "show", "interface"]).await?;
        Ok(parse_interface_table(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn dns_source(&self, adapter: &str) -> Result<DnsSource> {
        let name = format!("name={}", adapter);
        let output = run_tool("netsh", &["interface", "ipv4", "show", "dnsservers", &name]).await?;
        if !output.status.success() {
            return Err(SysConfError::NotFound(adapter.to_string()));
        }
        parse_dns_servers(&String::from_utf8_lossy(&output.stdout))
    }

    async fn set_dns_source(&self, adapter: &str, source: &DnsSource) -> Result<()> {
        let name = format!("name={}", adapter);

        match source {
            DnsSource::Automatic => {
                run_checked(
                    "netsh",
                    &["interface", "ipv4", "set", "dnsservers", &name, "source=dhcp"],
                )
                .await?;
            }
            DnsSource::Static(servers) => {
                let first = servers
                    .first()
                    .map(|ip| format!("address={}", ip))
                    .unwrap_or_else(|| "address=none".to_string());
                run_checked(
                    "netsh",
                    &[
                        "interface",
                        "ipv4",
                        "set",
                        "dnsservers",
                        &name,
                        "source=static",
                        &first,
                        "register=primary",
                        "validate=no",
                    ],
                )
                .await?;

                for (i, ip) in servers.iter().enumerate().skip(1) {
                    let address = format!("address={}", ip);
                    let index = format!("index={}", i + 1);
                    run_checked(
                        "netsh",
                        &[
                            "interface",
                            "ipv4",
                            "add",
                            "dnsservers",
                            &name,
                            &address,
                            &index,
                            "validate=no",
                        ],
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn flush_resolver_cache(&self) -> Result<()> {
        run_checked("ipconfig", &["/flushdns"]).await?;

        // registerdns needs elevation on some systems; flushing is what matters
        if let Err(e) = run_checked("ipconfig", &["/registerdns"]).await {
            warn!("ipconfig /registerdns failed: {}", e);
        }
        Ok(())
    }
}

#[async_trait]
impl PortForwarder for NetshAdapters {
    async fn add_forward(&self, rule: &ForwardRule) -> Result<()> {
        let listen_port = format!("listenport={}", rule.listen.port());
        let listen_addr = format!("listenaddress={}", rule.listen.ip());
        let connect_port = format!("connectport={}", rule.connect.port());
        let connect_addr = format!("connectaddress={}", rule.connect.ip());

        run_checked(
            "netsh",
            &[
                "interface",
                "portproxy",
                "add",
                "v4tov4",
                &listen_port,
                &listen_addr,
                &connect_port,
                &connect_addr,
            ],
        )
        .await?;
        Ok(())
    }

    async fn remove_forward(&self, rule: &ForwardRule) -> Result<()> {
        let listen_port = format!("listenport={}", rule.listen.port());
        let listen_addr = format!("listenaddress={}", rule.listen.ip());

        let output = run_tool(
            "netsh",
            &["interface", "portproxy", "delete", "v4tov4", &listen_port, &listen_addr],
        )
        .await?;

        if output.status.success() {
            return Ok(());
        }

        let rules = run_checked("netsh", &["interface", "portproxy", "show", "v4tov4"]).await?;
        let listing = String::from_utf8_lossy(&rules.stdout);
        let address = rule.listen.ip().to_string();
        if !lists_forward(&listing, &address, rule.listen.port()) {
            return Ok(());
        }
        Err(tool_failure("netsh", &output))
    }
}
