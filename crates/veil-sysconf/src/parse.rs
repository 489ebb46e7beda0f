//! Parsers for `reg.exe` and `netsh` output.
//!
//! Kept free of `cfg(windows)` so they are tested on every platform.

#![cfg_attr(not(windows), allow(dead_code))]

use crate::adapter::DnsSource;
use crate::error::{Result, SysConfError};
use crate::store::ConfigValue;
use std::net::IpAddr;

/// Column separator used by `reg query`
const REG_SEPARATOR: &str = "    ";

/// One value line of `reg query` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RegValue {
    pub name: String,
    pub value: ConfigValue,
}

/// Parse all value lines of `reg query <key>` output.
///
/// Value lines are indented and split into name, type and data by runs of
/// four spaces:
///
/// ```text
/// HKEY_CURRENT_USER\Software\Microsoft\Windows\CurrentVersion\Internet Settings
///     ProxyEnable    REG_DWORD    0x1
///     ProxyServer    REG_SZ    127.0.0.1:10809
/// ```
///
/// Subkey lines and values of types we never write are skipped.
pub(crate) fn parse_reg_values(output: &str) -> Vec<RegValue> {
    output
        .lines()
        .filter(|line| line.starts_with(REG_SEPARATOR))
        .filter_map(|line| parse_reg_line(line.trim_start()))
        .collect()
}

fn parse_reg_line(line: &str) -> Option<RegValue> {
    let mut parts = line.splitn(3, REG_SEPARATOR);
    let name = parts.next()?.to_string();
    let kind = parts.next()?;
    let data = parts.next().unwrap_or("");

    let value = match kind {
        "REG_DWORD" => {
            let hex = data.trim().trim_start_matches("0x");
            ConfigValue::Dword(u32::from_str_radix(hex, 16).ok()?)
        }
        "REG_SZ" | "REG_EXPAND_SZ" => ConfigValue::String(data.to_string()),
        _ => return None,
    };

    Some(RegValue { name, value })
}

/// Whether `reg query <parent>` output lists `child` as a subkey.
///
/// Subkeys are printed as full paths after the values. The first path line
/// is the queried key itself. Only the last segment is compared, since the
/// query may use `HKCU` where the output says `HKEY_CURRENT_USER`.
pub(crate) fn lists_subkey(output: &str, child: &str) -> bool {
    let leaf = child.rsplit('\\').next().unwrap_or(child);
    output
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !line.starts_with(' '))
        .skip(1)
        .filter_map(|line| line.rsplit('\\').next())
        .any(|name| name.eq_ignore_ascii_case(leaf))
}

/// Parse `netsh interface show interface` into connected adapter names.
///
/// ```text
/// Admin State    State          Type             Interface Name
/// -------------------------------------------------------------------------
/// Enabled        Connected      Dedicated        Ethernet
/// Enabled        Disconnected   Dedicated        Wi-Fi 2
/// ```
pub(crate) fn parse_interface_table(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 4 && parts[1].eq_ignore_ascii_case("Connected") {
                Some(parts[3..].join(" "))
            } else {
                None
            }
        })
        .collect()
}

/// Whether `netsh interface portproxy show v4tov4` has a rule listening
/// on `address:port`.
///
/// ```text
/// Listen on ipv4:             Connect to ipv4:
///
/// Address         Port        Address         Port
/// --------------- ----------  --------------- ----------
/// 127.0.0.1       53          127.0.0.1       5353
/// ```
pub(crate) fn lists_forward(output: &str, address: &str, port: u16) -> bool {
    let port = port.to_string();
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .any(|line| {
            let mut parts = line.split_whitespace();
            parts.next() == Some(address) && parts.next() == Some(port.as_str())
        })
}

/// Parse `netsh interface ipv4 show dnsservers name=<adapter>`.
///
/// ```text
/// Configuration for interface "Ethernet"
///     Statically Configured DNS Servers:    8.8.8.8
///                                           8.8.4.4
///     Register with which suffix:           Primary only
/// ```
///
/// A DHCP-configured adapter reports `DNS servers configured through DHCP`
/// instead.
pub(crate) fn parse_dns_servers(output: &str) -> Result<DnsSource> {
    let mut lines = output.lines().map(str::trim).peekable();

    while let Some(line) = lines.next() {
        let Some((label, rest)) = line.split_once(':') else {
            continue;
        };

        if label.contains("DHCP") {
            return Ok(DnsSource::Automatic);
        }

        if label.contains("Statically Configured DNS Servers") {
            let mut servers = Vec::new();
            if let Ok(ip) = rest.trim().parse::<IpAddr>() {
                servers.push(ip);
            }
            while let Some(next) = lines.peek() {
                match next.parse::<IpAddr>() {
                    Ok(ip) => {
                        servers.push(ip);
                        lines.next();
                    }
                    Err(_) => break,
                }
            }
            return Ok(DnsSource::Static(servers));
        }
    }

    Err(SysConfError::Parse("no DNS configuration in netsh output".into()))
}
