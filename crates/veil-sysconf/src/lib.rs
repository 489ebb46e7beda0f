//! veil System Configuration Access
//!
//! Capability interfaces over the machine-global network configuration
//! that the client redirects, plus the interchangeable backends that
//! implement them.
//!
//! # Interfaces
//!
//! - [`SystemConfigStore`]: get/set/delete named values grouped under a
//!   hierarchical path (the Windows registry today)
//! - [`NetworkAdapterConfigurator`]: enumerate active adapters and read or
//!   replace their DNS source
//! - [`PortForwarder`]: install and remove loopback port-forward rules
//!
//! # Backends
//!
//! | Backend | Store | Adapters | Used for |
//! |---------|-------|----------|----------|
//! | Windows | `reg.exe` + WinInet | `netsh` + `ipconfig` | Production |
//! | File | JSON file | - | Dry runs, crash simulation |
//! | Memory | In-process map | In-process map | Tests |
//! | Noop | Always absent | Always empty | Unsupported platforms |
//!
//! [`platform_store`] and [`platform_adapters`] pick the OS backend at
//! build time. On platforms without one every call is a silent success.

mod adapter;
mod error;
mod file;
mod memory;
mod noop;
mod parse;
mod store;
#[cfg(windows)]
mod windows;

use std::sync::Arc;

pub use adapter::{DnsSource, ForwardRule, NetworkAdapterConfigurator, PortForwarder};
pub use error::{Result, SysConfError};
pub use file::FileStore;
pub use memory::{MemoryAdapters, MemoryStore};
pub use noop::{NoopAdapters, NoopStore};
pub use store::{ConfigKey, ConfigValue, SystemConfigStore};
#[cfg(windows)]
pub use windows::{NetshAdapters, RegistryStore};

/// Config store backed by the current operating system.
pub fn platform_store() -> Arc<dyn SystemConfigStore> {
    #[cfg(windows)]
    {
        Arc::new(RegistryStore::new())
    }
    #[cfg(not(windows))]
    {
        Arc::new(NoopStore)
    }
}

/// Adapter configurator and port forwarder backed by the current operating system.
pub fn platform_adapters() -> (Arc<dyn NetworkAdapterConfigurator>, Arc<dyn PortForwarder>) {
    #[cfg(windows)]
    {
        let netsh = Arc::new(NetshAdapters::new());
        (netsh.clone(), netsh)
    }
    #[cfg(not(windows))]
    {
        let noop = Arc::new(NoopAdapters);
        (noop.clone(), noop)
    }
}
