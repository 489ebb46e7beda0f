//! veil Client Core
//!
//! Connection lifecycle for the veil proxy client: pick an upstream
//! server, run the local proxy process against it, and route the
//! machine's HTTP proxy and DNS through it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   ConnectionManager                      │
//! │                                                          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐  │
//! │  │ServerCatalog │──▶│  selector    │──▶│ ProxyProcess │  │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘  │
//! │                                               │ exit     │
//! │  ┌────────────────────────┐  ┌─────────────┐  ▼ watchdog │
//! │  │SystemNetworkRedirector │  │DnsRedirector│             │
//! │  └───────────┬────────────┘  └──────┬──────┘             │
//! └──────────────│──────────────────────│────────────────────┘
//!                ▼                      ▼
//!        SystemConfigStore    NetworkAdapterConfigurator
//! ```
//!
//! Observers get [`ConnectionEvent`]s over `crossbeam-channel` receivers
//! from [`ConnectionManager::subscribe`].

mod catalog;
mod config;
mod events;
mod manager;
mod process;
mod selector;
mod server;
mod state;

pub use catalog::{ServerCatalog, StaticCatalog};
pub use config::{
    ClientConfig, ConfigError, ConfigFormat, DnsSection, ProxySection, StoreBackend, StoreSection,
};
pub use events::{ConnectionEvent, EventBus, TeardownReport};
pub use manager::{ConnectError, ConnectionManager, ManagerParts};
pub use process::{
    CommandProcess, ExitCallback, ProcessError, ProcessSpec, ProxyProcess, ScriptedProcess,
};
pub use selector::{SelectionPolicy, resolve_target, select_best};
pub use server::{ServerDescriptor, ServerId};
pub use state::{ConnectionState, DisconnectReason};
