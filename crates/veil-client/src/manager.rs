//! Connection Manager
//!
//! Owns the connect/disconnect lifecycle:
//!
//! ```text
//!              connect()                       all steps ok
//! Disconnected ─────────► Connecting ───────────────────────► Connected
//!      ▲                      │ any step fails (unwound)          │
//!      ├──────────────────────┘                                   │
//!      │                                       disconnect() /     │
//!      └──────────────── Disconnecting ◄──── watchdog / settings ─┘
//! ```
//!
//! Connect order: recovery scan (once) → resolve server → start proxy
//! process → system proxy → DNS. Disconnect runs the reverse and always
//! ends in `Disconnected`.
//!
//! Every mutation goes through one async lock. `connect` refuses to wait
//! for it and fails with [`ConnectError::InProgress`]; `disconnect`, the
//! watchdog and `recover` queue behind it.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = ConnectionManager::new(parts);
//! let events = manager.subscribe();
//!
//! manager.recover().await?;
//! let server = manager.connect().await?;
//! println!("{}", manager.status());
//!
//! let report = manager.disconnect().await;
//! assert!(report.is_clean());
//! ```

use crate::catalog::ServerCatalog;
use crate::events::{ConnectionEvent, EventBus, TeardownReport};
use crate::process::{ProcessError, ProxyProcess};
use crate::selector::{SelectionPolicy, resolve_target};
use crate::server::{ServerDescriptor, ServerId};
use crate::state::{ConnectionState, DisconnectReason};
use crossbeam_channel::Receiver;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};
use veil_redirect::{
    CrashRecoveryScanner, DnsRedirector, RecoveryReport, RedirectError, SystemNetworkRedirector,
};

/// Connect failures
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Another connect or disconnect is in progress")]
    InProgress,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("No server available")]
    NoServerAvailable,

    #[error("Failed to start proxy process: {0}")]
    ProcessStart(#[from] ProcessError),

    #[error("Failed to redirect system network: {0}")]
    RedirectionFailed(#[source] RedirectError),

    #[error("Crash recovery failed: {0}")]
    Recovery(#[source] RedirectError),
}

/// Collaborators of a [`ConnectionManager`]
pub struct ManagerParts {
    pub catalog: Arc<dyn ServerCatalog>,
    pub process: Arc<dyn ProxyProcess>,
    pub proxy: Arc<SystemNetworkRedirector>,
    /// Always needed for recovery, even with DNS redirection off
    pub dns: Arc<DnsRedirector>,
    pub dns_enabled: bool,
    pub policy: SelectionPolicy,
}

#[derive(Debug, Default)]
struct Session {
    state: ConnectionState,
    reason: DisconnectReason,
    connected_at: Option<Instant>,
    server: Option<ServerDescriptor>,
    /// Manual server choice
    selection: Option<ServerId>,
    /// DNS was redirected by the current connection
    dns_active: bool,
    /// Bumped on every process start; exits of older starts are stale
    generation: u64,
}

struct Inner {
    catalog: Arc<dyn ServerCatalog>,
    process: Arc<dyn ProxyProcess>,
    proxy: Arc<SystemNetworkRedirector>,
    dns: Arc<DnsRedirector>,
    dns_enabled: bool,
    policy: SelectionPolicy,
    scanner: CrashRecoveryScanner,
    op_lock: AsyncMutex<()>,
    session: Mutex<Session>,
    events: EventBus,
}

/// Serialized connection state machine
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(parts: ManagerParts) -> Self {
        let scanner = CrashRecoveryScanner::new(parts.proxy.clone(), parts.dns.clone());
        let inner = Arc::new(Inner {
            catalog: parts.catalog,
            process: parts.process,
            proxy: parts.proxy,
            dns: parts.dns,
            dns_enabled: parts.dns_enabled,
            policy: parts.policy,
            scanner,
            op_lock: AsyncMutex::new(()),
            session: Mutex::new(Session::default()),
            events: EventBus::new(),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .process
            .on_unexpected_exit(Arc::new(move |code| watchdog(&weak, code)));

        Self { inner }
    }

    /// Receive lifecycle events
    pub fn subscribe(&self) -> Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.session().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Why the last connection ended; cleared by a successful connect
    pub fn disconnect_reason(&self) -> DisconnectReason {
        self.inner.session().reason
    }

    pub fn current_server(&self) -> Option<ServerDescriptor> {
        self.inner.session().server.clone()
    }

    pub fn connection_duration(&self) -> Option<Duration> {
        self.inner.session().connected_at.map(|t| t.elapsed())
    }

    /// Use `id` for the next connect instead of automatic selection
    pub fn select_server(&self, id: ServerId) {
        info!("Server {} selected", id);
        self.inner.session().selection = Some(id);
    }

    pub fn clear_selection(&self) {
        self.inner.session().selection = None;
    }

    pub fn selection(&self) -> Option<ServerId> {
        self.inner.session().selection.clone()
    }

    /// Server the next connect would use
    pub async fn preview_target(&self) -> Option<ServerDescriptor> {
        self.inner.resolve().await
    }

    /// One-line summary
    pub fn status(&self) -> String {
        let session = self.inner.session();
        match (&session.state, &session.server) {
            (ConnectionState::Connected, Some(server)) => {
                let secs = session.connected_at.map(|t| t.elapsed().as_secs()).unwrap_or(0);
                format!("Connected to {} ({}) for {}s", server.name, server.id, secs)
            }
            (ConnectionState::Disconnected, _) if session.reason != DisconnectReason::None => {
                format!("Disconnected ({})", session.reason)
            }
            (state, _) => state.to_string(),
        }
    }

    /// Run the crash recovery scan.
    ///
    /// Only valid while disconnected, since a live connection has backups
    /// of its own.
    pub async fn recover(&self) -> Result<RecoveryReport, ConnectError> {
        let _op = self.inner.op_lock.lock().await;
        if self.state() != ConnectionState::Disconnected {
            return Err(ConnectError::AlreadyConnected);
        }
        self.inner.run_recovery().await
    }

    /// Connect to the manually selected or best server
    pub async fn connect(&self) -> Result<ServerDescriptor, ConnectError> {
        let _op = self
            .inner
            .op_lock
            .try_lock()
            .map_err(|_| ConnectError::InProgress)?;

        match self.state() {
            ConnectionState::Disconnected => {}
            ConnectionState::Connected => return Err(ConnectError::AlreadyConnected),
            _ => return Err(ConnectError::InProgress),
        }

        self.inner.set_state(ConnectionState::Connecting);
        match self.inner.establish().await {
            Ok(server) => Ok(server),
            Err(e) => {
                error!("Connect failed: {}", e);
                self.inner.set_state(ConnectionState::Disconnected);
                self.inner.events.emit(ConnectionEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Tear the connection down; a no-op when not connected
    pub async fn disconnect(&self) -> TeardownReport {
        let _op = self.inner.op_lock.lock().await;
        self.inner.teardown(DisconnectReason::UserRequested).await
    }

    /// Settings that need a reconnect changed; disconnects if connected
    pub async fn notify_settings_changed(&self) -> Option<TeardownReport> {
        let _op = self.inner.op_lock.lock().await;
        if !self.state().is_connected() {
            return None;
        }
        info!("Settings changed, disconnecting");
        Some(self.inner.teardown(DisconnectReason::SettingsChanged).await)
    }
}

/// Exit callback registered with the process controller
fn watchdog(inner: &Weak<Inner>, code: Option<i32>) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let generation = inner.session().generation;
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { inner.handle_process_exit(code, generation).await });
        }
        Err(_) => warn!("Proxy process exited (code {:?}) outside the runtime", code),
    }
}

impl Inner {
    fn session(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap()
    }

    fn set_state(&self, new: ConnectionState) {
        let old = std::mem::replace(&mut self.session().state, new);
        if old != new {
            debug!("State {} -> {}", old, new);
            self.events.emit(ConnectionEvent::StateChanged { old, new });
        }
    }

    async fn resolve(&self) -> Option<ServerDescriptor> {
        let servers = self.catalog.servers().await;
        let selection = self.session().selection.clone();
        let mut rng = rand::thread_rng();
        resolve_target(&servers, selection.as_ref(), &self.policy, &mut rng)
    }

    async fn run_recovery(&self) -> Result<RecoveryReport, ConnectError> {
        let report = self.scanner.scan().await.map_err(ConnectError::Recovery)?;
        if report.found_anything() {
            self.events
                .emit(ConnectionEvent::RecoveryPerformed(report.clone()));
        }
        Ok(report)
    }

    /// Connect steps after the state moved to `Connecting`
    async fn establish(&self) -> Result<ServerDescriptor, ConnectError> {
        if !self.scanner.has_run() {
            self.run_recovery().await?;
        }

        let server = self.resolve().await.ok_or(ConnectError::NoServerAvailable)?;
        info!("Connecting to {}", server);

        self.session().generation += 1;
        // Nothing is redirected yet, so a failed start needs no unwinding
        self.process.start(&server).await?;

        if let Err(e) = self.proxy.enable().await {
            self.unwind(false).await;
            return Err(ConnectError::RedirectionFailed(e));
        }

        if self.dns_enabled {
            if let Err(e) = self.dns.setup().await {
                self.unwind(true).await;
                return Err(ConnectError::RedirectionFailed(e));
            }
        }

        {
            let mut session = self.session();
            session.connected_at = Some(Instant::now());
            session.server = Some(server.clone());
            session.reason = DisconnectReason::None;
            session.dns_active = self.dns_enabled;
        }
        self.set_state(ConnectionState::Connected);
        info!("Connected to {} ({})", server.name, server.endpoint());
        self.events.emit(ConnectionEvent::Connected {
            server: server.clone(),
        });
        Ok(server)
    }

    /// Undo a partially applied connect
    async fn unwind(&self, dns_touched: bool) {
        warn!("Rolling back partial connect");
        if dns_touched {
            let outcome = self.dns.teardown().await;
            if !outcome.is_clean() {
                warn!("DNS rollback incomplete; recovery will retry");
            }
        }
        let outcome = self.proxy.disable().await;
        if !outcome.is_clean() {
            warn!("Proxy rollback incomplete; recovery will retry");
        }
        self.process.stop().await;
    }

    /// Best-effort disconnect; the caller holds `op_lock`
    async fn teardown(&self, reason: DisconnectReason) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.session().state == ConnectionState::Disconnected {
            debug!("Disconnect while disconnected, nothing to do");
            return report;
        }

        info!("Disconnecting ({})", reason);
        self.set_state(ConnectionState::Disconnecting);

        let dns_active = self.session().dns_active;
        if dns_active {
            report.absorb(self.dns.teardown().await);
        }
        report.absorb(self.proxy.disable().await);
        self.process.stop().await;

        {
            let mut session = self.session();
            session.connected_at = None;
            session.server = None;
            session.dns_active = false;
            session.reason = reason;
        }
        self.set_state(ConnectionState::Disconnected);

        if report.is_clean() {
            info!("Disconnected");
        } else {
            warn!(
                "Disconnected with {} restore failure(s): {}",
                report.failures.len(),
                report.failures.join("; ")
            );
        }
        self.events.emit(ConnectionEvent::Disconnected {
            reason,
            report: report.clone(),
        });
        report
    }

    async fn handle_process_exit(&self, code: Option<i32>, generation: u64) {
        let _op = self.op_lock.lock().await;
        {
            let session = self.session();
            if session.generation != generation {
                debug!("Exit (code {:?}) of an earlier proxy process, ignoring", code);
                return;
            }
            if session.state != ConnectionState::Connected {
                debug!("Proxy exit (code {:?}) while not connected, ignoring", code);
                return;
            }
        }
        warn!("Proxy process died while connected (code {:?})", code);
        self.teardown(DisconnectReason::ProcessExited).await;
    }
}
