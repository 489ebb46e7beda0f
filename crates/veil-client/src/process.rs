//! Local proxy process control
//!
//! The proxy itself is an opaque executable. It is started with the
//! target server's address, considered up once its local listen port
//! accepts connections, and watched for exits nobody asked for.

use crate::server::ServerDescriptor;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Interval between readiness checks
const READY_POLL: Duration = Duration::from_millis(100);

/// Called with the exit code when the process dies on its own
pub type ExitCallback = Arc<dyn Fn(Option<i32>) + Send + Sync>;

/// Proxy process errors
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to launch {binary:?}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Proxy process exited during startup (code {0:?})")]
    ExitedEarly(Option<i32>),

    #[error("Proxy process not ready after {0:?}")]
    Timeout(Duration),

    #[error("Proxy process already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Controller for the local proxy process
#[async_trait]
pub trait ProxyProcess: Send + Sync {
    /// Start the proxy for `server` and wait until it is ready
    async fn start(&self, server: &ServerDescriptor) -> Result<(), ProcessError>;

    /// Stop the proxy; a no-op if it is not running
    async fn stop(&self);

    /// Register the watchdog callback for unexpected exits
    fn on_unexpected_exit(&self, callback: ExitCallback);
}

/// How to launch the proxy executable
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub binary: PathBuf,
    /// Argument templates; see [`ProcessSpec::render_args`]
    pub args: Vec<String>,
    pub listen_port: u16,
    pub dns_port: u16,
    pub start_timeout: Duration,
}

impl ProcessSpec {
    /// Expand `{ip}`, `{port}`, `{listen_port}` and `{dns_port}`
    pub fn render_args(&self, server: &ServerDescriptor) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{ip}", &server.ip.to_string())
                    .replace("{port}", &server.port.to_string())
                    .replace("{listen_port}", &self.listen_port.to_string())
                    .replace("{dns_port}", &self.dns_port.to_string())
            })
            .collect()
    }
}

struct Running {
    pid: Option<u32>,
    kill: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

/// Proxy run as a child process
pub struct CommandProcess {
    spec: ProcessSpec,
    running: tokio::sync::Mutex<Option<Running>>,
    on_exit: Mutex<Option<ExitCallback>>,
}

impl CommandProcess {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            running: tokio::sync::Mutex::new(None),
            on_exit: Mutex::new(None),
        }
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Wait for the listen port to accept connections.
    ///
    /// The child has to be alive after the port answers; a listener left
    /// by some other process does not count.
    async fn wait_ready(&self, child: &mut Child) -> Result<(), ProcessError> {
        let addr = (Ipv4Addr::LOCALHOST, self.spec.listen_port);
        loop {
            tokio::time::sleep(READY_POLL).await;
            let answered = TcpStream::connect(addr).await.is_ok();
            if let Some(status) = child.try_wait()? {
                return Err(ProcessError::ExitedEarly(status.code()));
            }
            if answered {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl ProxyProcess for CommandProcess {
    async fn start(&self, server: &ServerDescriptor) -> Result<(), ProcessError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ProcessError::AlreadyRunning);
        }

        let args = self.spec.render_args(server);
        info!("Starting proxy process {:?} for {}", self.spec.binary, server.endpoint());
        debug!("Proxy arguments: {:?}", args);

        let mut child = Command::new(&self.spec.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                binary: self.spec.binary.clone(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }

        let timeout = self.spec.start_timeout;
        match tokio::time::timeout(timeout, self.wait_ready(&mut child)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                warn!("Proxy process not ready after {:?}, killing it", timeout);
                let _ = child.kill().await;
                return Err(ProcessError::Timeout(timeout));
            }
        }

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        let on_exit = self.on_exit.lock().unwrap().clone();
        let monitor = tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => Some(status.ok().and_then(|s| s.code())),
                _ = kill_rx => None,
            };

            match exit {
                Some(code) => {
                    warn!("Proxy process exited unexpectedly (code {:?})", code);
                    if let Some(callback) = on_exit {
                        callback(code);
                    }
                }
                None => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill proxy process: {}", e);
                    }
                }
            }
        });

        info!("Proxy process ready (pid {:?})", pid);
        *running = Some(Running {
            pid,
            kill: kill_tx,
            monitor,
        });
        Ok(())
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        info!("Stopping proxy process (pid {:?})", running.pid);

        // Fails only if the monitor already saw the process exit
        let _ = running.kill.send(());
        if let Err(e) = running.monitor.await {
            warn!("Proxy monitor task failed: {}", e);
        }
    }

    fn on_unexpected_exit(&self, callback: ExitCallback) {
        *self.on_exit.lock().unwrap() = Some(callback);
    }
}

/// Relay child output into the log
async fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "veil::proxy", "[{}] {}", stream, line);
    }
}

/// In-process stand-in for the proxy, driven by tests
#[derive(Default)]
pub struct ScriptedProcess {
    running: AtomicBool,
    fail_start: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    last_server: Mutex<Option<ServerDescriptor>>,
    on_exit: Mutex<Option<ExitCallback>>,
}

impl ScriptedProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent starts fail
    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Hold every start until `gate` is notified
    pub fn hold_start(&self, gate: Arc<Notify>) {
        *self.gate.lock().unwrap() = Some(gate);
    }

    /// Simulate the process dying; fires the callback if it was running
    pub fn crash(&self, code: Option<i32>) {
        if self.running.swap(false, Ordering::SeqCst) {
            let callback = self.on_exit.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(code);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn last_server(&self) -> Option<ServerDescriptor> {
        self.last_server.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProxyProcess for ScriptedProcess {
    async fn start(&self, server: &ServerDescriptor) -> Result<(), ProcessError> {
        self.starts.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ProcessError::ExitedEarly(Some(1)));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProcessError::AlreadyRunning);
        }
        *self.last_server.lock().unwrap() = Some(server.clone());
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn on_unexpected_exit(&self, callback: ExitCallback) {
        *self.on_exit.lock().unwrap() = Some(callback);
    }
}
