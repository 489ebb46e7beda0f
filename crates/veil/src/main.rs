//! veil: system proxy client
//!
//! Connects through the local proxy process and redirects the machine's
//! HTTP proxy and DNS, restoring them on exit or on the next start.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use veil_client::{
    ClientConfig, CommandProcess, ConnectionEvent, ConnectionManager, ManagerParts, ServerId,
    StaticCatalog, StoreBackend, TeardownReport,
};
use veil_redirect::{DnsRedirector, RecoveryReport, SystemNetworkRedirector};
use veil_sysconf::{
    FileStore, MemoryAdapters, NetworkAdapterConfigurator, PortForwarder, SystemConfigStore,
};

// Use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// veil - route this machine through a personal proxy
#[derive(Parser)]
#[command(name = "veil")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (TOML or JSON)
    #[arg(short, long, default_value = "veil.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Keep all state in the state file and leave OS settings alone
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and stay connected until Ctrl+C
    Connect {
        /// Server id to use instead of automatic selection
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Restore settings left redirected by a crashed session
    Recover,

    /// Unconditionally restore proxy and DNS settings
    Restore,

    /// List servers and the automatic pick
    Servers,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "veil.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    if let Commands::GenConfig { output } = &cli.command {
        return generate_config(output);
    }

    let config = load_config(&cli.config)?;
    let system = System::new(&config, cli.dry_run)?;

    match cli.command {
        Commands::Connect { server } => run_connect(&config, &system, server).await,
        Commands::Recover => run_recover(&config, &system).await,
        Commands::Restore => run_restore(&system).await,
        Commands::Servers => run_servers(&config, &system).await,
        Commands::GenConfig { .. } => unreachable!("handled above"),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();
}

fn load_config(path: &Path) -> Result<ClientConfig> {
    if !path.exists() {
        warn!("No configuration at {:?}, using defaults", path);
        return Ok(ClientConfig::default_config());
    }
    let config = ClientConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))?;
    info!("Configuration loaded from {:?}", path);
    Ok(config)
}

/// The OS-facing collaborators for this run
struct System {
    proxy: Arc<SystemNetworkRedirector>,
    dns: Arc<DnsRedirector>,
}

impl System {
    fn new(config: &ClientConfig, dry_run: bool) -> Result<Self> {
        let (store, adapters, forwarder): (
            Arc<dyn SystemConfigStore>,
            Arc<dyn NetworkAdapterConfigurator>,
            Arc<dyn PortForwarder>,
        ) = if dry_run || config.store.backend == StoreBackend::File {
            let path = config.store.state_file();
            info!("Using state file {:?}; OS settings are not touched", path);
            let store = FileStore::open(&path)
                .with_context(|| format!("Failed to open state file {:?}", path))?;
            let adapters = Arc::new(MemoryAdapters::new());
            (Arc::new(store), adapters.clone(), adapters)
        } else {
            let (adapters, forwarder) = veil_sysconf::platform_adapters();
            (veil_sysconf::platform_store(), adapters, forwarder)
        };

        let proxy = Arc::new(SystemNetworkRedirector::new(store.clone(), config.proxy_settings()));
        let dns = Arc::new(DnsRedirector::new(store, adapters, forwarder, config.dns_settings()));
        Ok(Self { proxy, dns })
    }

    fn manager(&self, config: &ClientConfig) -> ConnectionManager {
        ConnectionManager::new(ManagerParts {
            catalog: Arc::new(StaticCatalog::new(config.servers.clone())),
            process: Arc::new(CommandProcess::new(config.process_spec())),
            proxy: self.proxy.clone(),
            dns: self.dns.clone(),
            dns_enabled: config.dns.enabled,
            policy: config.selection,
        })
    }
}

async fn run_connect(config: &ClientConfig, system: &System, server: Option<String>) -> Result<()> {
    let manager = system.manager(config);
    let events = manager.subscribe();

    print_recovery(&manager.recover().await?);

    if let Some(id) = server {
        manager.select_server(ServerId::new(id));
    }
    let server = manager.connect().await.context("Failed to connect")?;
    println!("Connected to {}", server);

    // Blocks until the connection ends for any reason
    let ended = tokio::task::spawn_blocking(move || {
        for event in events.iter() {
            if let ConnectionEvent::Disconnected { reason, .. } = event {
                return Some(reason);
            }
        }
        None
    });

    tokio::select! {
        _ = wait_for_shutdown() => {
            info!("Shutting down...");
            let report = manager.disconnect().await;
            print_teardown(&report);
        }
        reason = ended => {
            let reason = reason.context("Event watcher failed")?;
            println!("{}", manager.status());
            if let Some(reason) = reason {
                bail!("Connection ended: {}", reason);
            }
        }
    }
    Ok(())
}

async fn run_recover(config: &ClientConfig, system: &System) -> Result<()> {
    let manager = system.manager(config);
    let report = manager.recover().await?;
    print_recovery(&report);
    if !report.found_anything() {
        println!("Nothing to recover");
    }
    Ok(())
}

async fn run_restore(system: &System) -> Result<()> {
    let mut report = TeardownReport::default();
    for outcome in [system.dns.teardown().await, system.proxy.disable().await] {
        report.warnings.extend(outcome.warnings);
        report
            .failures
            .extend(outcome.failures.iter().map(|e| e.to_string()));
    }
    print_teardown(&report);
    if !report.is_clean() {
        bail!("Restore incomplete");
    }
    println!("Proxy and DNS settings restored");
    Ok(())
}

async fn run_servers(config: &ClientConfig, system: &System) -> Result<()> {
    if config.servers.is_empty() {
        println!("No servers configured");
        return Ok(());
    }

    for server in &config.servers {
        println!("  {:<8} {}", server.id, server);
    }

    let manager = system.manager(config);
    if let Some(best) = manager.preview_target().await {
        println!("\nAutomatic choice: {} ({})", best.name, best.id);
    }
    Ok(())
}

fn generate_config(output: &Path) -> Result<()> {
    let sample = ClientConfig::default_config().to_toml();

    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nSet proxy.binary and the server list before connecting.");
    Ok(())
}

fn print_recovery(report: &RecoveryReport) {
    if !report.found_anything() {
        return;
    }
    println!(
        "Recovered settings from an unclean shutdown (proxy: {}, dns: {})",
        report.proxy_restored, report.dns_restored
    );
    for failure in &report.failures {
        println!("  failed: {}", failure);
    }
}

fn print_teardown(report: &TeardownReport) {
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
    for failure in &report.failures {
        println!("  failed: {}", failure);
    }
    if !report.is_clean() {
        println!("Some settings could not be restored; run `veil recover` to retry");
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let Ok(mut sigterm) = signal::unix::signal(signal::unix::SignalKind::terminate()) else {
            warn!("Failed to register SIGTERM handler");
            let _ = signal::ctrl_c().await;
            return;
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = signal::ctrl_c() => info!("Received Ctrl+C"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C");
    }
}
