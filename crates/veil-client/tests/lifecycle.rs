//! End-to-end connection lifecycle against in-memory and file backends

use crossbeam_channel::Receiver;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use veil_client::{
    ConnectError, ConnectionEvent, ConnectionManager, ConnectionState, DisconnectReason,
    ManagerParts, ScriptedProcess, SelectionPolicy, ServerDescriptor, StaticCatalog,
    TeardownReport,
};
use veil_redirect::{
    DnsRedirector, DnsSettings, INTERNET_SETTINGS, PROXY_ENABLE, PROXY_SERVER, ProxySettings,
    SystemNetworkRedirector,
};
use veil_sysconf::{
    ConfigKey, ConfigValue, DnsSource, FileStore, MemoryAdapters, MemoryStore, SystemConfigStore,
};

struct Harness {
    adapters: Arc<MemoryAdapters>,
    process: Arc<ScriptedProcess>,
    proxy: Arc<SystemNetworkRedirector>,
    manager: ConnectionManager,
}

fn harness(
    store: Arc<dyn SystemConfigStore>,
    adapters: Arc<MemoryAdapters>,
    resolver_port: u16,
) -> Harness {
    let process = Arc::new(ScriptedProcess::new());
    let proxy = Arc::new(SystemNetworkRedirector::new(
        store.clone(),
        ProxySettings::loopback(10809),
    ));
    let dns = Arc::new(DnsRedirector::new(
        store,
        adapters.clone(),
        adapters.clone(),
        DnsSettings::with_resolver_port(resolver_port),
    ));
    let catalog = Arc::new(StaticCatalog::new(vec![
        ServerDescriptor::new("de-1", "Frankfurt", "DE", "185.186.78.1".parse().unwrap(), 443)
            .with_latency(35),
        ServerDescriptor::new("jp-1", "Tokyo", "JP", "103.231.88.1".parse().unwrap(), 443)
            .with_latency(240),
    ]));
    let manager = ConnectionManager::new(ManagerParts {
        catalog,
        process: process.clone(),
        proxy: proxy.clone(),
        dns,
        dns_enabled: true,
        policy: SelectionPolicy::default(),
    });
    Harness {
        adapters,
        process,
        proxy,
        manager,
    }
}

fn ethernet() -> Arc<MemoryAdapters> {
    Arc::new(MemoryAdapters::with_adapters([(
        "Ethernet",
        DnsSource::Static(vec!["9.9.9.9".parse().unwrap()]),
    )]))
}

async fn wait_for_disconnect(
    events: &Receiver<ConnectionEvent>,
) -> (DisconnectReason, TeardownReport) {
    for _ in 0..500 {
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::Disconnected { reason, report } = event {
                return (reason, report);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no Disconnected event");
}

#[tokio::test]
async fn test_watchdog_disconnects_on_process_exit() {
    let store = Arc::new(MemoryStore::new());
    let h = harness(store.clone(), ethernet(), 5353);
    let events = h.manager.subscribe();

    let server = h.manager.connect().await.unwrap();
    assert_eq!(server.id.as_str(), "de-1");
    assert_eq!(h.adapters.rules().len(), 1);

    h.process.crash(Some(-1));
    let (reason, report) = wait_for_disconnect(&events).await;

    assert_eq!(reason, DisconnectReason::ProcessExited);
    assert!(report.is_clean());
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    assert_eq!(h.manager.disconnect_reason(), DisconnectReason::ProcessExited);
    assert!(!store.contains(&h.proxy.key(PROXY_ENABLE)));
    assert!(h.adapters.rules().is_empty());
    assert_eq!(
        h.adapters.source_of("Ethernet"),
        Some(DnsSource::Static(vec!["9.9.9.9".parse().unwrap()]))
    );
}

#[tokio::test]
async fn test_connect_while_connecting_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let h = harness(store.clone(), ethernet(), 53);
    let gate = Arc::new(Notify::new());
    h.process.hold_start(gate.clone());

    let first = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.connect().await })
    };
    while h.manager.state() != ConnectionState::Connecting {
        tokio::task::yield_now().await;
    }

    let err = h.manager.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::InProgress));
    // The first connect is parked in process start; nothing was written
    assert!(store.log().is_empty());
    assert!(h.adapters.log().is_empty());

    gate.notify_one();
    first.await.unwrap().unwrap();

    assert_eq!(h.manager.state(), ConnectionState::Connected);
    assert_eq!(h.process.start_count(), 1);
    // No forwarding for a resolver on the standard port
    assert!(h.adapters.rules().is_empty());
}

#[tokio::test]
async fn test_events_follow_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    let h = harness(store, ethernet(), 53);
    let events = h.manager.subscribe();

    h.manager.connect().await.unwrap();
    h.manager.disconnect().await;

    let states: Vec<ConnectionState> = events
        .try_iter()
        .filter_map(|e| match e {
            ConnectionEvent::StateChanged { new, .. } => Some(new),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        ]
    );
}

#[tokio::test]
async fn test_restart_after_crash_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let adapters = ethernet();

    {
        let store = Arc::new(FileStore::open(&path).unwrap());
        store
            .set(
                &ConfigKey::new(INTERNET_SETTINGS, PROXY_SERVER),
                &ConfigValue::text("corp:3128"),
            )
            .await
            .unwrap();
        let h = harness(store, adapters.clone(), 53);
        h.manager.connect().await.unwrap();
        // Dropped while connected: the session dies without restoring
    }
    assert_eq!(
        adapters.source_of("Ethernet"),
        Some(DnsSource::single(Ipv4Addr::LOCALHOST))
    );

    let store = Arc::new(FileStore::open(&path).unwrap());
    let h = harness(store.clone(), adapters.clone(), 53);

    let report = h.manager.recover().await.unwrap();
    assert!(report.proxy_restored);
    assert!(report.dns_restored);
    assert!(report.is_clean());

    assert_eq!(
        store.get(&h.proxy.key(PROXY_SERVER)).await.unwrap(),
        Some(ConfigValue::text("corp:3128"))
    );
    assert_eq!(store.get(&h.proxy.key(PROXY_ENABLE)).await.unwrap(), None);
    assert_eq!(
        adapters.source_of("Ethernet"),
        Some(DnsSource::Static(vec!["9.9.9.9".parse().unwrap()]))
    );
}
