//! Crash recovery across a simulated process restart

use std::net::Ipv4Addr;
use std::sync::Arc;
use veil_redirect::{
    BackupRecord, CrashRecoveryScanner, DNS_BACKUP_GROUP, DnsRedirector, DnsSettings,
    PROXY_ENABLE, PROXY_SERVER, ProxySettings, SystemNetworkRedirector,
};
use veil_sysconf::{
    ConfigValue, DnsSource, FileStore, MemoryAdapters, MemoryStore, SystemConfigStore,
};

fn redirectors(
    store: Arc<dyn SystemConfigStore>,
    adapters: Arc<MemoryAdapters>,
    resolver_port: u16,
) -> (Arc<SystemNetworkRedirector>, Arc<DnsRedirector>) {
    let proxy = Arc::new(SystemNetworkRedirector::new(
        store.clone(),
        ProxySettings::loopback(10809),
    ));
    let dns = Arc::new(DnsRedirector::new(
        store,
        adapters.clone(),
        adapters,
        DnsSettings::with_resolver_port(resolver_port),
    ));
    (proxy, dns)
}

#[tokio::test]
async fn test_preseeded_backup_is_restored() {
    let store = Arc::new(MemoryStore::new());
    let adapters = Arc::new(MemoryAdapters::new());
    let (proxy, dns) = redirectors(store.clone(), adapters, 53);

    // Live key still holds the proxy value; the shadow holds the original
    let key = proxy.key(PROXY_SERVER);
    store.seed(&key, ConfigValue::text("127.0.0.1:10809"));
    store.seed(
        &key.shadow(),
        BackupRecord::Original(ConfigValue::text("corp:3128")).encode(),
    );

    let scanner = CrashRecoveryScanner::new(proxy.clone(), dns);
    let report = scanner.scan().await.unwrap();

    assert!(report.proxy_restored);
    assert_eq!(store.value(&key), Some(ConfigValue::text("corp:3128")));
    assert!(!store.contains(&key.shadow()));
    // ProxyEnable had no backup; it is forced off
    assert_eq!(store.value(&proxy.key(PROXY_ENABLE)), Some(ConfigValue::Dword(0)));
}

#[tokio::test]
async fn test_recovery_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let adapters = Arc::new(MemoryAdapters::with_adapters([
        ("Ethernet", DnsSource::Static(vec!["8.8.8.8".parse().unwrap()])),
    ]));

    // First session redirects everything, then dies without restoring
    {
        let store = Arc::new(FileStore::open(&path).unwrap());
        let (proxy, dns) = redirectors(store, adapters.clone(), 5353);
        proxy.enable().await.unwrap();
        dns.setup().await.unwrap();
    }
    assert_eq!(adapters.rules().len(), 1);
    assert_eq!(
        adapters.source_of("Ethernet"),
        Some(DnsSource::single(Ipv4Addr::LOCALHOST))
    );

    // Second session finds the backups on disk
    let store = Arc::new(FileStore::open(&path).unwrap());
    let (proxy, dns) = redirectors(store.clone(), adapters.clone(), 5353);
    let scanner = CrashRecoveryScanner::new(proxy.clone(), dns.clone());

    let report = scanner.scan().await.unwrap();

    assert!(report.proxy_restored);
    assert!(report.dns_restored);
    assert!(report.is_clean());
    assert!(adapters.rules().is_empty());
    assert_eq!(
        adapters.source_of("Ethernet"),
        Some(DnsSource::Static(vec!["8.8.8.8".parse().unwrap()]))
    );
    assert!(!proxy.has_backup().await.unwrap());
    assert!(!dns.has_backup().await.unwrap());

    // Proxy keys were absent before the first session
    let reopened = FileStore::open(&path).unwrap();
    assert_eq!(reopened.get(&proxy.key(PROXY_ENABLE)).await.unwrap(), None);
    assert!(reopened.list(DNS_BACKUP_GROUP).await.unwrap().is_empty());

    // Nothing left for a third session
    let again = scanner.scan().await.unwrap();
    assert!(!again.found_anything());
}
