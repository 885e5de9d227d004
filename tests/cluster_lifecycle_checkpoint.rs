#[path = "support/env.rs"]
mod env;
#[path = "support/fixtures.rs"]
mod fixtures;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::Request;
use env::EnvVarGuard;
use fixtures::{
    control_config, init_logging, sample_bundle, seed_identity, FakeDriver, MemoryConnector,
};
use keystrap::bootstrap::{storage_key, Bundle};
use keystrap::cluster::{
    secret_name, ExtensionError, HttpBootstrapper, KvSecrets, SnapshotRestorer,
    SECRETS_NAMESPACE,
};
use keystrap::listener::shared_record_key;
use keystrap::{
    BootstrapError, Cluster, ClusterError, ControlConfig, DriverRegistry, KvClient,
    LifecycleStage, ManagedDriver, MemoryKv, StepError,
};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn bootstrap_keys(kv: &MemoryKv) -> Vec<String> {
    kv.keys()
        .into_iter()
        .filter(|key| key.starts_with("/bootstrap/"))
        .collect()
}

fn external_cluster(config: ControlConfig, kv: &Arc<MemoryKv>) -> Cluster {
    Cluster::new(
        config,
        DriverRegistry::empty(),
        MemoryConnector::new(kv.clone()),
        CancellationToken::new(),
    )
}

fn managed_registry(driver: &Arc<FakeDriver>) -> DriverRegistry {
    let driver: Arc<dyn ManagedDriver> = driver.clone();
    DriverRegistry::new(vec![driver], Some("etcd"))
}

fn step_source(err: &ClusterError) -> &StepError {
    err.step_source()
        .unwrap_or_else(|| panic!("expected a step failure, got {err}"))
}

#[tokio::test]
async fn fresh_server_saves_its_identity_under_the_empty_token() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = control_config(dir.path());
    seed_identity(&config);
    let kv = Arc::new(MemoryKv::new());
    let connector = MemoryConnector::new(kv.clone());
    let mut cluster = Cluster::new(
        config,
        DriverRegistry::empty(),
        connector.clone(),
        CancellationToken::new(),
    );

    cluster.bootstrap().await.unwrap();
    let state = cluster.state();
    assert!(state.should_bootstrap);
    assert!(state.joining);
    assert!(state.storage_started);
    assert!(state.save_bootstrap);
    assert_eq!(cluster.stage(), LifecycleStage::BootstrapDecided);
    assert!(bootstrap_keys(&kv).is_empty());

    let ready = cluster.start().await.unwrap();
    assert!(*ready.borrow());
    assert_eq!(cluster.stage(), LifecycleStage::Ready);
    assert_eq!(connector.listens.load(Ordering::SeqCst), 1);
    assert_eq!(cluster.config().datastore.endpoint, "memory://local");
    assert_eq!(bootstrap_keys(&kv), vec![storage_key("")]);
    assert!(kv.keys().contains(&shared_record_key()));
    cluster.shutdown().await;
}

#[tokio::test]
async fn joining_server_restores_the_bundle_from_storage() {
    init_logging();
    let kv = Arc::new(MemoryKv::new());

    let first_dir = tempfile::tempdir().unwrap();
    let mut first_config = control_config(first_dir.path());
    first_config.token = "s3cret".into();
    let ca = seed_identity(&first_config);
    let mut first = external_cluster(first_config, &kv);
    first.bootstrap().await.unwrap();
    first.start().await.unwrap();
    assert_eq!(bootstrap_keys(&kv), vec![storage_key("s3cret")]);

    let second_dir = tempfile::tempdir().unwrap();
    let mut second_config = control_config(second_dir.path());
    second_config.token = "K10abcdef::server:s3cret".into();
    let paths = second_config.runtime.bootstrap.clone();
    let mut second = external_cluster(second_config, &kv);
    second.bootstrap().await.unwrap();
    assert!(!second.state().save_bootstrap);
    assert_eq!(fs::read_to_string(&paths.server_ca).unwrap(), ca);
    assert_eq!(fs::read(&paths.client_ca).unwrap(), b"client-ca");
    assert!(!paths.etcd_peer_ca.exists());

    second.start().await.unwrap();
    assert_eq!(bootstrap_keys(&kv), vec![storage_key("s3cret")]);
    second.shutdown().await;
    first.shutdown().await;
}

#[tokio::test]
async fn learner_replica_joins_without_writing() {
    init_logging();
    let kv = Arc::new(MemoryKv::new());
    let first_dir = tempfile::tempdir().unwrap();
    let mut first_config = control_config(first_dir.path());
    first_config.token = "s3cret".into();
    seed_identity(&first_config);
    let mut first = external_cluster(first_config, &kv);
    first.bootstrap().await.unwrap();
    first.start().await.unwrap();
    first.shutdown().await;

    let serving = kv.get(&shared_record_key()).await.unwrap().unwrap();
    kv.delete(&serving.key, serving.revision).await.unwrap();
    kv.set_learner(true);
    let revision = kv.revision();

    let second_dir = tempfile::tempdir().unwrap();
    let mut second_config = control_config(second_dir.path());
    second_config.token = "s3cret".into();
    let mut second = external_cluster(second_config, &kv);
    second.bootstrap().await.unwrap();
    let ready = second.start().await.unwrap();
    assert!(*ready.borrow());
    assert_eq!(second.stage(), LifecycleStage::Ready);
    assert!(!kv.keys().contains(&shared_record_key()));
    assert_eq!(kv.revision(), revision);
    second.shutdown().await;
}

#[tokio::test]
async fn joining_with_a_different_token_is_rejected() {
    init_logging();
    let kv = Arc::new(MemoryKv::new());
    let first_dir = tempfile::tempdir().unwrap();
    let mut first_config = control_config(first_dir.path());
    first_config.token = "right".into();
    seed_identity(&first_config);
    let mut first = external_cluster(first_config, &kv);
    first.bootstrap().await.unwrap();
    first.start().await.unwrap();

    let second_dir = tempfile::tempdir().unwrap();
    let mut second_config = control_config(second_dir.path());
    second_config.token = "wrong".into();
    let mut second = external_cluster(second_config, &kv);
    let err = second.bootstrap().await.unwrap_err();
    assert!(matches!(
        step_source(&err),
        StepError::Bootstrap(BootstrapError::TokenMismatch)
    ));
    first.shutdown().await;
}

#[tokio::test]
async fn operations_run_once_and_in_order() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = control_config(dir.path());
    seed_identity(&config);
    let kv = Arc::new(MemoryKv::new());
    let mut cluster = external_cluster(config, &kv);

    let err = cluster.start().await.unwrap_err();
    assert!(matches!(
        err,
        ClusterError::InvalidStage {
            operation: "start",
            actual: LifecycleStage::Unstarted,
            ..
        }
    ));
    cluster.bootstrap().await.unwrap();
    assert!(matches!(
        cluster.bootstrap().await,
        Err(ClusterError::InvalidStage { .. })
    ));
}

#[tokio::test]
async fn disabled_datastore_is_unsupported() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = control_config(dir.path());
    config.disable_etcd = true;
    seed_identity(&config);
    let kv = Arc::new(MemoryKv::new());
    let mut cluster = external_cluster(config, &kv);
    cluster.bootstrap().await.unwrap();
    let err = cluster.start().await.unwrap_err();
    assert!(matches!(step_source(&err), StepError::Unsupported(_)));
    cluster.shutdown().await;
}

#[tokio::test]
async fn managed_cluster_init_starts_the_driver_without_bootstrapping() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = control_config(dir.path());
    config.cluster_init = true;
    seed_identity(&config);
    let kv = Arc::new(MemoryKv::new());
    let driver = FakeDriver::new("etcd");
    let mut cluster = Cluster::new(
        config,
        managed_registry(&driver),
        MemoryConnector::new(kv.clone()),
        CancellationToken::new(),
    );

    cluster.bootstrap().await.unwrap();
    assert!(!cluster.state().should_bootstrap);
    assert!(!cluster.state().storage_started);
    assert!(cluster.config().runtime.http_bootstrap);
    assert_eq!(
        cluster.managed_driver().map(|driver| driver.endpoint_name()),
        Some("etcd")
    );

    let ready = cluster.start().await.unwrap();
    assert!(*ready.borrow());
    assert_eq!(driver.starts.load(Ordering::SeqCst), 1);
    assert!(bootstrap_keys(&kv).is_empty());

    let router = cluster.listener().unwrap().handlers().current();
    let response = router
        .oneshot(Request::get("/db/info").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = to_bytes(response.into_body(), 64).await.unwrap();
    assert_eq!(&body[..], b"etcd");
    cluster.shutdown().await;
}

#[tokio::test]
async fn managed_join_without_http_bootstrap_support_fails() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = control_config(dir.path());
    config.token = "s3cret".into();
    config.join_url = "https://10.0.0.1:9345".into();
    let kv = Arc::new(MemoryKv::new());
    let driver = FakeDriver::new("etcd");
    let mut cluster = Cluster::new(
        config,
        managed_registry(&driver),
        MemoryConnector::new(kv),
        CancellationToken::new(),
    );
    let err = cluster.bootstrap().await.unwrap_err();
    assert!(matches!(
        step_source(&err),
        StepError::Extension(ExtensionError::Unsupported(_))
    ));
}

struct PeerBootstrapper;

#[async_trait]
impl HttpBootstrapper for PeerBootstrapper {
    async fn fetch(&self, config: &ControlConfig) -> Result<Bundle, ExtensionError> {
        assert_eq!(config.join_url, "https://10.0.0.1:9345");
        Ok(sample_bundle("peer"))
    }
}

#[tokio::test]
async fn managed_join_writes_the_fetched_bundle() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = control_config(dir.path());
    config.token = "s3cret".into();
    config.join_url = "https://10.0.0.1:9345".into();
    let paths = config.runtime.bootstrap.clone();
    let kv = Arc::new(MemoryKv::new());
    let driver = FakeDriver::new("etcd");
    let mut cluster = Cluster::new(
        config,
        managed_registry(&driver),
        MemoryConnector::new(kv.clone()),
        CancellationToken::new(),
    )
    .with_http_bootstrapper(Arc::new(PeerBootstrapper));

    cluster.bootstrap().await.unwrap();
    assert!(cluster.state().should_bootstrap);
    assert!(!cluster.state().storage_started);
    assert_eq!(fs::read(&paths.server_ca).unwrap(), b"ca-peer");
    assert_eq!(fs::read(&paths.server_ca_key).unwrap(), b"key-peer");
    assert!(kv.keys().is_empty());
}

#[derive(Default)]
struct CountingRestorer {
    resets: AtomicUsize,
}

#[async_trait]
impl SnapshotRestorer for CountingRestorer {
    async fn reset(&self, config: &ControlConfig) -> Result<(), ExtensionError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(config.reset_file().parent().unwrap())
            .map_err(|err| ExtensionError::Failed(err.to_string()))?;
        fs::write(config.reset_file(), b"")
            .map_err(|err| ExtensionError::Failed(err.to_string()))
    }

    async fn restore(&self, _config: &ControlConfig, _snapshot: &Path) -> Result<(), ExtensionError> {
        Err(ExtensionError::Failed("no snapshot in test".into()))
    }
}

fn write_reset_flag(config: &ControlConfig) {
    let flag = config.reset_file();
    fs::create_dir_all(flag.parent().unwrap()).unwrap();
    fs::write(flag, b"").unwrap();
}

#[tokio::test]
async fn repeated_cluster_reset_is_refused() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = control_config(dir.path());
    config.cluster_reset = true;
    seed_identity(&config);
    write_reset_flag(&config);
    let driver = FakeDriver::initialized("etcd");
    let mut cluster = Cluster::new(
        config,
        managed_registry(&driver),
        MemoryConnector::new(Arc::new(MemoryKv::new())),
        CancellationToken::new(),
    )
    .with_snapshot_restorer(Arc::new(CountingRestorer::default()));

    cluster.bootstrap().await.unwrap();
    let err = cluster.start().await.unwrap_err();
    assert!(matches!(
        step_source(&err),
        StepError::ResetAlreadyPerformed(_)
    ));
    assert_eq!(driver.starts.load(Ordering::SeqCst), 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn cluster_reset_requires_a_restorer() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = control_config(dir.path());
    config.cluster_reset = true;
    seed_identity(&config);
    let driver = FakeDriver::initialized("etcd");
    let mut cluster = Cluster::new(
        config,
        managed_registry(&driver),
        MemoryConnector::new(Arc::new(MemoryKv::new())),
        CancellationToken::new(),
    );
    cluster.bootstrap().await.unwrap();
    let err = cluster.start().await.unwrap_err();
    assert!(matches!(
        step_source(&err),
        StepError::Extension(ExtensionError::Unsupported(_))
    ));
    cluster.shutdown().await;
}

#[tokio::test]
async fn cluster_reset_runs_the_restorer_before_the_driver() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = control_config(dir.path());
    config.cluster_reset = true;
    seed_identity(&config);
    let driver = FakeDriver::initialized("etcd");
    let restorer = Arc::new(CountingRestorer::default());
    let mut cluster = Cluster::new(
        config,
        managed_registry(&driver),
        MemoryConnector::new(Arc::new(MemoryKv::new())),
        CancellationToken::new(),
    )
    .with_snapshot_restorer(restorer.clone());

    cluster.bootstrap().await.unwrap();
    cluster.start().await.unwrap();
    assert_eq!(restorer.resets.load(Ordering::SeqCst), 1);
    assert_eq!(driver.starts.load(Ordering::SeqCst), 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn restart_after_reset_clears_listener_cache_and_node_password() {
    init_logging();
    let _node = EnvVarGuard::set("NODE_NAME", "Node-A");
    let dir = tempfile::tempdir().unwrap();
    let config = control_config(dir.path());
    seed_identity(&config);
    write_reset_flag(&config);
    let kv = Arc::new(MemoryKv::new());
    let secret = KvSecrets::key(SECRETS_NAMESPACE, &secret_name("Node-A"));
    kv.create(&secret, b"hash".to_vec()).await.unwrap();

    // A stale cache that could not be parsed would fail the listener.
    let cache = dir.path().join("tls").join("dynamic-cert.json");
    fs::write(&cache, b"not json").unwrap();

    let driver = FakeDriver::initialized("etcd");
    let mut cluster = Cluster::new(
        config.clone(),
        managed_registry(&driver),
        MemoryConnector::new(kv.clone()),
        CancellationToken::new(),
    );
    cluster.bootstrap().await.unwrap();
    cluster.start().await.unwrap();
    assert!(!config.reset_file().exists());
    assert!(cache.exists());

    tokio::time::timeout(Duration::from_secs(15), async {
        while kv.get(&secret).await.unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("node password secret was not deleted");
    cluster.shutdown().await;
}
