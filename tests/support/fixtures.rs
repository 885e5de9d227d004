#![allow(dead_code)]

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use chrono::{TimeZone, Utc};
use keystrap::bootstrap::{Bundle, BundleFile};
use keystrap::cluster::{DatastoreConnector, DatastoreError, DriverError, ManagedDriver};
use keystrap::config::{ControlConfig, ControlRuntimeBootstrap, DatastoreConfig};
use keystrap::{KvClient, MemoryKv, StorageEndpoint};
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A fresh self-signed server CA as `(cert_pem, key_pem)`.
pub fn server_ca() -> (String, String) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, "keystrap-server-ca");
    params.distinguished_name = name;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

/// Config for a server rooted at `dir`, listening on an ephemeral loopback
/// port. No files are written.
pub fn control_config(dir: &Path) -> ControlConfig {
    let mut config = ControlConfig {
        data_dir: dir.to_path_buf(),
        bind_address: "127.0.0.1".into(),
        supervisor_port: 0,
        ..ControlConfig::default()
    };
    config.runtime.bootstrap = ControlRuntimeBootstrap::under(dir);
    config
}

/// Writes a server CA plus a few other bundle files, returning the CA PEM.
pub fn seed_identity(config: &ControlConfig) -> String {
    let (ca, key) = server_ca();
    let paths = &config.runtime.bootstrap;
    for (path, contents) in [
        (&paths.server_ca, ca.as_bytes()),
        (&paths.server_ca_key, key.as_bytes()),
        (&paths.client_ca, b"client-ca".as_slice()),
        (&paths.passwd_file, b"token,server,server".as_slice()),
    ] {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }
    ca
}

pub fn sample_bundle(marker: &str) -> Bundle {
    let timestamp = Utc.with_ymd_and_hms(2023, 5, 1, 12, 0, 0).unwrap();
    [("ServerCA", "ca"), ("ServerCAKey", "key")]
        .into_iter()
        .map(|(role, body)| {
            (
                role.to_string(),
                BundleFile {
                    timestamp,
                    content: format!("{body}-{marker}").into_bytes(),
                },
            )
        })
        .collect()
}

/// Hands out the same in-memory store to every server in a test.
pub struct MemoryConnector {
    pub kv: Arc<MemoryKv>,
    pub listens: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(kv: Arc<MemoryKv>) -> Arc<Self> {
        Arc::new(Self {
            kv,
            listens: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl DatastoreConnector for MemoryConnector {
    async fn listen(&self, _datastore: &DatastoreConfig) -> Result<StorageEndpoint, DatastoreError> {
        self.listens.fetch_add(1, Ordering::SeqCst);
        let client: Arc<dyn KvClient> = self.kv.clone();
        Ok(StorageEndpoint {
            endpoints: vec!["memory://local".into()],
            leader_elect: true,
            client,
        })
    }
}

/// A managed datastore that only records how it was driven.
pub struct FakeDriver {
    name: &'static str,
    pub initialized: AtomicBool,
    pub starts: AtomicUsize,
    ready: watch::Sender<bool>,
}

impl FakeDriver {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            initialized: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            ready: watch::channel(false).0,
        })
    }

    pub fn initialized(name: &'static str) -> Arc<Self> {
        let driver = Self::new(name);
        driver.initialized.store(true, Ordering::SeqCst);
        driver
    }
}

#[async_trait]
impl ManagedDriver for FakeDriver {
    fn endpoint_name(&self) -> &str {
        self.name
    }

    async fn is_initialized(&self, _config: &ControlConfig) -> Result<bool, DriverError> {
        Ok(self.initialized.load(Ordering::SeqCst))
    }

    fn register(&self, _config: &ControlConfig, router: Router) -> Result<Router, DriverError> {
        let name = self.name;
        Ok(router.route("/db/info", get(move || async move { name })))
    }

    async fn start(&self, _config: &ControlConfig) -> Result<(), DriverError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
        self.ready.send_replace(true);
        Ok(())
    }

    fn ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }
}
