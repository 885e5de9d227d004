//! Dynamic TLS listener for the supervisor port.
//!
//! The serving certificate is issued by the cluster server CA and cached in
//! memory, in a JSON file under the data directory, and (once storage is up)
//! in a record shared by every server. It is regenerated when missing,
//! expiring, lacking a required SAN, or when the regenerate marker file is
//! present at startup.

pub mod cert;
pub mod handler;
pub mod server;
pub mod storage;

pub use cert::{regeneration_reason, CertIssuer, CertRecord, RegenerateReason};
pub use handler::{base_router, HandlerChain, NOT_READY_BODY};
pub use server::CertResolver;
pub use storage::{FileStorage, KvStorage, LayeredStorage, MemoryStorage, TlsStorage};

use crate::config::{ControlConfig, TlsMinVersion, PROGRAM};
use crate::kv::{KvClient, KvError};
use cert::canonical_san;
use chrono::Utc;
use log::{info, warn};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

pub const CACHE_FILE: &str = "dynamic-cert.json";
pub const REGENERATE_MARKER: &str = "dynamic-cert-regenerate";

pub fn cache_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join("tls").join(CACHE_FILE)
}

pub fn regenerate_marker_path(data_dir: &Path) -> PathBuf {
    data_dir.join("tls").join(REGENERATE_MARKER)
}

/// KV key of the serving certificate shared by all servers.
pub fn shared_record_key() -> String {
    format!("/registry/secrets/kube-system/{PROGRAM}-serving")
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_address: String,
    pub port: u16,
    pub cache_file: PathBuf,
    pub regenerate_marker: PathBuf,
    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
    pub sans: Vec<String>,
    pub renew_days: u32,
    pub refresh_interval: Duration,
    pub tls_min_version: TlsMinVersion,
}

impl ListenerConfig {
    pub fn from_control(config: &ControlConfig) -> Self {
        let mut sans = config.sans.clone();
        sans.extend(
            [
                "kubernetes".to_string(),
                "kubernetes.default".to_string(),
                "kubernetes.default.svc".to_string(),
                format!("kubernetes.default.svc.{}", config.cluster_domain),
                "localhost".to_string(),
                "127.0.0.1".to_string(),
            ]
            .into_iter(),
        );
        if let Ok(ip) = config.bind_address.parse::<IpAddr>() {
            if !ip.is_unspecified() {
                sans.push(ip.to_string());
            }
        }
        Self {
            bind_address: config.bind_address.clone(),
            port: config.supervisor_port,
            cache_file: cache_file_path(&config.data_dir),
            regenerate_marker: regenerate_marker_path(&config.data_dir),
            ca_cert: config.runtime.bootstrap.server_ca.clone(),
            ca_key: config.runtime.bootstrap.server_ca_key.clone(),
            sans,
            renew_days: config.certificate_renew_days,
            refresh_interval: Duration::from_secs(config.listener_refresh_secs.max(1)),
            tls_min_version: config.tls_min_version,
        }
    }

    pub fn required_sans(&self) -> BTreeSet<String> {
        self.sans
            .iter()
            .filter(|san| !san.is_empty())
            .map(|san| canonical_san(san))
            .collect()
    }

    fn bind_target(&self) -> String {
        let host = if self.bind_address.is_empty() {
            "0.0.0.0"
        } else {
            self.bind_address.as_str()
        };
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{host}]:{}", self.port),
            _ => format!("{host}:{}", self.port),
        }
    }
}

/// Owns the serving certificate and its storage layers.
pub struct CertManager {
    issuer: CertIssuer,
    storage: LayeredStorage,
    resolver: Arc<CertResolver>,
    current: RwLock<CertRecord>,
    required_sans: BTreeSet<String>,
    renew_days: u32,
}

impl CertManager {
    pub async fn initialize(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let issuer = CertIssuer::load(&config.ca_cert, &config.ca_key)?;
        let storage = LayeredStorage::with_file_cache(&config.cache_file);
        let required_sans = config.required_sans();
        let requested = consume_marker(&config.regenerate_marker);

        let cached = storage.get().await?;
        let record = match regeneration_reason(
            cached.as_ref(),
            &required_sans,
            config.renew_days,
            requested,
            Utc::now(),
        ) {
            Some(reason) => {
                let record = issue(&issuer, &required_sans, cached.as_ref(), reason)?;
                storage.update(&record).await?;
                record
            }
            None => match cached {
                Some(record) => record,
                None => return Err(ListenerError::InvalidCertificate("no certificate".into())),
            },
        };
        let resolver = Arc::new(CertResolver::new(record.certified_key()?));
        Ok(Self {
            issuer,
            storage,
            resolver,
            current: RwLock::new(record),
            required_sans,
            renew_days: config.renew_days,
        })
    }

    pub fn current(&self) -> CertRecord {
        self.current.read().clone()
    }

    pub fn resolver(&self) -> Arc<CertResolver> {
        self.resolver.clone()
    }

    pub fn has_shared_storage(&self) -> bool {
        self.storage.has_shared()
    }

    /// Adds the cluster-wide layer; a certificate already stored there
    /// replaces the local one.
    pub async fn attach_shared(&self, kv: Arc<dyn KvClient>) -> Result<(), ListenerError> {
        let shared = Arc::new(KvStorage::new(kv, shared_record_key()));
        if let Some(record) = self.storage.attach_shared(shared).await? {
            self.install(record)?;
        }
        Ok(())
    }

    /// Adopts newer shared certificates and regenerates an expiring one.
    /// Returns whether the served certificate changed.
    pub async fn refresh(&self) -> Result<bool, ListenerError> {
        let mut changed = false;
        if let Some(record) = self.storage.sync_shared().await? {
            self.install(record)?;
            changed = true;
        }
        let current = self.current();
        if let Some(reason) = regeneration_reason(
            Some(&current),
            &self.required_sans,
            self.renew_days,
            false,
            Utc::now(),
        ) {
            let record = issue(&self.issuer, &self.required_sans, Some(&current), reason)?;
            self.storage.update(&record).await?;
            self.install(record)?;
            changed = true;
        }
        Ok(changed)
    }

    fn install(&self, record: CertRecord) -> Result<(), ListenerError> {
        self.resolver.swap(record.certified_key()?);
        info!(
            "event=listener_cert_installed fingerprint={} not_after={}",
            record.fingerprint, record.not_after
        );
        *self.current.write() = record;
        Ok(())
    }
}

fn issue(
    issuer: &CertIssuer,
    required: &BTreeSet<String>,
    previous: Option<&CertRecord>,
    reason: RegenerateReason,
) -> Result<CertRecord, ListenerError> {
    let mut sans = required.clone();
    if let Some(previous) = previous {
        sans.extend(previous.sans.iter().map(|san| canonical_san(san)));
    }
    let record = issuer.issue(&sans)?;
    info!(
        "event=listener_cert_issued reason={reason} fingerprint={} sans={}",
        record.fingerprint,
        record.sans.join(",")
    );
    Ok(record)
}

fn consume_marker(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            info!("event=listener_regenerate_requested marker={}", path.display());
            true
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => false,
        Err(err) => {
            warn!(
                "event=listener_marker_unremovable marker={} error={err}",
                path.display()
            );
            true
        }
    }
}

/// A bound, not yet serving, listener.
pub struct DynamicListener {
    tcp: TcpListener,
    certs: Arc<CertManager>,
    config: ListenerConfig,
}

impl DynamicListener {
    pub async fn bind(config: ListenerConfig) -> Result<Self, ListenerError> {
        let certs = Arc::new(CertManager::initialize(&config).await?);
        let addr = config.bind_target();
        let tcp = TcpListener::bind(&addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;
        Ok(Self { tcp, certs, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ListenerError> {
        self.tcp.local_addr().map_err(|source| ListenerError::Bind {
            addr: self.config.bind_target(),
            source,
        })
    }

    pub fn certs(&self) -> Arc<CertManager> {
        self.certs.clone()
    }

    /// Starts serving `handlers` and the periodic certificate refresh. Both
    /// stop when `cancel` fires; the serve task finishes once open
    /// connections have drained.
    pub fn spawn(
        self,
        handlers: HandlerChain,
        cancel: CancellationToken,
    ) -> Result<ListenerHandle, ListenerError> {
        let local_addr = self.local_addr()?;
        let config = server::server_config(self.certs.resolver(), self.config.tls_min_version)?;
        let acceptor = TlsAcceptor::from(Arc::new(config));
        info!("event=listener_serving addr={local_addr}");
        let serve = tokio::spawn(server::serve(
            self.tcp,
            acceptor,
            handlers.clone(),
            cancel.clone(),
        ));
        let refresh = spawn_refresh(self.certs.clone(), self.config.refresh_interval, cancel.clone());
        Ok(ListenerHandle {
            local_addr,
            certs: self.certs,
            handlers,
            cancel,
            serve,
            refresh,
        })
    }
}

fn spawn_refresh(
    certs: Arc<CertManager>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = certs.refresh().await {
                        warn!("event=listener_refresh_failed error={err}");
                    }
                }
            }
        }
    })
}

pub struct ListenerHandle {
    local_addr: SocketAddr,
    certs: Arc<CertManager>,
    handlers: HandlerChain,
    cancel: CancellationToken,
    serve: JoinHandle<()>,
    refresh: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn certs(&self) -> &Arc<CertManager> {
        &self.certs
    }

    pub fn handlers(&self) -> &HandlerChain {
        &self.handlers
    }

    /// Cancels serving and waits for in-flight requests to drain.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.stopped().await;
    }

    /// Waits for the serve and refresh tasks to end.
    pub async fn stopped(self) {
        if self.serve.await.is_err() {
            warn!("event=listener_serve_task_panicked");
        }
        if self.refresh.await.is_err() {
            warn!("event=listener_refresh_task_panicked");
        }
    }
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("failed to read server CA material {path:?}: {source}")]
    CaRead { path: PathBuf, source: io::Error },
    #[error("certificate cache {path:?} unavailable: {source}")]
    Cache { path: PathBuf, source: io::Error },
    #[error("certificate issuance failed: {0}")]
    Issue(#[from] rcgen::Error),
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("certificate record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Kv(#[from] KvError),
}
