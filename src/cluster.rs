//! Cluster lifecycle: managed driver selection, the bootstrap decision,
//! storage startup, and persisting the bundle on a fresh cluster.

pub mod extensions;
pub mod https;
pub mod managed;
pub mod node_password;
pub mod storage;

pub use extensions::{ExtensionError, HttpBootstrapper, SnapshotRestorer};
pub use https::{bootstrap_router, BOOTSTRAP_PATH};
pub use managed::{DriverError, DriverRegistry, ManagedDriver};
pub use node_password::{
    secret_name, spawn_cleanup, CleanupOutcome, KvSecrets, SecretsClient, SecretsError,
    SecretsSlot, SECRETS_NAMESPACE,
};
pub use storage::{resolve_token, DatastoreConnector, DatastoreError, StorageEndpoint};

use crate::bootstrap::{
    read_from_disk, write_to_disk, BootstrapError, BootstrapStore, BundleError, LoadOutcome,
    TokenError,
};
use crate::config::ControlConfig;
use crate::listener::{ListenerError, ListenerHandle};
use log::{info, warn};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Position in the startup sequence. Each operation runs exactly once, in
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleStage {
    Unstarted,
    DriverAssigned,
    BootstrapDecided,
    StorageStarted,
    Ready,
}

/// Flags derived during startup; never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterState {
    /// This process must originate or fetch cluster identity.
    pub should_bootstrap: bool,
    /// This process is attaching to existing cluster state.
    pub joining: bool,
    pub storage_started: bool,
    /// The on-disk bundle must be saved once storage is up.
    pub save_bootstrap: bool,
}

pub struct Cluster {
    config: ControlConfig,
    registry: DriverRegistry,
    connector: Arc<dyn DatastoreConnector>,
    http_bootstrapper: Option<Arc<dyn HttpBootstrapper>>,
    snapshot_restorer: Option<Arc<dyn SnapshotRestorer>>,
    secrets: SecretsSlot,
    cancel: CancellationToken,
    managed: Option<Arc<dyn ManagedDriver>>,
    state: ClusterState,
    stage: LifecycleStage,
    storage: Option<StorageEndpoint>,
    listener: Option<ListenerHandle>,
    cleanup: Option<JoinHandle<CleanupOutcome>>,
}

impl Cluster {
    pub fn new(
        config: ControlConfig,
        registry: DriverRegistry,
        connector: Arc<dyn DatastoreConnector>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry,
            connector,
            http_bootstrapper: None,
            snapshot_restorer: None,
            secrets: SecretsSlot::default(),
            cancel,
            managed: None,
            state: ClusterState::default(),
            stage: LifecycleStage::Unstarted,
            storage: None,
            listener: None,
            cleanup: None,
        }
    }

    pub fn with_http_bootstrapper(mut self, bootstrapper: Arc<dyn HttpBootstrapper>) -> Self {
        self.http_bootstrapper = Some(bootstrapper);
        self
    }

    pub fn with_snapshot_restorer(mut self, restorer: Arc<dyn SnapshotRestorer>) -> Self {
        self.snapshot_restorer = Some(restorer);
        self
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn stage(&self) -> LifecycleStage {
        self.stage
    }

    pub fn managed_driver(&self) -> Option<&Arc<dyn ManagedDriver>> {
        self.managed.as_ref()
    }

    pub fn storage(&self) -> Option<&StorageEndpoint> {
        self.storage.as_ref()
    }

    pub fn listener(&self) -> Option<&ListenerHandle> {
        self.listener.as_ref()
    }

    pub fn secrets(&self) -> SecretsSlot {
        self.secrets.clone()
    }

    /// Selects the managed driver and decides whether this process must
    /// bootstrap. On a bootstrap the bundle is either fetched over HTTPS or
    /// loaded from storage and written to disk; an absent record marks the
    /// bundle for saving in [`start`](Self::start).
    pub async fn bootstrap(&mut self) -> Result<(), ClusterError> {
        self.expect_stage("bootstrap", LifecycleStage::Unstarted)?;
        self.assign_managed_driver()
            .await
            .step("assign managed driver")?;
        self.stage = LifecycleStage::DriverAssigned;

        let should_bootstrap = self
            .should_bootstrap_load()
            .await
            .step("check bootstrap state")?;
        self.state.should_bootstrap = should_bootstrap;
        info!(
            "event=cluster_bootstrap_decided should_bootstrap={} managed={}",
            should_bootstrap,
            self.managed.is_some()
        );
        if should_bootstrap {
            self.bootstrap_identity().await?;
        }
        self.stage = LifecycleStage::BootstrapDecided;
        Ok(())
    }

    /// Serves the listener, starts the managed datastore and storage, and
    /// saves the bundle when this process originated it. Returns a receiver
    /// that turns `true` once the datastore is ready.
    pub async fn start(&mut self) -> Result<watch::Receiver<bool>, ClusterError> {
        self.expect_stage("start", LifecycleStage::BootstrapDecided)?;
        self.init_cluster_and_https().await?;
        if self.config.disable_etcd {
            return Err(StepError::Unsupported("disable-etcd")).step("start cluster");
        }
        self.start_managed().await.step("start managed database")?;
        let ready = self.test_cluster_db();

        self.start_storage().await?;
        self.stage = LifecycleStage::StorageStarted;
        self.attach_listener_storage()
            .await
            .step("attach listener storage")?;

        if self.state.save_bootstrap {
            self.save(false).await?;
        }
        self.stage = LifecycleStage::Ready;
        info!("event=cluster_started");
        Ok(ready)
    }

    /// Reads the on-disk bundle and stores it encrypted under the resolved
    /// token.
    pub async fn save(&self, override_existing: bool) -> Result<(), ClusterError> {
        let bundle = read_from_disk(&self.config.runtime.bootstrap.role_map())
            .step("read bootstrap data")?;
        let token = resolve_token(&self.config).step("resolve token")?;
        let store = self.bootstrap_store().step("save bootstrap data")?;
        store
            .save(&bundle, &token, override_existing)
            .await
            .step("save bootstrap data")
    }

    /// Cancels background work and waits for the listener to drain.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(listener) = self.listener.take() {
            listener.stopped().await;
        }
        if let Some(cleanup) = self.cleanup.take() {
            if cleanup.await.is_err() {
                warn!("event=node_password_cleanup_task_panicked");
            }
        }
    }

    async fn bootstrap_identity(&mut self) -> Result<(), ClusterError> {
        self.state.joining = true;
        if self.config.runtime.http_bootstrap {
            let bootstrapper = self
                .http_bootstrapper
                .clone()
                .ok_or(ExtensionError::Unsupported("HTTP bootstrap"))
                .step("fetch bootstrap data")?;
            let bundle = bootstrapper
                .fetch(&self.config)
                .await
                .step("fetch bootstrap data")?;
            return write_to_disk(&bundle, &self.config.runtime.bootstrap.role_map())
                .step("write bootstrap data");
        }
        self.storage_bootstrap().await
    }

    async fn storage_bootstrap(&mut self) -> Result<(), ClusterError> {
        self.start_storage().await?;
        let token = resolve_token(&self.config).step("resolve token")?;
        if token.is_empty() {
            info!("event=cluster_fresh_start reason=no_token");
            self.state.save_bootstrap = true;
            return Ok(());
        }
        let store = self.bootstrap_store().step("load bootstrap data")?;
        match store.load(&token).await.step("load bootstrap data")? {
            LoadOutcome::FirstTime => {
                info!("event=cluster_fresh_start reason=no_record");
                self.state.save_bootstrap = true;
            }
            LoadOutcome::Found { bundle, record } => {
                info!(
                    "event=cluster_bootstrap_restored key={} files={}",
                    record.key,
                    bundle.len()
                );
                write_to_disk(&bundle, &self.config.runtime.bootstrap.role_map())
                    .step("write bootstrap data")?;
            }
        }
        Ok(())
    }

    async fn start_storage(&mut self) -> Result<(), ClusterError> {
        if self.state.storage_started {
            return Ok(());
        }
        self.state.storage_started = true;
        let endpoint = self
            .connector
            .listen(&self.config.datastore)
            .await
            .step("create storage endpoint")?;
        self.config.datastore.endpoint = endpoint.endpoints.join(",");
        self.config.no_leader_elect = !endpoint.leader_elect;
        self.secrets
            .set(Arc::new(KvSecrets::new(endpoint.client.clone())));
        info!(
            "event=cluster_storage_started endpoint={} leader_elect={}",
            self.config.datastore.endpoint, endpoint.leader_elect
        );
        self.storage = Some(endpoint);
        Ok(())
    }

    async fn attach_listener_storage(&self) -> Result<(), StepError> {
        let (Some(listener), Some(storage)) = (&self.listener, &self.storage) else {
            return Ok(());
        };
        if listener.certs().has_shared_storage() {
            return Ok(());
        }
        listener
            .certs()
            .attach_shared(storage.client.clone())
            .await?;
        Ok(())
    }

    fn bootstrap_store(&self) -> Result<BootstrapStore, StepError> {
        let storage = self.storage.as_ref().ok_or(StepError::StorageNotStarted)?;
        Ok(BootstrapStore::new(
            storage.client.clone(),
            self.cancel.child_token(),
        ))
    }

    fn expect_stage(
        &self,
        operation: &'static str,
        expected: LifecycleStage,
    ) -> Result<(), ClusterError> {
        if self.stage != expected {
            return Err(ClusterError::InvalidStage {
                operation,
                expected,
                actual: self.stage,
            });
        }
        Ok(())
    }
}

/// Failure of one startup step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
    #[error(transparent)]
    Extension(#[from] ExtensionError),
    #[error("{path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error(
        "cluster-reset was already performed; remove the cluster-reset flag and start normally, or delete {0:?} to reset again"
    )]
    ResetAlreadyPerformed(PathBuf),
    #[error("storage has not been started")]
    StorageNotStarted,
    #[error("{0} is not supported")]
    Unsupported(&'static str),
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{step}: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: StepError,
    },
    #[error("{operation} called in stage {actual:?}, expected {expected:?}")]
    InvalidStage {
        operation: &'static str,
        expected: LifecycleStage,
        actual: LifecycleStage,
    },
}

impl ClusterError {
    pub fn step_source(&self) -> Option<&StepError> {
        match self {
            ClusterError::Step { source, .. } => Some(source),
            ClusterError::InvalidStage { .. } => None,
        }
    }
}

/// Tags a step failure with the step name.
pub(crate) trait StepContext<T> {
    fn step(self, step: &'static str) -> Result<T, ClusterError>;
}

impl<T, E: Into<StepError>> StepContext<T> for Result<T, E> {
    fn step(self, step: &'static str) -> Result<T, ClusterError> {
        self.map_err(|err| ClusterError::Step {
            step,
            source: err.into(),
        })
    }
}
