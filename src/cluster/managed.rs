use super::node_password::spawn_cleanup;
use super::{Cluster, StepError};
use crate::config::ControlConfig;
use crate::timeouts::NODE_PASSWORD_RETRY_INTERVAL;
use async_trait::async_trait;
use axum::Router;
use log::{info, warn};
use std::env;
use std::fs;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// An embedded datastore the process can run itself.
#[async_trait]
pub trait ManagedDriver: Send + Sync {
    /// Scheme name, e.g. `etcd`; matched against the datastore endpoint.
    fn endpoint_name(&self) -> &str;

    /// Whether this driver left persisted state in the data directory on an
    /// earlier run.
    async fn is_initialized(&self, config: &ControlConfig) -> Result<bool, DriverError>;

    /// Adds the driver's routes to the listener router.
    fn register(&self, config: &ControlConfig, router: Router) -> Result<Router, DriverError>;

    /// Starts (or joins) the embedded datastore.
    async fn start(&self, config: &ControlConfig) -> Result<(), DriverError>;

    /// Flips to `true` once the datastore accepts requests.
    fn ready(&self) -> watch::Receiver<bool>;
}

/// The drivers compiled into this process, fixed at construction.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn ManagedDriver>>,
    default_driver: Option<String>,
}

impl DriverRegistry {
    pub fn new(drivers: Vec<Arc<dyn ManagedDriver>>, default_driver: Option<&str>) -> Self {
        Self {
            drivers,
            default_driver: default_driver.map(str::to_string),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn drivers(&self) -> &[Arc<dyn ManagedDriver>] {
        &self.drivers
    }

    pub fn default_driver(&self) -> Option<&str> {
        self.default_driver.as_deref()
    }

    /// Picks the active driver, if any:
    /// 1. a driver with persisted local state,
    /// 2. the driver named by the datastore endpoint scheme,
    /// 3. the default driver when no endpoint is set and the process is
    ///    initializing a cluster or joining one with a token and URL,
    /// 4. none (an external datastore).
    pub async fn select(
        &self,
        config: &ControlConfig,
    ) -> Result<Option<Arc<dyn ManagedDriver>>, DriverError> {
        for driver in &self.drivers {
            if driver.is_initialized(config).await? {
                info!(
                    "event=driver_selected driver={} reason=initialized",
                    driver.endpoint_name()
                );
                return Ok(Some(driver.clone()));
            }
        }

        let endpoint = config.datastore.endpoint.as_str();
        let scheme = endpoint.split(':').next().unwrap_or_default();
        if let Some(driver) = self.find(scheme) {
            info!(
                "event=driver_selected driver={} reason=endpoint",
                driver.endpoint_name()
            );
            return Ok(Some(driver));
        }

        let wants_managed =
            config.cluster_init || (!config.token.is_empty() && !config.join_url.is_empty());
        if endpoint.is_empty() && wants_managed {
            if let Some(driver) = self.default_driver().and_then(|name| self.find(name)) {
                info!(
                    "event=driver_selected driver={} reason=default",
                    driver.endpoint_name()
                );
                return Ok(Some(driver));
            }
        }
        Ok(None)
    }

    fn find(&self, name: &str) -> Option<Arc<dyn ManagedDriver>> {
        if name.is_empty() {
            return None;
        }
        self.drivers
            .iter()
            .find(|driver| driver.endpoint_name() == name)
            .cloned()
    }
}

impl Cluster {
    pub(super) async fn assign_managed_driver(&mut self) -> Result<(), DriverError> {
        self.managed = self.registry.select(&self.config).await?;
        Ok(())
    }

    /// `true` when this process must fetch or originate the bundle. A managed
    /// driver joins over HTTPS, and only when it is uninitialized and has a
    /// join URL.
    pub(super) async fn should_bootstrap_load(&mut self) -> Result<bool, DriverError> {
        let Some(driver) = self.managed.clone() else {
            return Ok(true);
        };
        self.config.runtime.http_bootstrap = true;
        if driver.is_initialized(&self.config).await? {
            info!(
                "event=cluster_managed_initialized driver={}",
                driver.endpoint_name()
            );
            return Ok(false);
        }
        if self.config.join_url.is_empty() {
            info!(
                "event=cluster_managed_init driver={}",
                driver.endpoint_name()
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Points the datastore endpoint at the managed driver and lets it add
    /// its routes.
    pub(super) fn init_cluster_db(&mut self, router: Router) -> Result<Router, DriverError> {
        let Some(driver) = self.managed.clone() else {
            return Ok(router);
        };
        let name = driver.endpoint_name();
        if !self
            .config
            .datastore
            .endpoint
            .starts_with(&format!("{name}://"))
        {
            self.config.datastore.endpoint = name.to_string();
        }
        driver.register(&self.config, router)
    }

    pub(super) async fn start_managed(&mut self) -> Result<(), StepError> {
        let Some(driver) = self.managed.clone() else {
            return Ok(());
        };
        let reset_file = self.config.reset_file();

        if self.config.cluster_reset {
            let snapshot = self.config.cluster_reset_restore_path.clone();
            if snapshot.is_none() && reset_file.exists() {
                return Err(StepError::ResetAlreadyPerformed(reset_file));
            }
            let restorer = self
                .snapshot_restorer
                .clone()
                .ok_or(super::ExtensionError::Unsupported("cluster reset"))?;
            match snapshot {
                Some(snapshot) => restorer.restore(&self.config, &snapshot).await?,
                None => restorer.reset(&self.config).await?,
            }
        }

        if reset_file.exists() {
            self.cleanup = Some(spawn_cleanup(
                self.secrets.clone(),
                || env::var("NODE_NAME").ok(),
                NODE_PASSWORD_RETRY_INTERVAL,
                self.cancel.child_token(),
            ));
        }
        match fs::remove_file(&reset_file) {
            Ok(()) => info!("event=cluster_reset_flag_removed path={}", reset_file.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "event=cluster_reset_flag_unremovable path={} error={err}",
                reset_file.display()
            ),
        }

        driver.start(&self.config).await?;
        Ok(())
    }

    /// Readiness of the datastore; immediately ready without a managed
    /// driver.
    pub(super) fn test_cluster_db(&self) -> watch::Receiver<bool> {
        match &self.managed {
            Some(driver) => driver.ready(),
            None => watch::channel(true).1,
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("managed driver {driver}: {message}")]
    Failed { driver: String, message: String },
    #[error("managed driver I/O error: {0}")]
    Io(#[from] io::Error),
}
