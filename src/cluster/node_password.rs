//! Removal of this node's password secret after a cluster reset, retried on
//! a fixed interval until the secret is gone.

use crate::config::PROGRAM;
use crate::kv::{KvClient, KvError};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

pub const SECRETS_NAMESPACE: &str = "kube-system";

pub fn secret_name(node_name: &str) -> String {
    format!("{node_name}.node-password.{PROGRAM}").to_lowercase()
}

#[async_trait]
pub trait SecretsClient: Send + Sync {
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), SecretsError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretsError {
    #[error("secret {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[error("secret operation failed: {0}")]
    Failed(String),
}

/// Secrets stored in the datastore under `/registry/secrets/<ns>/<name>`.
pub struct KvSecrets {
    kv: Arc<dyn KvClient>,
}

impl KvSecrets {
    pub fn new(kv: Arc<dyn KvClient>) -> Self {
        Self { kv }
    }

    pub fn key(namespace: &str, name: &str) -> String {
        format!("/registry/secrets/{namespace}/{name}")
    }
}

#[async_trait]
impl SecretsClient for KvSecrets {
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), SecretsError> {
        let key = Self::key(namespace, name);
        let not_found = || SecretsError::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        let record = self
            .kv
            .get(&key)
            .await
            .map_err(|err| SecretsError::Failed(err.to_string()))?
            .ok_or_else(not_found)?;
        match self.kv.delete(&key, record.revision).await {
            Ok(()) => Ok(()),
            Err(KvError::NotFound { .. }) => Err(not_found()),
            Err(err) => Err(SecretsError::Failed(err.to_string())),
        }
    }
}

/// Becomes available once the datastore is up; the cleanup task polls it.
#[derive(Clone, Default)]
pub struct SecretsSlot {
    inner: Arc<RwLock<Option<Arc<dyn SecretsClient>>>>,
}

impl SecretsSlot {
    pub fn set(&self, client: Arc<dyn SecretsClient>) {
        *self.inner.write() = Some(client);
    }

    pub fn get(&self) -> Option<Arc<dyn SecretsClient>> {
        self.inner.read().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Deleted,
    NotFound,
    Cancelled,
}

/// Every `period`, waits for a node name and a secrets client, then deletes
/// the node's password secret. Ends on success, on a missing secret, or on
/// cancellation.
pub fn spawn_cleanup<F>(
    secrets: SecretsSlot,
    node_name: F,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<CleanupOutcome>
where
    F: Fn() -> Option<String> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return CleanupOutcome::Cancelled,
                _ = ticker.tick() => {}
            }
            let Some(node) = node_name().filter(|name| !name.is_empty()) else {
                info!("event=node_password_cleanup_waiting reason=node_name");
                continue;
            };
            let Some(client) = secrets.get() else {
                info!("event=node_password_cleanup_waiting reason=runtime");
                continue;
            };
            let name = secret_name(&node);
            match client.delete(SECRETS_NAMESPACE, &name).await {
                Ok(()) => {
                    info!("event=node_password_deleted node={node}");
                    return CleanupOutcome::Deleted;
                }
                Err(SecretsError::NotFound { .. }) => {
                    debug!("event=node_password_not_found node={node}");
                    return CleanupOutcome::NotFound;
                }
                Err(err) => {
                    warn!("event=node_password_delete_failed node={node} error={err}");
                }
            }
        }
    })
}
