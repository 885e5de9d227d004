//! Seams for flows this crate does not implement itself.

use crate::bootstrap::Bundle;
use crate::config::ControlConfig;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

/// Fetches the bundle from an existing server when joining over HTTPS.
#[async_trait]
pub trait HttpBootstrapper: Send + Sync {
    async fn fetch(&self, config: &ControlConfig) -> Result<Bundle, ExtensionError>;
}

/// Handles `cluster-reset` for a managed datastore.
#[async_trait]
pub trait SnapshotRestorer: Send + Sync {
    /// Resets membership to this node, keeping the current data.
    async fn reset(&self, config: &ControlConfig) -> Result<(), ExtensionError>;

    /// Resets membership and restores data from `snapshot`.
    async fn restore(&self, config: &ControlConfig, snapshot: &Path) -> Result<(), ExtensionError>;
}

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("{0} is not available in this build")]
    Unsupported(&'static str),
    #[error("{0}")]
    Failed(String),
}
