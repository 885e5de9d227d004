use crate::bootstrap::{read_token_file, TokenError};
use crate::config::{ControlConfig, DatastoreConfig};
use crate::kv::{KvClient, KvError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// A datastore that is listening and reachable through `client`.
#[derive(Clone)]
pub struct StorageEndpoint {
    pub endpoints: Vec<String>,
    pub leader_elect: bool,
    pub client: Arc<dyn KvClient>,
}

/// Brings up (or connects to) the datastore named by the config.
#[async_trait]
pub trait DatastoreConnector: Send + Sync {
    async fn listen(&self, datastore: &DatastoreConfig) -> Result<StorageEndpoint, DatastoreError>;
}

/// Token used to seal the bundle: the configured token, else the token file,
/// else the formatted server token. Empty on a fresh node.
pub fn resolve_token(config: &ControlConfig) -> Result<String, TokenError> {
    if !config.token.is_empty() {
        return Ok(config.token.clone());
    }
    read_token_file(
        &config.data_dir,
        &config.runtime.server_token,
        &config.runtime.bootstrap.server_ca,
    )
}

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("creating storage endpoint: {0}")]
    Listen(String),
    #[error(transparent)]
    Kv(#[from] KvError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn configured_token_wins_over_token_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("token"), "from-file\n").unwrap();
        let mut config = ControlConfig {
            data_dir: dir.path().to_path_buf(),
            ..ControlConfig::default()
        };
        assert_eq!(resolve_token(&config).unwrap(), "from-file");
        config.token = "configured".into();
        assert_eq!(resolve_token(&config).unwrap(), "configured");
    }

    #[test]
    fn fresh_node_has_no_token() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControlConfig {
            data_dir: dir.path().to_path_buf(),
            ..ControlConfig::default()
        };
        assert_eq!(resolve_token(&config).unwrap(), "");
    }
}
