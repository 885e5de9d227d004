use crate::bootstrap::{BootstrapError, BundleError, CryptoError, TokenError};
use crate::cluster::{ClusterError, DatastoreError, DriverError, ExtensionError};
use crate::config::ConfigError;
use crate::kv::KvError;
use crate::listener::ListenerError;
use thiserror::Error;

/// Any error surfaced by the crate, for callers that do not match on the
/// individual module errors.
#[derive(Debug, Error)]
pub enum KeystrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
    #[error(transparent)]
    Extension(#[from] ExtensionError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}
