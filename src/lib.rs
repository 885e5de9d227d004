//! Cluster identity bootstrap for control-plane servers.
//!
//! The first server of a cluster stores its CA and key material, encrypted
//! with a key derived from the cluster token, in the shared KV store. Servers
//! joining later load and decrypt that bundle (or fetch it over HTTPS from a
//! peer when the datastore is managed in-process) before starting their own
//! components. A TLS listener signed by the cluster server CA serves the join
//! endpoints and rotates its own certificate.

pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod kv;
pub mod listener;
pub mod timeouts;
pub mod util;

pub use bootstrap::{
    read_from_disk, storage_key, write_to_disk, BootstrapError, BootstrapStore, Bundle,
    BundleFile, BundleRoleMap, LoadOutcome,
};
pub use cluster::{
    Cluster, ClusterError, ClusterState, DatastoreConnector, DriverRegistry, LifecycleStage,
    ManagedDriver, StepError, StorageEndpoint,
};
pub use config::{ControlConfig, ControlRuntime, ControlRuntimeBootstrap, DatastoreConfig};
pub use kv::{KeyValue, KvClient, KvError, MemoryKv};
pub use listener::{DynamicListener, ListenerConfig, ListenerError, ListenerHandle};
pub use util::KeystrapError;
