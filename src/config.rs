//! Control-plane configuration consumed by the cluster lifecycle.
//!
//! Flag parsing lives outside this crate; configuration arrives either as a
//! constructed [`ControlConfig`] or as a YAML file loaded with
//! [`ControlConfig::load`].

use crate::bootstrap::BundleRoleMap;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Program name used for certificate subjects, secret names, and paths.
pub const PROGRAM: &str = "keystrap";
pub const DEFAULT_SUPERVISOR_PORT: u16 = 9345;
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
pub const DEFAULT_CERTIFICATE_RENEW_DAYS: u32 = 90;
pub const DEFAULT_LISTENER_REFRESH_SECS: u64 = 3600;

/// If `path` is relative, joins it to `base`; otherwise returns it unchanged.
pub fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TlsMinVersion {
    #[default]
    #[serde(rename = "VersionTLS12")]
    Tls12,
    #[serde(rename = "VersionTLS13")]
    Tls13,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DatastoreConfig {
    /// Empty, a managed driver name, or `<scheme>://...` of an external store.
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ControlConfig {
    pub data_dir: PathBuf,
    pub token: String,
    pub join_url: String,
    pub cluster_init: bool,
    pub cluster_reset: bool,
    pub cluster_reset_restore_path: Option<PathBuf>,
    pub disable_etcd: bool,
    pub datastore: DatastoreConfig,
    pub bind_address: String,
    pub supervisor_port: u16,
    pub sans: Vec<String>,
    pub cluster_domain: String,
    pub cluster_cidrs: Vec<String>,
    pub service_cidrs: Vec<String>,
    pub tls_min_version: TlsMinVersion,
    pub certificate_renew_days: u32,
    pub listener_refresh_secs: u64,
    /// Set by the lifecycle once storage is listening.
    #[serde(skip)]
    pub no_leader_elect: bool,
    #[serde(skip)]
    pub runtime: ControlRuntime,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            token: String::new(),
            join_url: String::new(),
            cluster_init: false,
            cluster_reset: false,
            cluster_reset_restore_path: None,
            disable_etcd: false,
            datastore: DatastoreConfig::default(),
            bind_address: "127.0.0.1".to_string(),
            supervisor_port: DEFAULT_SUPERVISOR_PORT,
            sans: Vec::new(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            cluster_cidrs: Vec::new(),
            service_cidrs: Vec::new(),
            tls_min_version: TlsMinVersion::default(),
            certificate_renew_days: DEFAULT_CERTIFICATE_RENEW_DAYS,
            listener_refresh_secs: DEFAULT_LISTENER_REFRESH_SECS,
            no_leader_elect: false,
            runtime: ControlRuntime::default(),
        }
    }
}

impl ControlConfig {
    /// Loads a YAML config. Relative paths are resolved against the file's
    /// directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: ControlConfig = serde_yaml::from_str(&text)?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if !config.data_dir.as_os_str().is_empty() {
            config.data_dir = resolve_relative(&base, &config.data_dir);
        }
        if let Some(restore) = config.cluster_reset_restore_path.take() {
            config.cluster_reset_restore_path = Some(resolve_relative(&base, &restore));
        }
        Ok(config)
    }

    /// Resolves the server data directory and fills in runtime paths that the
    /// caller left unset.
    pub fn prepare(mut self) -> Result<Self, ConfigError> {
        self.data_dir = resolve_data_dir(&self.data_dir)?;
        if self.runtime.bootstrap == ControlRuntimeBootstrap::default() {
            self.runtime.bootstrap = ControlRuntimeBootstrap::under(&self.data_dir);
        }
        Ok(self)
    }

    pub fn tls_dir(&self) -> PathBuf {
        self.data_dir.join("tls")
    }

    /// Flag file left behind by a cluster reset of the managed datastore.
    pub fn reset_file(&self) -> PathBuf {
        self.data_dir.join("db").join("reset-flag")
    }
}

/// Runtime state derived from the config and filled in during startup.
#[derive(Debug, Clone, Default)]
pub struct ControlRuntime {
    pub bootstrap: ControlRuntimeBootstrap,
    /// Generated server password; used when neither the config nor the token
    /// file supplies a token.
    pub server_token: String,
    /// Joining servers fetch the bundle over HTTPS instead of from storage.
    pub http_bootstrap: bool,
}

/// On-disk locations of the CA and key material carried in the bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlRuntimeBootstrap {
    pub server_ca: PathBuf,
    pub server_ca_key: PathBuf,
    pub client_ca: PathBuf,
    pub client_ca_key: PathBuf,
    pub etcd_server_ca: PathBuf,
    pub etcd_server_ca_key: PathBuf,
    pub etcd_peer_ca: PathBuf,
    pub etcd_peer_ca_key: PathBuf,
    pub request_header_ca: PathBuf,
    pub request_header_ca_key: PathBuf,
    pub service_key: PathBuf,
    pub passwd_file: PathBuf,
    pub ipsec_key: PathBuf,
    pub encryption_config: PathBuf,
    pub encryption_hash: PathBuf,
}

impl ControlRuntimeBootstrap {
    /// The standard layout beneath a server data directory.
    pub fn under(data_dir: &Path) -> Self {
        let tls = data_dir.join("tls");
        let etcd = tls.join("etcd");
        let cred = data_dir.join("cred");
        Self {
            server_ca: tls.join("server-ca.crt"),
            server_ca_key: tls.join("server-ca.key"),
            client_ca: tls.join("client-ca.crt"),
            client_ca_key: tls.join("client-ca.key"),
            etcd_server_ca: etcd.join("server-ca.crt"),
            etcd_server_ca_key: etcd.join("server-ca.key"),
            etcd_peer_ca: etcd.join("peer-ca.crt"),
            etcd_peer_ca_key: etcd.join("peer-ca.key"),
            request_header_ca: tls.join("request-header-ca.crt"),
            request_header_ca_key: tls.join("request-header-ca.key"),
            service_key: tls.join("service.key"),
            passwd_file: cred.join("passwd"),
            ipsec_key: cred.join("ipsec.psk"),
            encryption_config: cred.join("encryption-config.json"),
            encryption_hash: cred.join("encryption-state.json"),
        }
    }

    pub fn role_map(&self) -> BundleRoleMap {
        [
            ("ServerCA", &self.server_ca),
            ("ServerCAKey", &self.server_ca_key),
            ("ClientCA", &self.client_ca),
            ("ClientCAKey", &self.client_ca_key),
            ("ETCDServerCA", &self.etcd_server_ca),
            ("ETCDServerCAKey", &self.etcd_server_ca_key),
            ("ETCDPeerCA", &self.etcd_peer_ca),
            ("ETCDPeerCAKey", &self.etcd_peer_ca_key),
            ("RequestHeaderCA", &self.request_header_ca),
            ("RequestHeaderCAKey", &self.request_header_ca_key),
            ("ServiceKey", &self.service_key),
            ("PasswdFile", &self.passwd_file),
            ("IPSECKey", &self.ipsec_key),
            ("EncryptionConfig", &self.encryption_config),
            ("EncryptionHash", &self.encryption_hash),
        ]
        .into_iter()
        .filter(|(_, path)| !path.as_os_str().is_empty())
        .map(|(role, path)| (role.to_string(), path.clone()))
        .collect()
    }
}

/// Applies the default data directory, expands `~`, makes the result
/// absolute, and appends `server`.
pub fn resolve_data_dir(configured: &Path) -> Result<PathBuf, ConfigError> {
    let home = env::var_os("HOME").map(PathBuf::from);
    let base = if configured.as_os_str().is_empty() {
        default_data_dir(running_as_root(), home.as_deref())?
    } else {
        expand_home(configured, home.as_deref())?
    };
    let absolute = if base.is_absolute() {
        base
    } else {
        env::current_dir()
            .map_err(ConfigError::CurrentDir)?
            .join(base)
    };
    Ok(absolute.join("server"))
}

pub fn default_data_dir(is_root: bool, home: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if is_root {
        return Ok(PathBuf::from("/var/lib").join(PROGRAM));
    }
    let home = home.ok_or(ConfigError::HomeNotSet)?;
    Ok(home.join(format!(".{PROGRAM}")))
}

fn expand_home(path: &Path, home: Option<&Path>) -> Result<PathBuf, ConfigError> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(home.ok_or(ConfigError::HomeNotSet)?.join(rest)),
        Err(_) => Ok(path.to_path_buf()),
    }
}

#[cfg(target_os = "linux")]
fn running_as_root() -> bool {
    use std::os::unix::fs::MetadataExt;
    fs::metadata("/proc/self")
        .map(|meta| meta.uid() == 0)
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn running_as_root() -> bool {
    false
}

/// Merges cluster-internal destinations into a `NO_PROXY` value built from
/// the current upper and lower case variables.
pub fn augment_no_proxy(
    upper: &str,
    lower: &str,
    cluster_domain: &str,
    cluster_cidrs: &[String],
    service_cidrs: &[String],
) -> String {
    let split = |value: &str| {
        value
            .split(',')
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>()
    };
    let mut entries = split(upper);
    entries.extend(split(lower));
    entries.push(".svc".to_string());
    entries.push(format!(".{cluster_domain}"));
    entries.extend(cluster_cidrs.iter().filter(|c| !c.is_empty()).cloned());
    entries.extend(service_cidrs.iter().filter(|c| !c.is_empty()).cloned());
    entries.join(",")
}

/// Rewrites `NO_PROXY` for the process and clears `no_proxy`.
pub fn apply_no_proxy_env(config: &ControlConfig) {
    let upper = env::var("NO_PROXY").unwrap_or_default();
    let lower = env::var("no_proxy").unwrap_or_default();
    let merged = augment_no_proxy(
        &upper,
        &lower,
        &config.cluster_domain,
        &config.cluster_cidrs,
        &config.service_cidrs,
    );
    env::remove_var("no_proxy");
    env::set_var("NO_PROXY", merged);
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("HOME is not set; cannot resolve the data directory")]
    HomeNotSet,
    #[error("failed to resolve current directory: {0}")]
    CurrentDir(io::Error),
}
