//! Layered persistence for the serving certificate: memory, then the local
//! file cache, then a record shared by every server through the KV store.

use super::cert::CertRecord;
use super::ListenerError;
use crate::kv::{KvClient, KvError};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[async_trait]
pub trait TlsStorage: Send + Sync {
    async fn get(&self) -> Result<Option<CertRecord>, ListenerError>;
    async fn update(&self, record: &CertRecord) -> Result<(), ListenerError>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    record: RwLock<Option<CertRecord>>,
}

#[async_trait]
impl TlsStorage for MemoryStorage {
    async fn get(&self) -> Result<Option<CertRecord>, ListenerError> {
        Ok(self.record.read().clone())
    }

    async fn update(&self, record: &CertRecord) -> Result<(), ListenerError> {
        *self.record.write() = Some(record.clone());
        Ok(())
    }
}

/// JSON file cache, replaced atomically through a temp file.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, record: &CertRecord) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = self.path.with_extension("tmp");
        let mut tmp_file = fs::File::create(&tmp_path)?;
        restrict_permissions(&tmp_path)?;
        let payload = serde_json::to_vec_pretty(record).map_err(io::Error::other)?;
        tmp_file.write_all(&payload)?;
        tmp_file.sync_all()?;
        fs::rename(tmp_path, &self.path)
    }
}

#[async_trait]
impl TlsStorage for FileStorage {
    async fn get(&self) -> Result<Option<CertRecord>, ListenerError> {
        match fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(record) => Ok(Some(record)),
                Err(err) => {
                    warn!(
                        "event=listener_cache_unreadable path={} error={err}",
                        self.path.display()
                    );
                    Ok(None)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ListenerError::Cache {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn update(&self, record: &CertRecord) -> Result<(), ListenerError> {
        self.persist(record).map_err(|source| ListenerError::Cache {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Cluster-wide record kept as a secret in the shared store.
pub struct KvStorage {
    kv: Arc<dyn KvClient>,
    key: String,
}

impl KvStorage {
    pub fn new(kv: Arc<dyn KvClient>, key: impl Into<String>) -> Self {
        Self {
            kv,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl TlsStorage for KvStorage {
    async fn get(&self) -> Result<Option<CertRecord>, ListenerError> {
        match self.kv.get(&self.key).await? {
            Some(record) => Ok(Some(serde_json::from_slice(&record.value)?)),
            None => Ok(None),
        }
    }

    /// Learners never originate writes; the record is left to a voting
    /// member.
    async fn update(&self, record: &CertRecord) -> Result<(), ListenerError> {
        let payload = serde_json::to_vec(record)?;
        let written = match self.kv.get(&self.key).await? {
            Some(existing) => self.kv.update(&self.key, existing.revision, payload).await,
            None => match self.kv.create(&self.key, payload).await {
                Err(KvError::KeyExists { .. }) => {
                    warn!("event=listener_shared_record_raced key={}", self.key);
                    Ok(())
                }
                other => other,
            },
        };
        match written {
            Err(KvError::LearnerRestricted) => {
                debug!(
                    "event=listener_shared_write_skipped reason=learner key={}",
                    self.key
                );
                Ok(())
            }
            other => Ok(other?),
        }
    }
}

/// Reads the first layer holding a record and backfills the layers above
/// it; writes go through every layer. The shared layer is attached once the
/// datastore is reachable.
pub struct LayeredStorage {
    local: Vec<Arc<dyn TlsStorage>>,
    shared: RwLock<Option<Arc<dyn TlsStorage>>>,
}

impl LayeredStorage {
    pub fn new(local: Vec<Arc<dyn TlsStorage>>) -> Self {
        Self {
            local,
            shared: RwLock::new(None),
        }
    }

    /// Memory in front of the JSON cache file.
    pub fn with_file_cache(path: impl Into<PathBuf>) -> Self {
        Self::new(vec![
            Arc::new(MemoryStorage::default()),
            Arc::new(FileStorage::new(path)),
        ])
    }

    fn layers(&self) -> Vec<Arc<dyn TlsStorage>> {
        let mut layers = self.local.clone();
        if let Some(shared) = self.shared.read().clone() {
            layers.push(shared);
        }
        layers
    }

    pub fn has_shared(&self) -> bool {
        self.shared.read().is_some()
    }

    pub async fn get(&self) -> Result<Option<CertRecord>, ListenerError> {
        let layers = self.layers();
        for (depth, layer) in layers.iter().enumerate() {
            if let Some(record) = layer.get().await? {
                for upper in &layers[..depth] {
                    upper.update(&record).await?;
                }
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Writes the local layers, then the shared one. A shared-layer failure
    /// is logged and left to the next refresh; the local layers already
    /// hold the record.
    pub async fn update(&self, record: &CertRecord) -> Result<(), ListenerError> {
        for layer in &self.local {
            layer.update(record).await?;
        }
        let shared = self.shared.read().clone();
        if let Some(shared) = shared {
            if let Err(err) = shared.update(record).await {
                warn!(
                    "event=listener_shared_update_failed fingerprint={} error={err}",
                    record.fingerprint
                );
            }
        }
        Ok(())
    }

    /// Attaches the shared layer. An existing shared record wins and is
    /// returned so the caller can start serving it; otherwise the local
    /// record is published.
    pub async fn attach_shared(
        &self,
        shared: Arc<dyn TlsStorage>,
    ) -> Result<Option<CertRecord>, ListenerError> {
        let adopted = match shared.get().await? {
            Some(record) => {
                for layer in &self.local {
                    layer.update(&record).await?;
                }
                info!(
                    "event=listener_shared_record_adopted fingerprint={}",
                    record.fingerprint
                );
                Some(record)
            }
            None => {
                if let Some(local) = self.local_record().await? {
                    shared.update(&local).await?;
                    info!(
                        "event=listener_shared_record_published fingerprint={}",
                        local.fingerprint
                    );
                }
                None
            }
        };
        *self.shared.write() = Some(shared);
        Ok(adopted)
    }

    /// Pulls a newer shared record into the local layers. Returns it when
    /// it differs from what is cached locally.
    pub async fn sync_shared(&self) -> Result<Option<CertRecord>, ListenerError> {
        let Some(shared) = self.shared.read().clone() else {
            return Ok(None);
        };
        let Some(remote) = shared.get().await? else {
            return Ok(None);
        };
        let local = self.local_record().await?;
        let newer = match &local {
            Some(local) => local.fingerprint != remote.fingerprint && remote.not_after > local.not_after,
            None => true,
        };
        if !newer {
            return Ok(None);
        }
        for layer in &self.local {
            layer.update(&remote).await?;
        }
        Ok(Some(remote))
    }

    async fn local_record(&self) -> Result<Option<CertRecord>, ListenerError> {
        for layer in &self.local {
            if let Some(record) = layer.get().await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}
