use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fs::{self, FileTimes};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Role name (e.g. `ServerCA`) to the on-disk location of that file.
pub type BundleRoleMap = BTreeMap<String, PathBuf>;

/// CA, certificate, and key material keyed by role name.
pub type Bundle = BTreeMap<String, BundleFile>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFile {
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(
        rename = "Content",
        serialize_with = "serialize_content",
        deserialize_with = "deserialize_content"
    )]
    pub content: Vec<u8>,
}

fn serialize_content<S: Serializer>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(content))
}

fn deserialize_content<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}

/// Reads every mapped file into a bundle. Unreadable files are skipped since
/// not every role exists in every deployment mode.
pub fn read_from_disk(roles: &BundleRoleMap) -> Result<Bundle, BundleError> {
    let mut bundle = Bundle::new();
    for (role, path) in roles {
        if path.as_os_str().is_empty() {
            continue;
        }
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(err) => {
                warn!(
                    "event=bootstrap_file_skipped role={} path={} error={err}",
                    role,
                    path.display()
                );
                continue;
            }
        };
        let modified = fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map_err(|source| BundleError::io(path, IoStage::Stat, source))?;
        bundle.insert(
            role.clone(),
            BundleFile {
                timestamp: DateTime::<Utc>::from(modified),
                content,
            },
        );
    }
    Ok(bundle)
}

/// Writes each bundle entry that has a mapped path, restoring its recorded
/// modification time. Stops at the first failure.
pub fn write_to_disk(bundle: &Bundle, roles: &BundleRoleMap) -> Result<(), BundleError> {
    for (role, file) in bundle {
        let Some(path) = roles.get(role) else {
            continue;
        };
        if path.as_os_str().is_empty() {
            continue;
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_private_dir(parent)
                    .map_err(|source| BundleError::io(parent, IoStage::Mkdir, source))?;
            }
        }
        fs::write(path, &file.content)
            .map_err(|source| BundleError::io(path, IoStage::Write, source))?;
        restrict_permissions(path).map_err(|source| BundleError::io(path, IoStage::Chmod, source))?;
        let timestamp = SystemTime::from(file.timestamp);
        fs::File::options()
            .write(true)
            .open(path)
            .and_then(|handle| {
                handle.set_times(
                    FileTimes::new()
                        .set_accessed(timestamp)
                        .set_modified(timestamp),
                )
            })
            .map_err(|source| BundleError::io(path, IoStage::Chtime, source))?;
    }
    Ok(())
}

pub fn encode_bundle(bundle: &Bundle) -> Result<Vec<u8>, BundleError> {
    Ok(serde_json::to_vec(bundle)?)
}

pub fn decode_bundle(bytes: &[u8]) -> Result<Bundle, BundleError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStage {
    Stat,
    Mkdir,
    Write,
    Chmod,
    Chtime,
}

impl std::fmt::Display for IoStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            IoStage::Stat => "stat",
            IoStage::Mkdir => "mkdir",
            IoStage::Write => "write",
            IoStage::Chmod => "chmod",
            IoStage::Chtime => "update modified time on",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("failed to {stage} {path:?}: {source}")]
    Io {
        path: PathBuf,
        stage: IoStage,
        source: io::Error,
    },
    #[error("bundle serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BundleError {
    fn io(path: &Path, stage: IoStage, source: io::Error) -> Self {
        BundleError::Io {
            path: path.to_path_buf(),
            stage,
            source,
        }
    }
}
