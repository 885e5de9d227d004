use super::bundle::{decode_bundle, encode_bundle, Bundle, BundleError};
use super::crypto::{self, CryptoError};
use super::token::{normalize_token, storage_key, TokenError, BOOTSTRAP_PREFIX};
use crate::kv::{KeyValue, KvClient, KvError};
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Result of looking up the bootstrap record for a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No record exists under `/bootstrap`; this process owns the first save.
    FirstTime,
    Found { bundle: Bundle, record: KeyValue },
}

impl LoadOutcome {
    pub fn is_first_time(&self) -> bool {
        matches!(self, LoadOutcome::FirstTime)
    }
}

/// Persists the encrypted bundle in the shared KV namespace and migrates
/// records left under legacy keys.
///
/// Every store call races against `cancel`; nothing is cached between calls,
/// so any operation can be interrupted and re-run from the top.
#[derive(Clone)]
pub struct BootstrapStore {
    kv: Arc<dyn KvClient>,
    cancel: CancellationToken,
}

struct TokenKeys {
    raw: String,
    secret: String,
    current: String,
}

impl TokenKeys {
    fn new(raw_token: &str) -> Result<Self, TokenError> {
        let secret = normalize_token(raw_token)?;
        let current = storage_key(&secret);
        Ok(Self {
            raw: raw_token.to_string(),
            secret,
            current,
        })
    }
}

impl BootstrapStore {
    pub fn new(kv: Arc<dyn KvClient>, cancel: CancellationToken) -> Self {
        Self { kv, cancel }
    }

    pub fn kv(&self) -> &Arc<dyn KvClient> {
        &self.kv
    }

    /// Encrypts `bundle` under the token and creates the record. Losing the
    /// create race to another writer is success unless `override_existing`
    /// asks to replace the stored record.
    pub async fn save(
        &self,
        bundle: &Bundle,
        raw_token: &str,
        override_existing: bool,
    ) -> Result<(), BootstrapError> {
        let keys = TokenKeys::new(raw_token)?;
        let plaintext = encode_bundle(bundle)?;
        let sealed = crypto::encrypt(&keys.secret, &plaintext)?;

        self.lookup(&keys).await?;

        match self.call(self.kv.create(&keys.current, sealed.clone())).await {
            Ok(()) => {
                info!("event=bootstrap_saved key={}", keys.current);
                Ok(())
            }
            Err(KvError::KeyExists { .. }) => {
                warn!("event=bootstrap_key_exists key={}", keys.current);
                if !override_existing {
                    return Ok(());
                }
                let existing = self.single_record().await?;
                self.call(self.kv.update(&keys.current, existing.revision, sealed))
                    .await?;
                info!(
                    "event=bootstrap_overwritten key={} revision={}",
                    keys.current, existing.revision
                );
                Ok(())
            }
            Err(KvError::LearnerRestricted) => {
                debug!("event=bootstrap_save_skipped reason=learner");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fetches and decrypts the record for the token, migrating legacy keys
    /// first.
    pub async fn load(&self, raw_token: &str) -> Result<LoadOutcome, BootstrapError> {
        let keys = TokenKeys::new(raw_token)?;
        let Some(record) = self.lookup(&keys).await? else {
            return Ok(LoadOutcome::FirstTime);
        };
        let plaintext = crypto::decrypt(&keys.secret, &record.value)?;
        let bundle = decode_bundle(&plaintext)?;
        Ok(LoadOutcome::Found { bundle, record })
    }

    /// `None` when the namespace is empty; otherwise the record stored under
    /// the current token's key after migration.
    async fn lookup(&self, keys: &TokenKeys) -> Result<Option<KeyValue>, BootstrapError> {
        let records = self.list_bootstrap().await?;
        if records.is_empty() {
            return Ok(None);
        }
        if records.len() > 1 {
            warn!("event=bootstrap_multiple_keys count={}", records.len());
        }

        self.migrate_legacy(&records, keys).await?;

        let records = self.list_bootstrap().await?;
        records
            .into_iter()
            .find(|record| record.key == keys.current)
            .map(Some)
            .ok_or(BootstrapError::TokenMismatch)
    }

    async fn migrate_legacy(
        &self,
        records: &[KeyValue],
        keys: &TokenKeys,
    ) -> Result<(), BootstrapError> {
        let empty_key = storage_key("");
        let raw_key = storage_key(&keys.raw);
        for record in records {
            if record.key == keys.current {
                continue;
            }
            if record.key == empty_key {
                warn!(
                    "event=bootstrap_migrate source=empty_token from={} to={}",
                    record.key, keys.current
                );
                self.migrate_record(record, "", &keys.secret, &keys.current)
                    .await?;
            } else if record.key == raw_key {
                warn!(
                    "event=bootstrap_migrate source=raw_token from={} to={}",
                    record.key, keys.current
                );
                self.migrate_record(record, &keys.raw, &keys.secret, &keys.current)
                    .await?;
            }
        }
        Ok(())
    }

    /// Re-encrypts `record` under the new secret, writes the new key, then
    /// removes the old one. The delete only runs after the write landed.
    async fn migrate_record(
        &self,
        record: &KeyValue,
        old_secret: &str,
        new_secret: &str,
        new_key: &str,
    ) -> Result<(), BootstrapError> {
        let plaintext = crypto::decrypt(old_secret, &record.value)?;
        let sealed = crypto::encrypt(new_secret, &plaintext)?;
        match self.call(self.kv.create(new_key, sealed)).await {
            Ok(()) => {}
            Err(KvError::KeyExists { .. }) => {
                warn!("event=bootstrap_migrate_target_exists key={new_key}");
            }
            Err(KvError::LearnerRestricted) => {
                debug!("event=bootstrap_migrate_skipped reason=learner");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        if let Err(err) = self.call(self.kv.delete(&record.key, record.revision)).await {
            warn!(
                "event=bootstrap_legacy_delete_failed key={} error={err}",
                record.key
            );
        }
        Ok(())
    }

    async fn single_record(&self) -> Result<KeyValue, BootstrapError> {
        let mut records = self.list_bootstrap().await?;
        match records.len() {
            0 => Err(BootstrapError::NoBootstrapData),
            1 => Ok(records.remove(0)),
            count => Err(BootstrapError::MultipleBootstrapKeys { count }),
        }
    }

    async fn list_bootstrap(&self) -> Result<Vec<KeyValue>, KvError> {
        let prefix = format!("{BOOTSTRAP_PREFIX}/");
        self.call(self.kv.list(&prefix, 0)).await
    }

    async fn call<T, F>(&self, fut: F) -> Result<T, KvError>
    where
        F: Future<Output = Result<T, KvError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(KvError::Cancelled),
            result = fut => result,
        }
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("bootstrap data already found and encrypted with different token")]
    TokenMismatch,
    #[error("no bootstrap data found")]
    NoBootstrapData,
    #[error("found {count} bootstrap keys in storage, expected one")]
    MultipleBootstrapKeys { count: usize },
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
}
