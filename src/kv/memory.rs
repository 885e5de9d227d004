use super::{KeyValue, KvClient, KvError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// In-process linearizable store. Every mutation holds one lock, so
/// `create` is an atomic create-if-absent across tasks sharing the value.
#[derive(Debug, Default)]
pub struct MemoryKv {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<String, Entry>,
    revision: u64,
    faults: Faults,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    revision: u64,
}

#[derive(Debug, Default)]
struct Faults {
    learner: bool,
    fail_deletes: bool,
    crash_after_create: bool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects writes the way a non-voting replica does.
    pub fn set_learner(&self, learner: bool) {
        self.state.lock().faults.learner = learner;
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.state.lock().faults.fail_deletes = fail;
    }

    /// The next `create` is applied and then reported as a transport failure,
    /// as if the caller died right after the write landed.
    pub fn crash_after_next_create(&self) {
        self.state.lock().faults.crash_after_create = true;
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().records.keys().cloned().collect()
    }

    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }
}

impl MemoryState {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn check_writable(&self) -> Result<(), KvError> {
        if self.faults.learner {
            return Err(KvError::LearnerRestricted);
        }
        Ok(())
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        let mut state = self.state.lock();
        state.check_writable()?;
        if state.records.contains_key(key) {
            return Err(KvError::KeyExists {
                key: key.to_string(),
            });
        }
        let revision = state.next_revision();
        state
            .records
            .insert(key.to_string(), Entry { value, revision });
        if std::mem::take(&mut state.faults.crash_after_create) {
            return Err(KvError::Unavailable("injected crash after create".into()));
        }
        Ok(())
    }

    async fn update(&self, key: &str, revision: u64, value: Vec<u8>) -> Result<(), KvError> {
        let mut state = self.state.lock();
        state.check_writable()?;
        let current = match state.records.get(key) {
            Some(entry) => entry.revision,
            None => {
                return Err(KvError::NotFound {
                    key: key.to_string(),
                })
            }
        };
        if current != revision {
            return Err(KvError::RevisionMismatch {
                key: key.to_string(),
            });
        }
        let revision = state.next_revision();
        state
            .records
            .insert(key.to_string(), Entry { value, revision });
        Ok(())
    }

    async fn delete(&self, key: &str, revision: u64) -> Result<(), KvError> {
        let mut state = self.state.lock();
        state.check_writable()?;
        if state.faults.fail_deletes {
            return Err(KvError::Unavailable("injected delete failure".into()));
        }
        let current = match state.records.get(key) {
            Some(entry) => entry.revision,
            None => {
                return Err(KvError::NotFound {
                    key: key.to_string(),
                })
            }
        };
        if revision != 0 && current != revision {
            return Err(KvError::RevisionMismatch {
                key: key.to_string(),
            });
        }
        state.records.remove(key);
        state.next_revision();
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<KeyValue>, KvError> {
        let state = self.state.lock();
        let matching = state
            .records
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
                revision: entry.revision,
            });
        Ok(if limit == 0 {
            matching.collect()
        } else {
            matching.take(limit).collect()
        })
    }
}
