//! Durable key/value storage for experiment state.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::StorageError;
use crate::utils::fs::write_atomic;

/// A string key/value store.
pub trait StateStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Stores every key as a JSON file in a directory.
#[derive(Debug)]
pub struct FsStateStore {
    dir: PathBuf,
}

impl FsStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
                _ => '_',
            })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }
}

impl StateStore for FsStateStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        write_atomic(&self.path(key), value.as_bytes())?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path(key)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// A [`StateStore`] that only lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: Mutex<HashMap<String, String>>,
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.values.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.values.lock().remove(key);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PendingWrites {
    /// The latest unwritten value per key, `None` removes the key.
    values: BTreeMap<String, Option<String>>,
    draining: bool,
    writer: Option<JoinHandle<()>>,
}

/// Writes to a [`StateStore`] in the background.
///
/// Inside a tokio runtime the store is written from the blocking pool, outside of one
/// writes happen on the calling thread. Reads see pending writes. A single writer
/// drains the pending values, so the store always ends up with the latest value of
/// every key.
#[derive(Debug)]
pub struct StateWriter {
    store: Arc<dyn StateStore>,
    pending: Mutex<PendingWrites>,
}

impl StateWriter {
    pub fn new(store: Arc<dyn StateStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            pending: Mutex::default(),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        if let Some(value) = self.pending.lock().values.get(key) {
            return Ok(value.clone());
        }
        self.store.get(key)
    }

    pub fn set(self: &Arc<Self>, key: &str, value: &str) {
        self.enqueue(key, Some(value.to_owned()));
    }

    pub fn remove(self: &Arc<Self>, key: &str) {
        self.enqueue(key, None);
    }

    fn enqueue(self: &Arc<Self>, key: &str, value: Option<String>) {
        let mut pending = self.pending.lock();
        pending.values.insert(key.to_owned(), value);
        if pending.draining {
            return;
        }
        pending.draining = true;

        match Handle::try_current() {
            Ok(runtime) => {
                let writer = self.clone();
                pending.writer = Some(runtime.spawn_blocking(move || writer.drain()));
            }
            Err(_) => {
                drop(pending);
                self.drain();
            }
        }
    }

    fn drain(&self) {
        loop {
            let (key, value) = {
                let mut pending = self.pending.lock();
                match pending.values.iter().next() {
                    Some((key, value)) => (key.clone(), value.clone()),
                    None => {
                        pending.draining = false;
                        return;
                    }
                }
            };

            let result = match &value {
                Some(value) => self.store.set(&key, value),
                None => self.store.remove(&key),
            };
            if let Err(e) = result {
                let dynerr: &dyn std::error::Error = &e;
                tracing::error!(error = dynerr, %key, "failed to write state");
            }

            // a newer value stays pending for the next round
            let mut pending = self.pending.lock();
            if pending.values.get(&key) == Some(&value) {
                pending.values.remove(&key);
            }
        }
    }

    /// Waits until every pending write has reached the store.
    pub async fn flush(&self) {
        loop {
            let Some(writer) = self.pending.lock().writer.take() else {
                return;
            };
            if let Err(e) = writer.await {
                tracing::error!(error = %e, "state writer panicked");
            }
        }
    }
}
