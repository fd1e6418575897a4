//! Durable storage for the persisted identity.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::trace;

use crate::error::{BridgeError, BridgeResult};

/// Bytes escaped in file names; `%` itself is escaped, so distinct keys never
/// share a file.
const FILE_NAME: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Key/value storage that survives process restarts.
///
/// Values are opaque strings; parsing and validation happen in
/// [`CredentialStore`](super::CredentialStore).
#[async_trait]
pub trait IdentityStorage: Send + Sync + fmt::Debug {
    /// Read the value stored under `key`
    async fn read(&self, key: &str) -> BridgeResult<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    async fn write(&self, key: &str, value: &str) -> BridgeResult<()>;

    /// Remove the value stored under `key`; removing a missing key succeeds
    async fn remove(&self, key: &str) -> BridgeResult<()>;
}

/// In-memory storage, for tests and ephemeral hosts
#[derive(Debug, Default)]
pub struct MemoryIdentityStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryIdentityStorage {
    /// Create empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage pre-populated with one entry
    pub fn with_entry(key: impl Into<String>, value: impl Into<String>) -> Self {
        let storage = Self::new();
        storage.entries.lock().insert(key.into(), value.into());
        storage
    }

    /// Synchronous peek, for assertions
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }
}

#[async_trait]
impl IdentityStorage for MemoryIdentityStorage {
    async fn read(&self, key: &str) -> BridgeResult<Option<String>> {
        Ok(self.get(key))
    }

    async fn write(&self, key: &str, value: &str) -> BridgeResult<()> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> BridgeResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One JSON file per key inside a directory.
///
/// Writes go through a temporary file and a rename so a crash never leaves a
/// half-written identity behind.
#[derive(Debug, Clone)]
pub struct FileIdentityStorage {
    dir: PathBuf,
}

impl FileIdentityStorage {
    /// Store files under `dir`, created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the identity files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", utf8_percent_encode(key, FILE_NAME)))
    }
}

#[async_trait]
impl IdentityStorage for FileIdentityStorage {
    async fn read(&self, key: &str) -> BridgeResult<Option<String>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BridgeError::Storage(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn write(&self, key: &str, value: &str) -> BridgeResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        trace!(path = %path.display(), "Persisted identity");
        Ok(())
    }

    async fn remove(&self, key: &str) -> BridgeResult<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
