//! Key/value blob persistence contract consumed by the alarm store.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed for {namespace}/{key}: {source}")]
    Io {
        namespace: String,
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("storage backend error for {namespace}/{key}: {message}")]
    Backend {
        namespace: String,
        key: String,
        message: String,
    },
    #[error("stored value {namespace}/{key} is malformed")]
    Malformed { namespace: String, key: String },
}

impl StoreError {
    pub fn backend(namespace: &str, key: &str, message: impl Into<String>) -> Self {
        Self::Backend {
            namespace: namespace.to_string(),
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Synchronous blob store. A successful save must be durable before it returns.
pub trait BlobStore {
    fn load_blob(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn save_blob(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    fn erase(&self, namespace: &str, key: &str) -> Result<(), StoreError>;

    fn load_u32(&self, namespace: &str, key: &str) -> Result<Option<u32>, StoreError> {
        match self.load_blob(namespace, key)? {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| StoreError::Malformed {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                })?;
                Ok(Some(u32::from_be_bytes(raw)))
            }
        }
    }

    fn save_u32(&self, namespace: &str, key: &str, value: u32) -> Result<(), StoreError> {
        self.save_blob(namespace, key, &value.to_be_bytes())
    }
}

impl<T: BlobStore + ?Sized> BlobStore for &T {
    fn load_blob(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).load_blob(namespace, key)
    }

    fn save_blob(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        (**self).save_blob(namespace, key, bytes)
    }

    fn erase(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        (**self).erase(namespace, key)
    }

    fn load_u32(&self, namespace: &str, key: &str) -> Result<Option<u32>, StoreError> {
        (**self).load_u32(namespace, key)
    }

    fn save_u32(&self, namespace: &str, key: &str, value: u32) -> Result<(), StoreError> {
        (**self).save_u32(namespace, key, value)
    }
}

impl<T: BlobStore + ?Sized> BlobStore for Arc<T> {
    fn load_blob(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).load_blob(namespace, key)
    }

    fn save_blob(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        (**self).save_blob(namespace, key, bytes)
    }

    fn erase(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        (**self).erase(namespace, key)
    }
}

/// Volatile store for tests and simulation runs without a data directory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
    fail_saves: Mutex<bool>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following save fail, simulating a broken flash partition.
    pub fn set_fail_saves(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_saves.lock() {
            *flag = fail;
        }
    }

    pub fn contains(&self, namespace: &str, key: &str) -> bool {
        self.blobs
            .lock()
            .map(|blobs| blobs.contains_key(&(namespace.to_string(), key.to_string())))
            .unwrap_or(false)
    }

    fn poisoned(namespace: &str, key: &str) -> StoreError {
        StoreError::backend(namespace, key, "memory store lock poisoned")
    }
}

impl BlobStore for MemoryBlobStore {
    fn load_blob(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| Self::poisoned(namespace, key))?;
        Ok(blobs.get(&(namespace.to_string(), key.to_string())).cloned())
    }

    fn save_blob(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let failing = self
            .fail_saves
            .lock()
            .map(|flag| *flag)
            .map_err(|_| Self::poisoned(namespace, key))?;
        if failing {
            return Err(StoreError::backend(namespace, key, "write rejected"));
        }

        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| Self::poisoned(namespace, key))?;
        blobs.insert((namespace.to_string(), key.to_string()), bytes.to_vec());
        Ok(())
    }

    fn erase(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| Self::poisoned(namespace, key))?;
        blobs.remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}
