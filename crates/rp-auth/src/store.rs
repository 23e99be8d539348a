use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::errors::{AuthError, StoreError};

/// Durable key-value persistence for session records.
///
/// Values are opaque bytes; validation belongs to the session codec.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    /// Read the raw record stored under `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the record stored under `key`
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Delete the record stored under `key` (missing keys are not an error)
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    async fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }

    /// Write several records as one logical update
    async fn set_many(&self, entries: &[(&str, Vec<u8>)]) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.set(key, value).await?;
        }
        Ok(())
    }
}

/// In-memory credential store for testing and ephemeral sessions
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    records: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records
            .read()
            .map(|records| records.contains_key(key))
            .unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<String> {
        self.records
            .read()
            .ok()
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .records
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .remove(key);
        Ok(())
    }

    async fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        for key in keys {
            records.remove(*key);
        }
        Ok(())
    }

    async fn set_many(&self, entries: &[(&str, Vec<u8>)]) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        for (key, value) in entries {
            records.insert(key.to_string(), value.clone());
        }
        Ok(())
    }
}

/// Serialize `value` as JSON and store it under `key`
pub(crate) async fn put_json<T: Serialize + ?Sized>(
    store: &dyn CredentialStore,
    key: &str,
    value: &T,
) -> Result<(), AuthError> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, &bytes).await?;
    Ok(())
}
