use std::collections::HashMap;

use thiserror::Error;

use crate::{
    config::{CREDENTIALS_PASSWORD_KEY, CREDENTIALS_SSID_KEY},
    types::NetworkCredentials,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("failed to read key `{key}`: {details}")]
    Read { key: &'static str, details: String },
    #[error("failed to write key `{key}`: {details}")]
    Write { key: &'static str, details: String },
}

/// String entries of one persistent namespace.
pub trait KeyValueStore {
    fn get_str(&self, key: &'static str) -> Result<Option<String>, StoreError>;
    fn set_str(&mut self, key: &'static str, value: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    entries: HashMap<&'static str, String>,
    writes: usize,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get_str(&self, key: &'static str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set_str(&mut self, key: &'static str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key, value.to_string());
        self.writes += 1;
        Ok(())
    }
}

/// Persists the single station credential pair. No validation happens here.
#[derive(Debug)]
pub struct CredentialStore<K> {
    backend: K,
}

impl<K: KeyValueStore> CredentialStore<K> {
    pub fn new(backend: K) -> Self {
        Self { backend }
    }

    pub fn load(&self) -> Result<Option<NetworkCredentials>, StoreError> {
        let ssid = self.backend.get_str(CREDENTIALS_SSID_KEY)?.unwrap_or_default();
        let password = self
            .backend
            .get_str(CREDENTIALS_PASSWORD_KEY)?
            .unwrap_or_default();

        let credentials = NetworkCredentials { ssid, password };
        Ok(credentials.is_complete().then_some(credentials))
    }

    pub fn save(&mut self, credentials: &NetworkCredentials) -> Result<(), StoreError> {
        self.backend
            .set_str(CREDENTIALS_SSID_KEY, &credentials.ssid)?;
        self.backend
            .set_str(CREDENTIALS_PASSWORD_KEY, &credentials.password)?;
        Ok(())
    }

    pub fn backend(&self) -> &K {
        &self.backend
    }
}
