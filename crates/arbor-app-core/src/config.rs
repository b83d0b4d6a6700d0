// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Config service and storage port for arbor tools.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Where config blobs live. Keys are logical names such as `subs_service`.
pub trait ConfigStore {
    /// Raw bytes stored under `key`; [`ConfigError::NotFound`] when absent.
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Replaces the bytes stored under `key`.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Failure of a config load or save.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Nothing stored under the key.
    #[error("config key not found")]
    NotFound,
    /// Backing store I/O failed.
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    /// Stored bytes are not the expected JSON.
    #[error("config json: {0}")]
    Serde(#[from] serde_json::Error),
    /// Adapter-specific failure.
    #[error("config: {0}")]
    Other(String),
}

/// Serializes config values as JSON and delegates storage to a `ConfigStore`.
#[derive(Debug)]
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Service over `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Unwraps the store.
    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S> ConfigService<S>
where
    S: ConfigStore,
{
    /// Load and deserialize the value under `key`. `Ok(None)` when missing or empty.
    pub fn load<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: DeserializeOwned,
    {
        let bytes = match self.store.load_raw(key) {
            Ok(bytes) => bytes,
            Err(ConfigError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Serialize and persist `value` under `key`.
    pub fn save<T>(&self, key: &str, value: &T) -> Result<(), ConfigError>
    where
        T: Serialize,
    {
        let data = serde_json::to_vec_pretty(value)?;
        self.store.save_raw(key, &data)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MapStore(RefCell<BTreeMap<String, Vec<u8>>>);

    impl ConfigStore for MapStore {
        fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
            self.0.borrow().get(key).cloned().ok_or(ConfigError::NotFound)
        }

        fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
            self.0.borrow_mut().insert(key.to_owned(), data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn missing_and_empty_keys_load_as_none() {
        let store = MapStore::default();
        store.save_raw("empty", b"").unwrap();
        let service = ConfigService::new(store);
        assert!(service.load::<u32>("absent").unwrap().is_none());
        assert!(service.load::<u32>("empty").unwrap().is_none());
    }

    #[test]
    fn values_survive_a_save() {
        let service = ConfigService::new(MapStore::default());
        service.save("answer", &vec![4, 2]).unwrap();
        assert_eq!(service.load::<Vec<u8>>("answer").unwrap(), Some(vec![4, 2]));
    }

    #[test]
    fn garbage_is_a_serde_error() {
        let store = MapStore::default();
        store.save_raw("bad", b"{not json").unwrap();
        let service = ConfigService::new(store);
        assert!(matches!(service.load::<u32>("bad"), Err(ConfigError::Serde(_))));
    }
}
