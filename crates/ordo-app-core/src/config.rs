// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Config service and storage port.
//!
//! Values are stored as pretty JSON blobs keyed by a logical name; the store
//! decides where the bytes live (filesystem, memory, ...).

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Storage port for raw config blobs (keyed by logical name).
pub trait ConfigStore {
    /// Load a raw config blob. Returns `NotFound` when missing.
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Persist a raw config blob.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Error type for config operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Key not present in store.
    #[error("not found")]
    NotFound,
    /// I/O error while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization/deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Catch-all error variant.
    #[error("other: {0}")]
    Other(String),
}

/// Thin service that serializes config values and delegates storage to a `ConfigStore`.
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Create a new service using the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Consume the service and return the inner store.
    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S> ConfigService<S>
where
    S: ConfigStore,
{
    /// Load and deserialize a config value for `key`. Returns `Ok(None)` if missing.
    pub fn load<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: DeserializeOwned,
    {
        match self.store.load_raw(key) {
            Ok(bytes) => {
                if bytes.is_empty() {
                    return Ok(None);
                }
                let value = serde_json::from_slice(&bytes)?;
                Ok(Some(value))
            }
            Err(ConfigError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Load `key`, falling back to `T::default()` when it is missing or
    /// unreadable. Unreadable values are reported through the returned error
    /// slot so callers can log them without aborting startup.
    pub fn load_or_default<T>(&self, key: &str) -> (T, Option<ConfigError>)
    where
        T: DeserializeOwned + Default,
    {
        match self.load(key) {
            Ok(Some(value)) => (value, None),
            Ok(None) => (T::default(), None),
            Err(err) => (T::default(), Some(err)),
        }
    }

    /// Serialize and persist a config value for `key`.
    pub fn save<T>(&self, key: &str, value: &T) -> Result<(), ConfigError>
    where
        T: Serialize,
    {
        let data = serde_json::to_vec_pretty(value)?;
        self.store.save_raw(key, &data)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::prefs::{SequencerPrefs, TickState, TICK_STATE_KEY};
    use ordo_proto::BlobType;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemStore {
        data: RefCell<HashMap<String, Vec<u8>>>,
    }

    impl ConfigStore for MemStore {
        fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
            self.data
                .borrow()
                .get(key)
                .cloned()
                .ok_or(ConfigError::NotFound)
        }

        fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
            self.data.borrow_mut().insert(key.to_owned(), data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn missing_key_loads_as_none() {
        let svc = ConfigService::new(MemStore::default());
        assert_eq!(svc.load::<TickState>(TICK_STATE_KEY).unwrap(), None);
    }

    #[test]
    fn saved_values_load_back() {
        let svc = ConfigService::new(MemStore::default());
        svc.save(TICK_STATE_KEY, &TickState { tick: 41 }).unwrap();
        assert_eq!(
            svc.load::<TickState>(TICK_STATE_KEY).unwrap(),
            Some(TickState { tick: 41 })
        );
    }

    #[test]
    fn older_prefs_fill_in_defaults() {
        let store = MemStore::default();
        store
            .save_raw("sequencer", br#"{"socket_path":"/tmp/x.sock"}"#)
            .unwrap();
        let prefs: SequencerPrefs = ConfigService::new(store).load("sequencer").unwrap().unwrap();
        assert_eq!(prefs.socket_path, "/tmp/x.sock");
        assert_eq!(prefs.blob, BlobType::Cbor);
    }

    #[test]
    fn corrupt_value_falls_back_to_default_with_error() {
        let store = MemStore::default();
        store.save_raw(TICK_STATE_KEY, b"{not json").unwrap();
        let (state, err) = ConfigService::new(store).load_or_default::<TickState>(TICK_STATE_KEY);
        assert_eq!(state, TickState::default());
        assert!(matches!(err, Some(ConfigError::Serde(_))));
    }

    #[test]
    fn empty_blob_is_treated_as_missing() {
        let store = MemStore::default();
        store.save_raw("sequencer", b"").unwrap();
        let loaded: Option<SequencerPrefs> = ConfigService::new(store).load("sequencer").unwrap();
        assert!(loaded.is_none());
    }
}
