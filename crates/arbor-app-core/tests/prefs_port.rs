// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
//! Preferences through the config port.

use std::cell::RefCell;
use std::collections::BTreeMap;

use arbor_app_core::config::{ConfigError, ConfigService, ConfigStore};
use arbor_app_core::config_port::ConfigPort;
use arbor_app_core::prefs::{ServicePrefs, SERVICE_PREFS_KEY};

#[derive(Default)]
struct MemStore(RefCell<BTreeMap<String, Vec<u8>>>);

impl ConfigStore for MemStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        self.0.borrow().get(key).cloned().ok_or(ConfigError::NotFound)
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        self.0.borrow_mut().insert(key.to_owned(), data.to_vec());
        Ok(())
    }
}

#[test]
fn prefs_round_trip_under_their_key() {
    let service = ConfigService::new(MemStore::default());
    assert!(service.load_prefs().is_none());

    let prefs = ServicePrefs {
        databases: vec!["default".into(), "users".into()],
        refresh_secs: 42,
        ..ServicePrefs::default()
    };
    service.save_prefs(&prefs);
    assert_eq!(service.load_prefs(), Some(prefs));
    assert!(service.into_inner().0.borrow().contains_key(SERVICE_PREFS_KEY));
}

#[test]
fn unreadable_prefs_load_as_none() {
    let store = MemStore::default();
    let _ = store.save_raw(SERVICE_PREFS_KEY, b"[1, 2");
    assert!(ConfigService::new(store).load_prefs().is_none());
}

struct ReadOnlyStore;

impl ConfigStore for ReadOnlyStore {
    fn load_raw(&self, _key: &str) -> Result<Vec<u8>, ConfigError> {
        Err(ConfigError::NotFound)
    }

    fn save_raw(&self, _key: &str, _data: &[u8]) -> Result<(), ConfigError> {
        Err(ConfigError::Other("read-only".into()))
    }
}

#[test]
fn failed_saves_are_swallowed_after_logging() {
    let service = ConfigService::new(ReadOnlyStore);
    service.save_prefs(&ServicePrefs::default());
    assert!(service.load_prefs().is_none());
}
