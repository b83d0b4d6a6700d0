// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Typed preferences port over any config service.

use crate::config::{ConfigService, ConfigStore};
use crate::prefs::{ServicePrefs, SERVICE_PREFS_KEY};
use tracing::warn;

/// Loading/saving of the subscription service preferences.
pub trait ConfigPort {
    /// Load the service preferences (`None` if missing or unreadable).
    fn load_prefs(&self) -> Option<ServicePrefs>;
    /// Persist the service preferences (best-effort; failures are logged).
    fn save_prefs(&self, prefs: &ServicePrefs);
}

impl<S: ConfigStore> ConfigPort for ConfigService<S> {
    fn load_prefs(&self) -> Option<ServicePrefs> {
        self.load(SERVICE_PREFS_KEY).ok().flatten()
    }

    fn save_prefs(&self, prefs: &ServicePrefs) {
        if let Err(err) = self.save(SERVICE_PREFS_KEY, prefs) {
            warn!(key = SERVICE_PREFS_KEY, error = %err, "saving service preferences failed");
        }
    }
}
