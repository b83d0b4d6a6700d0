// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persisted tuning of the subscription service.
//!
//! Durations are stored as plain seconds or milliseconds so the JSON stays
//! hand-editable. Every field has a default; a partial file fills the rest.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Config key the service preferences are stored under.
pub const SERVICE_PREFS_KEY: &str = "subs_service";

/// Saved preferences of `arbor-subs-service`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicePrefs {
    /// Databases served. Each gets an empty schema when no schema file names it.
    pub databases: Vec<String>,
    /// JSON file with the schemas of every database.
    pub schema_path: Option<PathBuf>,
    /// Heartbeat period (seconds).
    pub heartbeat_secs: u64,
    /// Subscriptions without a client heartbeat for this long are dropped (seconds).
    pub eviction_secs: u64,
    /// Period of unconditional full refreshes (seconds).
    pub refresh_secs: u64,
    /// Debounce tuning.
    pub dispatch: DispatchPrefs,
    /// Cap of the resolve and membership caches.
    pub cache_cap: usize,
}

impl Default for ServicePrefs {
    fn default() -> Self {
        Self {
            databases: vec!["default".to_owned()],
            schema_path: None,
            heartbeat_secs: 30,
            eviction_secs: 120,
            refresh_secs: 300,
            dispatch: DispatchPrefs::default(),
            cache_cap: 100_000,
        }
    }
}

impl ServicePrefs {
    /// Heartbeat period.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Eviction timeout.
    pub fn eviction(&self) -> Duration {
        Duration::from_secs(self.eviction_secs)
    }

    /// Full-refresh period.
    pub fn refresh(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }
}

/// Update dispatcher tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchPrefs {
    /// Debounce after the first staged subscription (ms).
    pub initial_window_ms: u64,
    /// First slow window under load (ms).
    pub slow_window_ms: u64,
    /// Events since the last drain at which the process counts as busy.
    pub busy_threshold: u64,
    /// Events per millisecond above which a slow window keeps growing.
    pub escalation_rate: u64,
    /// Growth factor of the slow window.
    pub growth: f64,
    /// Longest a staged subscription waits (ms).
    pub ceiling_ms: u64,
}

impl Default for DispatchPrefs {
    fn default() -> Self {
        Self {
            initial_window_ms: 10,
            slow_window_ms: 1000,
            busy_threshold: 1000,
            escalation_rate: 3,
            growth: 1.1,
            ceiling_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn partial_files_keep_the_other_defaults() {
        let prefs: ServicePrefs =
            serde_json::from_str(r#"{ "refresh_secs": 60, "dispatch": { "ceiling_ms": 2000 } }"#).unwrap();
        assert_eq!(prefs.refresh(), Duration::from_secs(60));
        assert_eq!(prefs.eviction(), Duration::from_secs(120));
        assert_eq!(prefs.dispatch.ceiling_ms, 2000);
        assert_eq!(prefs.dispatch.initial_window_ms, 10);
        assert_eq!(prefs.databases, vec!["default".to_owned()]);
    }
}
