// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Manager tuning.
use std::time::Duration;

use crate::dispatcher::DispatcherConfig;
use crate::index::DEFAULT_CACHE_CAP;

/// Timers and caps of a [`SubscriptionManager`](crate::SubscriptionManager).
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Period of heartbeat publication and eviction checks.
    pub heartbeat_interval: Duration,
    /// Subscriptions without a client heartbeat for this long are removed.
    pub eviction_timeout: Duration,
    /// Period of unconditional full refreshes.
    pub refresh_interval: Duration,
    /// Debounce tuning.
    pub dispatcher: DispatcherConfig,
    /// Cap of the resolve and membership caches.
    pub cache_cap: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            eviction_timeout: Duration::from_secs(120),
            refresh_interval: Duration::from_secs(300),
            dispatcher: DispatcherConfig::default(),
            cache_cap: DEFAULT_CACHE_CAP,
        }
    }
}
